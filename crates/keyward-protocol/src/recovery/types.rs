/// Recovery requests and steward responses.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::message::CustodyMessage;
use crate::sharing::ShardData;
use crate::types::VaultId;

// ── Constants ────────────────────────────────────────────────────────────

/// Default lifetime of a recovery request (7 days).
pub const DEFAULT_RECOVERY_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1000;

// ── RecoveryStatus ───────────────────────────────────────────────────────

/// `Pending → Sent → InProgress → {Completed | Failed | Cancelled} → Archived`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryStatus {
    Pending,
    /// Every steward's copy was accepted by the channel.
    Sent,
    /// At least one response recorded.
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Archived,
}

impl RecoveryStatus {
    /// Still collecting responses.
    pub fn is_open(&self) -> bool {
        match self {
            RecoveryStatus::Pending | RecoveryStatus::Sent | RecoveryStatus::InProgress => true,
            RecoveryStatus::Completed
            | RecoveryStatus::Failed
            | RecoveryStatus::Cancelled
            | RecoveryStatus::Archived => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }

    pub fn description(&self) -> &'static str {
        match self {
            RecoveryStatus::Pending => "sending request to stewards",
            RecoveryStatus::Sent => "waiting for stewards",
            RecoveryStatus::InProgress => "collecting responses",
            RecoveryStatus::Completed => "secret recovered",
            RecoveryStatus::Failed => "recovery failed",
            RecoveryStatus::Cancelled => "cancelled",
            RecoveryStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a request failed for good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryFailure {
    InsufficientApprovals {
        approved: usize,
        denied: usize,
        threshold: usize,
    },
    Expired {
        expired_at: u64,
    },
}

impl fmt::Display for RecoveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryFailure::InsufficientApprovals {
                approved,
                denied,
                threshold,
            } => write!(
                f,
                "not enough stewards can approve: {approved} approved, {denied} denied, {threshold} required"
            ),
            RecoveryFailure::Expired { expired_at } => {
                write!(f, "request timed out at {expired_at}")
            }
        }
    }
}

// ── RecoveryResponse ─────────────────────────────────────────────────────

/// Derived from a response slot, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Pending,
    Approved,
    Denied,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryResponse {
    pub steward: Identity,
    pub approved: bool,
    pub responded_at: Option<u64>,
    pub shard: Option<ShardData>,
    pub message_ref: Option<String>,
    pub error: Option<String>,
}

impl RecoveryResponse {
    pub fn pending(steward: Identity) -> Self {
        Self {
            steward,
            approved: false,
            responded_at: None,
            shard: None,
            message_ref: None,
            error: None,
        }
    }

    pub fn status(&self) -> ResponseStatus {
        match (&self.error, self.responded_at, self.approved) {
            (Some(_), _, _) => ResponseStatus::Error,
            (None, None, _) => ResponseStatus::Pending,
            (None, Some(_), true) => ResponseStatus::Approved,
            (None, Some(_), false) => ResponseStatus::Denied,
        }
    }
}

// ── RecoveryRequest ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    pub id: String,
    pub vault_id: VaultId,
    pub initiator: Identity,
    pub created_at: u64,
    pub status: RecoveryStatus,
    pub expires_at: Option<u64>,
    pub threshold: usize,
    /// One slot per addressed steward.
    pub responses: BTreeMap<Identity, RecoveryResponse>,
    #[serde(default)]
    pub delivered_to: BTreeSet<Identity>,
    pub failure: Option<RecoveryFailure>,
}

impl RecoveryRequest {
    pub fn total_stewards(&self) -> usize {
        self.responses.len()
    }

    fn count(&self, status: ResponseStatus) -> usize {
        self.responses
            .values()
            .filter(|r| r.status() == status)
            .count()
    }

    pub fn approved_count(&self) -> usize {
        self.count(ResponseStatus::Approved)
    }

    pub fn denied_count(&self) -> usize {
        self.count(ResponseStatus::Denied)
    }

    pub fn responded_count(&self) -> usize {
        self.responses
            .values()
            .filter(|r| r.responded_at.is_some())
            .count()
    }

    pub fn can_recover(&self) -> bool {
        self.approved_count() >= self.threshold
    }

    /// Too many denials for the threshold to ever be reached.
    pub fn has_failed(&self) -> bool {
        self.total_stewards().saturating_sub(self.denied_count()) < self.threshold
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn error_text(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }

    pub fn approved_shards(&self) -> Vec<&ShardData> {
        self.responses
            .values()
            .filter(|r| r.status() == ResponseStatus::Approved)
            .filter_map(|r| r.shard.as_ref())
            .collect()
    }

    /// Stewards that have neither accepted delivery nor responded.
    pub fn undelivered(&self) -> Vec<Identity> {
        self.responses
            .values()
            .filter(|r| r.responded_at.is_none() && !self.delivered_to.contains(&r.steward))
            .map(|r| r.steward)
            .collect()
    }

    pub(crate) fn request_message(&self) -> CustodyMessage {
        CustodyMessage::RecoveryRequest {
            request_id: self.id.clone(),
            vault_id: self.vault_id.clone(),
            threshold: self.threshold as u8,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// What `initiate` needs.
#[derive(Debug, Clone)]
pub struct RecoveryParams {
    pub vault_id: VaultId,
    pub stewards: Vec<Identity>,
    pub threshold: usize,
    pub expires_at: Option<u64>,
}

/// A recovery request as seen by a steward, waiting for the user's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPrompt {
    pub request_id: String,
    pub vault_id: VaultId,
    pub initiator: Identity,
    pub threshold: u8,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub received_at: u64,
}

// ── Outcomes and actions ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnknownSteward,
    /// Older than the response already recorded for that steward.
    Stale,
    Closed(RecoveryStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Recorded,
    /// Approvals reached the threshold with this response.
    ThresholdReached,
    Failed(RecoveryFailure),
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    Initiated {
        request_id: String,
        vault_id: VaultId,
    },
    /// Every steward's copy of the request was accepted by the channel.
    Sent { request_id: String },
}

#[derive(Debug, Clone)]
pub enum RecoveryAction {
    SendRequest {
        to: Identity,
        request_id: String,
        message: CustodyMessage,
    },
    Event(RecoveryEvent),
}
