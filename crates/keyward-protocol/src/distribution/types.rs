/// Distribution types: pending distributions, send outcomes, actions.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::BackupConfig;
use crate::identity::Identity;
use crate::message::CustodyMessage;
use crate::sharing::ShardData;
use crate::steward::AckOutcome;
use crate::types::VaultId;

// ── Inputs ───────────────────────────────────────────────────────────────

/// Encrypted vault files a distribution points stewards to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultFiles {
    pub urls: Vec<String>,
    pub hashes: Vec<String>,
    pub names: Vec<String>,
    pub expires_at: Option<u64>,
}

/// What the channel said about one shard payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted { message_ref: String },
    Failed { reason: String },
}

impl SendOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SendOutcome::Accepted { .. })
    }
}

// ── Pending distribution ─────────────────────────────────────────────────

/// The config state a distribution was split from. Any structural or
/// content change moves one of these fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigBasis {
    pub last_updated: u64,
    pub last_content_change: Option<u64>,
    pub distribution_version: u32,
}

impl ConfigBasis {
    pub fn of(config: &BackupConfig) -> Self {
        Self {
            last_updated: config.last_updated,
            last_content_change: config.last_content_change,
            distribution_version: config.distribution_version,
        }
    }
}

/// Shards of one polynomial on their way to the stewards.
///
/// Kept until every steward's send is accepted so that retries resend the
/// same shares.
#[derive(Debug, Clone)]
pub struct PendingDistribution {
    pub vault_id: VaultId,
    pub target_version: u32,
    pub basis: ConfigBasis,
    pub shards: BTreeMap<Identity, ShardData>,
    /// Steward → message reference of the accepted send.
    pub delivered: BTreeMap<Identity, String>,
    pub failures: BTreeMap<Identity, String>,
    /// Acks for `target_version` that arrived before the version was recorded.
    pub early_acks: BTreeMap<Identity, Option<String>>,
    pub started_at: u64,
}

impl PendingDistribution {
    pub fn undelivered(&self) -> Vec<Identity> {
        self.shards
            .keys()
            .filter(|id| !self.delivered.contains_key(id))
            .copied()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.delivered.len() == self.shards.len()
    }
}

// ── Outcomes ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StewardOutcome {
    pub steward: Identity,
    pub outcome: SendOutcome,
}

/// Summary of one `distribute` or `retry` call.
#[derive(Debug, Clone)]
pub struct DistributionResult {
    pub vault_id: VaultId,
    pub target_version: u32,
    pub outcomes: Vec<StewardOutcome>,
    pub events: Vec<DistributionEvent>,
    /// Every steward's shard has been accepted.
    pub completed: bool,
    /// Version recorded on the config when `completed`.
    pub new_version: Option<u32>,
}

impl DistributionResult {
    pub fn failed(&self) -> impl Iterator<Item = &StewardOutcome> {
        self.outcomes.iter().filter(|o| !o.outcome.is_accepted())
    }
}

/// How an inbound acknowledgment was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    Recorded(AckOutcome),
    /// Held until the pending distribution completes.
    Buffered,
}

/// Steward side: what happened to an inbound shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardAcceptance {
    Stored,
    /// Replaced a shard of an older distribution.
    Replaced { previous_version: u32 },
    /// Same shard again; acknowledged again.
    Duplicate,
    /// Older than the held shard; dropped without an ack.
    Stale { held_version: u32 },
}

// ── Events and actions ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributionEvent {
    Prepared {
        vault_id: VaultId,
        target_version: u32,
        stewards: usize,
    },
    ShardSent {
        vault_id: VaultId,
        steward: Identity,
        message_ref: String,
    },
    ShardFailed {
        vault_id: VaultId,
        steward: Identity,
        reason: String,
    },
    Completed {
        vault_id: VaultId,
        version: u32,
    },
    Abandoned {
        vault_id: VaultId,
        undelivered: usize,
    },
    /// The config changed before every shard was accepted; the shards are
    /// dropped and the vault still needs a distribution.
    Superseded {
        vault_id: VaultId,
        target_version: u32,
        undelivered: usize,
    },
}

#[derive(Debug, Clone)]
pub enum DistributionAction {
    SendShard {
        to: Identity,
        vault_id: VaultId,
        message: CustodyMessage,
    },
    Event(DistributionEvent),
}
