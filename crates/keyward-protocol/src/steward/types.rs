/// Steward records and their acknowledgment state machine.
///
/// `Invited → AwaitingKey → HoldingKey`, then `HoldingKey ⇄ AwaitingNewKey`
/// as distribution versions advance. `Inactive` is recoverable by a fresh
/// acknowledgment; `Error` and `Revoked` are terminal.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProtocolError, Result};
use crate::identity::Identity;

// ── StewardStatus ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StewardStatus {
    /// Invite sent, identity unknown.
    Invited,
    /// Identity known, first shard not yet acknowledged.
    AwaitingKey,
    /// Holds the shard of the current distribution version.
    HoldingKey,
    /// Holds an older shard; a newer one is pending.
    AwaitingNewKey,
    /// Unresponsive.
    Inactive,
    Error,
    Revoked,
}

impl StewardStatus {
    pub fn description(&self) -> &'static str {
        match self {
            StewardStatus::Invited => "invitation sent, waiting for the steward to accept",
            StewardStatus::AwaitingKey => "waiting for the steward to confirm their key",
            StewardStatus::HoldingKey => "holding the current key",
            StewardStatus::AwaitingNewKey => "holding an outdated key, update pending",
            StewardStatus::Inactive => "not responding",
            StewardStatus::Error => "failed",
            StewardStatus::Revoked => "access revoked",
        }
    }

    /// Counted as a live participant of the backup.
    pub fn is_active(&self) -> bool {
        match self {
            StewardStatus::AwaitingKey
            | StewardStatus::HoldingKey
            | StewardStatus::AwaitingNewKey => true,
            StewardStatus::Invited
            | StewardStatus::Inactive
            | StewardStatus::Error
            | StewardStatus::Revoked => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            StewardStatus::Error | StewardStatus::Revoked => true,
            StewardStatus::Invited
            | StewardStatus::AwaitingKey
            | StewardStatus::HoldingKey
            | StewardStatus::AwaitingNewKey
            | StewardStatus::Inactive => false,
        }
    }

    /// Holds some shard, current or not.
    pub fn has_key(&self) -> bool {
        match self {
            StewardStatus::HoldingKey | StewardStatus::AwaitingNewKey => true,
            StewardStatus::Invited
            | StewardStatus::AwaitingKey
            | StewardStatus::Inactive
            | StewardStatus::Error
            | StewardStatus::Revoked => false,
        }
    }

    fn can_transition_to(&self, to: StewardStatus) -> bool {
        use StewardStatus::*;
        match (self, to) {
            (Error | Revoked, _) => false,
            (_, Error | Revoked) => true,
            (Invited, AwaitingKey) => true,
            (Invited, _) => false,
            (_, Invited) => false,
            (AwaitingKey | HoldingKey | AwaitingNewKey | Inactive, _) => true,
        }
    }
}

impl fmt::Display for StewardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── AckOutcome ───────────────────────────────────────────────────────────

/// Result of feeding an acknowledgment into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckOutcome {
    /// Current version acknowledged, steward now HoldingKey.
    Accepted,
    /// Older than current but newer than anything recorded.
    Outdated,
    /// Older than the version already recorded; ignored.
    Stale,
    /// Same version acknowledged again; only `last_seen` moves.
    Duplicate,
}

// ── Steward ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Steward {
    pub id: String,
    pub identity: Option<Identity>,
    pub name: Option<String>,
    pub invite_code: Option<String>,
    pub status: StewardStatus,
    pub last_seen: Option<u64>,
    /// Reference of the shard message the steward holds.
    pub shard_ref: Option<String>,
    pub send_ref: Option<String>,
    pub ack_ref: Option<String>,
    pub acknowledged_version: Option<u32>,
    pub error: Option<String>,
}

impl Steward {
    pub fn invited(name: Option<String>, invite_code: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            identity: None,
            name,
            invite_code: Some(invite_code.into()),
            status: StewardStatus::Invited,
            last_seen: None,
            shard_ref: None,
            send_ref: None,
            ack_ref: None,
            acknowledged_version: None,
            error: None,
        }
    }

    pub fn with_identity(identity: Identity, name: Option<String>) -> Self {
        Self {
            identity: Some(identity),
            invite_code: None,
            status: StewardStatus::AwaitingKey,
            ..Self::invited(name, String::new())
        }
    }

    pub fn display_name(&self) -> String {
        match (&self.name, &self.identity) {
            (Some(name), _) => name.clone(),
            (None, Some(identity)) => identity.short(),
            (None, None) => format!("invite {}", &self.id[..8.min(self.id.len())]),
        }
    }

    fn transition(&self, to: StewardStatus) -> Result<Self> {
        if !self.status.can_transition_to(to) {
            return Err(ProtocolError::InvalidTransition {
                entity: "steward",
                from: self.status.to_string(),
                to: to.to_string(),
            }
            .into());
        }
        Ok(Self {
            status: to,
            ..self.clone()
        })
    }

    /// Invited → AwaitingKey. Clears the invite code.
    pub fn attach_identity(&self, identity: Identity, now: u64) -> Result<Self> {
        if self.status != StewardStatus::Invited {
            return Err(ProtocolError::InvalidTransition {
                entity: "steward",
                from: self.status.to_string(),
                to: StewardStatus::AwaitingKey.to_string(),
            }
            .into());
        }
        let mut next = self.transition(StewardStatus::AwaitingKey)?;
        next.identity = Some(identity);
        next.invite_code = None;
        next.last_seen = Some(now);
        Ok(next)
    }

    /// Apply an acknowledgment of `version` while the config is at `current`.
    pub fn acknowledge(
        &self,
        version: u32,
        ack_ref: Option<String>,
        current: u32,
        now: u64,
    ) -> Result<(Self, AckOutcome)> {
        if self.identity.is_none() || self.status.is_terminal() {
            return Err(ProtocolError::InvalidTransition {
                entity: "steward",
                from: self.status.to_string(),
                to: StewardStatus::HoldingKey.to_string(),
            }
            .into());
        }
        if version > current {
            return Err(ProtocolError::VersionMismatch {
                steward: self.id.clone(),
                acknowledged: version,
                current,
            }
            .into());
        }
        match self.acknowledged_version {
            Some(recorded) if version < recorded => return Ok((self.clone(), AckOutcome::Stale)),
            Some(recorded) if version == recorded && self.status.has_key() => {
                let mut next = self.clone();
                next.last_seen = Some(now);
                return Ok((next, AckOutcome::Duplicate));
            }
            _ => {}
        }

        let (status, outcome) = if version == current {
            (StewardStatus::HoldingKey, AckOutcome::Accepted)
        } else {
            (StewardStatus::AwaitingNewKey, AckOutcome::Outdated)
        };
        let mut next = self.transition(status)?;
        next.acknowledged_version = Some(version);
        next.shard_ref = ack_ref.clone().or(next.send_ref.clone());
        next.ack_ref = ack_ref;
        next.last_seen = Some(now);
        Ok((next, outcome))
    }

    /// The channel accepted a shard for this steward.
    pub fn record_sent(&self, send_ref: String) -> Result<Self> {
        let to = match (self.status, self.acknowledged_version) {
            (StewardStatus::AwaitingKey, _) | (StewardStatus::Inactive, None) => {
                StewardStatus::AwaitingKey
            }
            _ => StewardStatus::AwaitingNewKey,
        };
        if self.identity.is_none() {
            return Err(ProtocolError::InvalidTransition {
                entity: "steward",
                from: self.status.to_string(),
                to: to.to_string(),
            }
            .into());
        }
        let mut next = self.transition(to)?;
        next.send_ref = Some(send_ref);
        next.error = None;
        Ok(next)
    }

    /// HoldingKey → AwaitingNewKey when `current` moved past the held version.
    /// Returns `None` when nothing changes.
    pub fn mark_stale(&self, current: u32) -> Option<Self> {
        let behind = self.acknowledged_version.map_or(true, |v| v < current);
        (self.status == StewardStatus::HoldingKey && behind).then(|| Self {
            status: StewardStatus::AwaitingNewKey,
            ..self.clone()
        })
    }

    pub fn mark_inactive(&self) -> Result<Self> {
        self.transition(StewardStatus::Inactive)
    }

    pub fn mark_error(&self, reason: impl Into<String>) -> Result<Self> {
        let mut next = self.transition(StewardStatus::Error)?;
        next.error = Some(reason.into());
        Ok(next)
    }

    pub fn revoke(&self) -> Result<Self> {
        self.transition(StewardStatus::Revoked)
    }

    /// Holds the shard of exactly `current`.
    pub fn holds_version(&self, current: u32) -> bool {
        self.status == StewardStatus::HoldingKey && self.acknowledged_version == Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyIdentity;

    fn identity(seed: u8) -> Identity {
        KeyIdentity::from_seed([seed; 32]).identity()
    }

    fn holding(version: u32) -> Steward {
        let (s, outcome) = Steward::with_identity(identity(1), None)
            .acknowledge(version, Some("ack".into()), version, 10)
            .unwrap();
        assert_eq!(outcome, AckOutcome::Accepted);
        s
    }

    #[test]
    fn invited_has_no_identity() {
        let s = Steward::invited(Some("Alice".into()), "code-1");
        assert_eq!(s.status, StewardStatus::Invited);
        assert!(s.identity.is_none());
        assert_eq!(s.invite_code.as_deref(), Some("code-1"));
    }

    #[test]
    fn attach_identity_clears_invite() {
        let s = Steward::invited(None, "code")
            .attach_identity(identity(2), 5)
            .unwrap();
        assert_eq!(s.status, StewardStatus::AwaitingKey);
        assert_eq!(s.identity, Some(identity(2)));
        assert!(s.invite_code.is_none());
    }

    #[test]
    fn attach_twice_fails() {
        let s = Steward::with_identity(identity(1), None);
        assert!(s.attach_identity(identity(2), 0).is_err());
    }

    #[test]
    fn invited_cannot_acknowledge() {
        let s = Steward::invited(None, "c");
        assert!(s.acknowledge(1, None, 1, 0).is_err());
    }

    #[test]
    fn ack_current_version_holds_key() {
        let s = holding(3);
        assert_eq!(s.status, StewardStatus::HoldingKey);
        assert_eq!(s.acknowledged_version, Some(3));
        assert_eq!(s.ack_ref.as_deref(), Some("ack"));
        assert!(s.holds_version(3));
    }

    #[test]
    fn ack_above_current_is_version_mismatch() {
        let s = Steward::with_identity(identity(1), None);
        let err = s.acknowledge(5, None, 4, 0).unwrap_err();
        assert!(matches!(
            err,
            crate::error::KeywardError::Protocol(ProtocolError::VersionMismatch {
                acknowledged: 5,
                current: 4,
                ..
            })
        ));
    }

    #[test]
    fn older_ack_is_stale_and_ignored() {
        let s = holding(3);
        let (next, outcome) = s.acknowledge(2, None, 3, 20).unwrap();
        assert_eq!(outcome, AckOutcome::Stale);
        assert_eq!(next, s);
    }

    #[test]
    fn outdated_ack_leaves_awaiting_new_key() {
        let s = Steward::with_identity(identity(1), None);
        let (next, outcome) = s.acknowledge(1, None, 2, 0).unwrap();
        assert_eq!(outcome, AckOutcome::Outdated);
        assert_eq!(next.status, StewardStatus::AwaitingNewKey);
        assert_eq!(next.acknowledged_version, Some(1));
    }

    #[test]
    fn replayed_ack_is_duplicate() {
        let s = holding(2);
        let (next, outcome) = s.acknowledge(2, Some("ack".into()), 2, 99).unwrap();
        assert_eq!(outcome, AckOutcome::Duplicate);
        assert_eq!(next.last_seen, Some(99));
        assert_eq!(next.status, StewardStatus::HoldingKey);
    }

    #[test]
    fn mark_stale_only_moves_holders_behind() {
        let s = holding(1);
        let stale = s.mark_stale(2).unwrap();
        assert_eq!(stale.status, StewardStatus::AwaitingNewKey);
        assert!(s.mark_stale(1).is_none());
        assert!(Steward::with_identity(identity(1), None).mark_stale(5).is_none());
    }

    #[test]
    fn inactive_recovers_on_ack() {
        let s = holding(1).mark_inactive().unwrap();
        assert!(!s.status.is_active());
        let (next, outcome) = s.acknowledge(2, None, 2, 0).unwrap();
        assert_eq!(outcome, AckOutcome::Accepted);
        assert_eq!(next.status, StewardStatus::HoldingKey);
    }

    #[test]
    fn terminal_states_reject_everything() {
        let revoked = holding(1).revoke().unwrap();
        assert!(revoked.status.is_terminal());
        assert!(revoked.acknowledge(1, None, 1, 0).is_err());
        assert!(revoked.mark_inactive().is_err());
        assert!(revoked.record_sent("r".into()).is_err());

        let failed = holding(1).mark_error("lost device").unwrap();
        assert_eq!(failed.error.as_deref(), Some("lost device"));
        assert!(failed.revoke().is_err());
    }

    #[test]
    fn record_sent_first_and_later_distribution() {
        let fresh = Steward::with_identity(identity(1), None)
            .record_sent("m1".into())
            .unwrap();
        assert_eq!(fresh.status, StewardStatus::AwaitingKey);
        assert_eq!(fresh.send_ref.as_deref(), Some("m1"));

        let rotated = holding(1).record_sent("m2".into()).unwrap();
        assert_eq!(rotated.status, StewardStatus::AwaitingNewKey);
    }

    #[test]
    fn derived_properties() {
        assert!(StewardStatus::HoldingKey.has_key());
        assert!(StewardStatus::AwaitingNewKey.has_key());
        assert!(!StewardStatus::AwaitingKey.has_key());
        assert!(StewardStatus::AwaitingKey.is_active());
        assert!(!StewardStatus::Invited.is_active());
        assert!(!StewardStatus::Inactive.is_terminal());
        assert!(!StewardStatus::Revoked.description().is_empty());
    }
}
