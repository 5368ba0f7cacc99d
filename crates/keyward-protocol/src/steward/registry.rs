use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{KeywardError, Result, ValidationError};
use crate::identity::Identity;

use super::types::{AckOutcome, Steward};

/// Ordered steward list of one backup configuration.
///
/// Every mutation computes the replacement steward first and swaps it in
/// only after identity uniqueness has been checked, so a failed call leaves
/// the registry untouched. Deserialization goes through `new`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Steward>", into = "Vec<Steward>")]
pub struct StewardRegistry {
    stewards: Vec<Steward>,
}

impl StewardRegistry {
    /// Build from a list, rejecting duplicate ids or identities.
    pub fn new(stewards: Vec<Steward>) -> Result<Self> {
        let mut ids = HashSet::new();
        let mut identities = HashSet::new();
        for steward in &stewards {
            if !ids.insert(steward.id.as_str()) {
                return Err(ValidationError::DuplicateStewardId(steward.id.clone()).into());
            }
            if let Some(identity) = steward.identity {
                if !identities.insert(identity) {
                    return Err(ValidationError::DuplicateIdentity(identity).into());
                }
            }
        }
        Ok(Self { stewards })
    }

    // ── Registration ─────────────────────────────────────────────────────

    pub fn register_invited(
        &mut self,
        name: Option<String>,
        invite_code: impl Into<String>,
    ) -> String {
        let steward = Steward::invited(name, invite_code);
        let id = steward.id.clone();
        self.stewards.push(steward);
        id
    }

    pub fn register_with_identity(
        &mut self,
        identity: Identity,
        name: Option<String>,
    ) -> Result<String> {
        self.ensure_identity_free(&identity, None)?;
        let steward = Steward::with_identity(identity, name);
        let id = steward.id.clone();
        self.stewards.push(steward);
        Ok(id)
    }

    pub fn attach_identity(&mut self, steward_id: &str, identity: Identity, now: u64) -> Result<()> {
        let index = self.index_of(steward_id)?;
        let updated = self.stewards[index].attach_identity(identity, now)?;
        self.replace(index, updated)
    }

    // ── Acknowledgment ───────────────────────────────────────────────────

    pub fn record_acknowledgment(
        &mut self,
        steward_id: &str,
        version: u32,
        ack_ref: Option<String>,
        current_version: u32,
        now: u64,
    ) -> Result<AckOutcome> {
        let index = self.index_of(steward_id)?;
        let (updated, outcome) =
            self.stewards[index].acknowledge(version, ack_ref, current_version, now)?;
        self.replace(index, updated)?;
        Ok(outcome)
    }

    pub fn record_sent(&mut self, steward_id: &str, send_ref: String) -> Result<()> {
        let index = self.index_of(steward_id)?;
        let updated = self.stewards[index].record_sent(send_ref)?;
        self.replace(index, updated)
    }

    /// Returns whether the steward changed.
    pub fn mark_stale(&mut self, steward_id: &str, current_version: u32) -> Result<bool> {
        let index = self.index_of(steward_id)?;
        match self.stewards[index].mark_stale(current_version) {
            Some(updated) => self.replace(index, updated).map(|_| true),
            None => Ok(false),
        }
    }

    /// Returns the ids of stewards that moved to AwaitingNewKey.
    pub fn mark_all_stale(&mut self, current_version: u32) -> Vec<String> {
        let mut moved = Vec::new();
        for steward in &mut self.stewards {
            if let Some(updated) = steward.mark_stale(current_version) {
                moved.push(updated.id.clone());
                *steward = updated;
            }
        }
        moved
    }

    pub fn mark_inactive(&mut self, steward_id: &str) -> Result<()> {
        let index = self.index_of(steward_id)?;
        let updated = self.stewards[index].mark_inactive()?;
        self.replace(index, updated)
    }

    pub fn mark_error(&mut self, steward_id: &str, reason: impl Into<String>) -> Result<()> {
        let index = self.index_of(steward_id)?;
        let updated = self.stewards[index].mark_error(reason)?;
        self.replace(index, updated)
    }

    pub fn revoke(&mut self, steward_id: &str) -> Result<()> {
        let index = self.index_of(steward_id)?;
        let updated = self.stewards[index].revoke()?;
        self.replace(index, updated)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn get(&self, steward_id: &str) -> Option<&Steward> {
        self.stewards.iter().find(|s| s.id == steward_id)
    }

    pub fn find_by_identity(&self, identity: &Identity) -> Option<&Steward> {
        self.stewards
            .iter()
            .find(|s| s.identity.as_ref() == Some(identity))
    }

    pub fn find_by_invite_code(&self, code: &str) -> Option<&Steward> {
        self.stewards
            .iter()
            .find(|s| s.invite_code.as_deref() == Some(code))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Steward> {
        self.stewards.iter()
    }

    pub fn len(&self) -> usize {
        self.stewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stewards.is_empty()
    }

    /// Known identities, in registry order.
    pub fn identities(&self) -> Vec<Identity> {
        self.stewards.iter().filter_map(|s| s.identity).collect()
    }

    /// Every steward has a known identity and none is terminal.
    pub fn can_distribute(&self) -> bool {
        !self.stewards.is_empty()
            && self
                .stewards
                .iter()
                .all(|s| s.identity.is_some() && !s.status.is_terminal())
    }

    pub fn holding_count(&self, current_version: u32) -> usize {
        self.stewards
            .iter()
            .filter(|s| s.holds_version(current_version))
            .count()
    }

    /// Any steward with an identity whose acknowledged version differs from `current_version`.
    pub fn has_version_mismatch(&self, current_version: u32) -> bool {
        self.stewards
            .iter()
            .filter(|s| s.identity.is_some() && !s.status.is_terminal())
            .any(|s| s.acknowledged_version != Some(current_version))
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn index_of(&self, steward_id: &str) -> Result<usize> {
        self.stewards
            .iter()
            .position(|s| s.id == steward_id)
            .ok_or_else(|| KeywardError::not_found("steward", steward_id))
    }

    fn ensure_identity_free(&self, identity: &Identity, except: Option<usize>) -> Result<()> {
        let taken = self
            .stewards
            .iter()
            .enumerate()
            .any(|(i, s)| Some(i) != except && s.identity.as_ref() == Some(identity));
        if taken {
            return Err(ValidationError::DuplicateIdentity(*identity).into());
        }
        Ok(())
    }

    fn replace(&mut self, index: usize, updated: Steward) -> Result<()> {
        if let Some(identity) = &updated.identity {
            self.ensure_identity_free(identity, Some(index))?;
        }
        self.stewards[index] = updated;
        Ok(())
    }
}

impl TryFrom<Vec<Steward>> for StewardRegistry {
    type Error = KeywardError;

    fn try_from(stewards: Vec<Steward>) -> Result<Self> {
        Self::new(stewards)
    }
}

impl From<StewardRegistry> for Vec<Steward> {
    fn from(registry: StewardRegistry) -> Self {
        registry.stewards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyIdentity;
    use crate::steward::StewardStatus;

    fn identity(seed: u8) -> Identity {
        KeyIdentity::from_seed([seed; 32]).identity()
    }

    #[test]
    fn new_rejects_duplicate_identity() {
        let a = Steward::with_identity(identity(1), None);
        let b = Steward::with_identity(identity(1), None);
        assert!(matches!(
            StewardRegistry::new(vec![a, b]).unwrap_err(),
            KeywardError::Validation(ValidationError::DuplicateIdentity(_))
        ));
    }

    #[test]
    fn new_rejects_duplicate_id() {
        let a = Steward::with_identity(identity(1), None);
        let mut b = Steward::with_identity(identity(2), None);
        b.id = a.id.clone();
        assert!(matches!(
            StewardRegistry::new(vec![a, b]).unwrap_err(),
            KeywardError::Validation(ValidationError::DuplicateStewardId(_))
        ));
    }

    #[test]
    fn deserialization_rejects_duplicates() {
        let a = Steward::with_identity(identity(1), None);
        let b = Steward::with_identity(identity(1), None);
        let json = serde_json::to_string(&vec![a.clone(), b]).unwrap();
        assert!(serde_json::from_str::<StewardRegistry>(&json).is_err());

        let mut c = Steward::with_identity(identity(2), None);
        c.id = a.id.clone();
        let json = serde_json::to_string(&vec![a.clone(), c]).unwrap();
        assert!(serde_json::from_str::<StewardRegistry>(&json).is_err());

        let valid = StewardRegistry::new(vec![a, Steward::with_identity(identity(3), None)]).unwrap();
        let json = serde_json::to_string(&valid).unwrap();
        assert_eq!(serde_json::from_str::<StewardRegistry>(&json).unwrap(), valid);
    }

    #[test]
    fn attach_identity_taken_leaves_registry_unchanged() {
        let mut reg = StewardRegistry::default();
        reg.register_with_identity(identity(1), None).unwrap();
        let invited = reg.register_invited(Some("Bob".into()), "code");
        let before = reg.clone();

        let err = reg.attach_identity(&invited, identity(1), 0).unwrap_err();
        assert!(matches!(
            err,
            KeywardError::Validation(ValidationError::DuplicateIdentity(_))
        ));
        assert_eq!(reg, before);
    }

    #[test]
    fn find_by_invite_code_then_attach() {
        let mut reg = StewardRegistry::default();
        reg.register_invited(None, "abc");
        let id = reg.find_by_invite_code("abc").unwrap().id.clone();
        reg.attach_identity(&id, identity(4), 1).unwrap();
        assert!(reg.find_by_invite_code("abc").is_none());
        assert_eq!(reg.find_by_identity(&identity(4)).unwrap().id, id);
    }

    #[test]
    fn can_distribute_requires_all_identities() {
        let mut reg = StewardRegistry::default();
        assert!(!reg.can_distribute());
        reg.register_with_identity(identity(1), None).unwrap();
        let invited = reg.register_invited(None, "c");
        assert!(!reg.can_distribute());
        reg.attach_identity(&invited, identity(2), 0).unwrap();
        assert!(reg.can_distribute());
        reg.revoke(&invited).unwrap();
        assert!(!reg.can_distribute());
    }

    #[test]
    fn holding_count_and_mismatch() {
        let mut reg = StewardRegistry::default();
        let a = reg.register_with_identity(identity(1), None).unwrap();
        let b = reg.register_with_identity(identity(2), None).unwrap();
        reg.record_acknowledgment(&a, 1, None, 1, 0).unwrap();
        assert_eq!(reg.holding_count(1), 1);
        assert!(reg.has_version_mismatch(1));
        reg.record_acknowledgment(&b, 1, None, 1, 0).unwrap();
        assert_eq!(reg.holding_count(1), 2);
        assert!(!reg.has_version_mismatch(1));
    }

    #[test]
    fn mark_all_stale_after_version_bump() {
        let mut reg = StewardRegistry::default();
        let a = reg.register_with_identity(identity(1), None).unwrap();
        let b = reg.register_with_identity(identity(2), None).unwrap();
        reg.record_acknowledgment(&a, 1, None, 1, 0).unwrap();

        let moved = reg.mark_all_stale(2);
        assert_eq!(moved, vec![a.clone()]);
        assert_eq!(reg.get(&a).unwrap().status, StewardStatus::AwaitingNewKey);
        assert_eq!(reg.get(&b).unwrap().status, StewardStatus::AwaitingKey);
    }

    #[test]
    fn unknown_steward_is_not_found() {
        let mut reg = StewardRegistry::default();
        assert!(matches!(
            reg.mark_inactive("nope").unwrap_err(),
            KeywardError::NotFound { kind: "steward", .. }
        ));
    }

    #[test]
    fn serializes_as_plain_list() {
        let mut reg = StewardRegistry::default();
        reg.register_with_identity(identity(1), Some("A".into()))
            .unwrap();
        let json = serde_json::to_value(&reg).unwrap();
        assert!(json.is_array());
        let back: StewardRegistry = serde_json::from_value(json).unwrap();
        assert_eq!(back, reg);
    }
}
