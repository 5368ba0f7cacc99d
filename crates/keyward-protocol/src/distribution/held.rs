use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Result, ValidationError};
use crate::identity::Identity;
use crate::message::CustodyMessage;
use crate::sharing::ShardData;
use crate::types::VaultId;

use super::types::ShardAcceptance;

/// Shards this device holds as a steward, one per vault.
///
/// A shard is replaced only by one that sorts later by
/// `(distribution_version, created_at)`.
#[derive(Debug, Default, Clone)]
pub struct HeldShards {
    shards: BTreeMap<VaultId, ShardData>,
}

impl HeldShards {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, vault_id: &VaultId) -> Option<&ShardData> {
        self.shards.get(vault_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardData> {
        self.shards.values()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn remove(&mut self, vault_id: &VaultId) -> Option<ShardData> {
        self.shards.remove(vault_id)
    }

    /// Validate and store a shard received from `from`.
    ///
    /// Returns the acknowledgment to send back, if any. Stale shards get none.
    pub fn accept_shard(
        &mut self,
        shard: ShardData,
        from: &Identity,
        local: &Identity,
        now: u64,
    ) -> Result<(ShardAcceptance, Option<CustodyMessage>)> {
        shard.validate()?;
        let vault_id = shard
            .vault_id
            .clone()
            .ok_or_else(|| ValidationError::InvalidShard("shard carries no vault id".into()))?;
        if shard.recipient.is_some_and(|r| r != *local) {
            return Err(ValidationError::InvalidShard("shard addressed to another steward".into()).into());
        }
        if shard.creator != *from {
            return Err(ValidationError::InvalidShard("shard not sent by its creator".into()).into());
        }

        let acceptance = match self.shards.get(&vault_id) {
            None => ShardAcceptance::Stored,
            Some(held)
                if held.distribution_version == shard.distribution_version
                    && held.created_at == shard.created_at
                    && held.share == shard.share =>
            {
                ShardAcceptance::Duplicate
            }
            Some(held)
                if (shard.distribution_version, shard.created_at)
                    > (held.distribution_version, held.created_at) =>
            {
                ShardAcceptance::Replaced {
                    previous_version: held.distribution_version,
                }
            }
            Some(held) => {
                debug!(vault = %vault_id, held = held.distribution_version, received = shard.distribution_version, "stale shard dropped");
                return Ok((
                    ShardAcceptance::Stale {
                        held_version: held.distribution_version,
                    },
                    None,
                ));
            }
        };

        let ack_ref = match (&acceptance, self.shards.get(&vault_id)) {
            (ShardAcceptance::Duplicate, Some(held)) => held
                .message_ref
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let version = shard.distribution_version;
        if acceptance != ShardAcceptance::Duplicate {
            self.shards.insert(
                vault_id.clone(),
                ShardData {
                    received: true,
                    received_at: Some(now),
                    message_ref: Some(ack_ref.clone()),
                    ..shard
                },
            );
        }
        debug!(vault = %vault_id, version, ?acceptance, "shard accepted");
        Ok((
            acceptance,
            Some(CustodyMessage::ShardAck {
                vault_id,
                distribution_version: version,
                ack_ref,
            }),
        ))
    }

    /// Load a persisted shard.
    pub fn restore(&mut self, shard: ShardData) -> Result<()> {
        let vault_id = shard
            .vault_id
            .clone()
            .ok_or_else(|| ValidationError::InvalidShard("shard carries no vault id".into()))?;
        self.shards.insert(vault_id, shard);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeywardError;
    use crate::identity::KeyIdentity;
    use crate::sharing;

    fn identity(seed: u8) -> Identity {
        KeyIdentity::from_seed([seed; 32]).identity()
    }

    fn shard_for(steward: u8, version: u32, created_at: u64) -> ShardData {
        let mut shard = sharing::split(b"held", 1, 1, identity(1), created_at)
            .unwrap()
            .remove(0);
        shard.vault_id = Some(VaultId::from("v"));
        shard.recipient = Some(identity(steward));
        shard.distribution_version = version;
        shard
    }

    #[test]
    fn store_then_duplicate_acks_same_ref() {
        let mut held = HeldShards::new();
        let shard = shard_for(2, 1, 10);
        let (first, ack) = held.accept_shard(shard.clone(), &identity(1), &identity(2), 20).unwrap();
        assert_eq!(first, ShardAcceptance::Stored);
        let Some(CustodyMessage::ShardAck { ack_ref, distribution_version: 1, .. }) = ack else {
            panic!("expected ack");
        };

        let (again, ack) = held.accept_shard(shard, &identity(1), &identity(2), 30).unwrap();
        assert_eq!(again, ShardAcceptance::Duplicate);
        assert!(matches!(ack, Some(CustodyMessage::ShardAck { ack_ref: r, .. }) if r == ack_ref));
        assert_eq!(held.get(&VaultId::from("v")).unwrap().received_at, Some(20));
    }

    #[test]
    fn newer_version_replaces_older_is_dropped() {
        let mut held = HeldShards::new();
        held.accept_shard(shard_for(2, 2, 10), &identity(1), &identity(2), 20).unwrap();

        let (outcome, ack) = held
            .accept_shard(shard_for(2, 1, 50), &identity(1), &identity(2), 60)
            .unwrap();
        assert_eq!(outcome, ShardAcceptance::Stale { held_version: 2 });
        assert!(ack.is_none());

        let (outcome, _) = held
            .accept_shard(shard_for(2, 3, 5), &identity(1), &identity(2), 70)
            .unwrap();
        assert_eq!(outcome, ShardAcceptance::Replaced { previous_version: 2 });
        assert_eq!(held.get(&VaultId::from("v")).unwrap().distribution_version, 3);
    }

    #[test]
    fn rejects_misaddressed_and_forged() {
        let mut held = HeldShards::new();
        let err = held
            .accept_shard(shard_for(3, 1, 10), &identity(1), &identity(2), 20)
            .unwrap_err();
        assert!(matches!(err, KeywardError::Validation(ValidationError::InvalidShard(_))));

        assert!(held
            .accept_shard(shard_for(2, 1, 10), &identity(9), &identity(2), 20)
            .is_err());

        let mut broken = shard_for(2, 1, 10);
        broken.shard_index = 0;
        assert!(held.accept_shard(broken, &identity(1), &identity(2), 20).is_err());
        assert!(held.is_empty());
    }
}
