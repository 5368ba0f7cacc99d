use serde::{Deserialize, Serialize};

use crate::error::{Result, ValidationError};
use crate::identity::Identity;
use crate::types::{VaultId, MAX_SHARES};

use super::engine::{chunk_count, PRIME_MODULUS_HEX, SCALAR_SIZE};

fn default_distribution_version() -> u32 {
    1
}

/// One steward's share plus the metadata it travels with.
///
/// Older payloads are accepted as-is: `shard` is read as `share`,
/// `nostr_relays` as `channels`, and a missing `distribution_version` is 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardData {
    /// Concatenated 32-byte canonical scalars, one per secret chunk.
    #[serde(with = "hex_bytes", alias = "shard")]
    pub share: Vec<u8>,
    pub threshold: u8,
    /// 1-based evaluation point.
    pub shard_index: u8,
    pub total_shards: u8,
    pub prime_mod: String,
    pub secret_len: u32,
    pub creator: Identity,
    pub created_at: u64,

    #[serde(default)]
    pub vault_id: Option<VaultId>,
    #[serde(default)]
    pub peers: Vec<Identity>,
    #[serde(default, alias = "nostr_relays")]
    pub channels: Vec<String>,
    #[serde(default)]
    pub owner_name: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub recipient: Option<Identity>,
    #[serde(default)]
    pub received: bool,
    #[serde(default)]
    pub received_at: Option<u64>,
    #[serde(default)]
    pub message_ref: Option<String>,
    #[serde(default = "default_distribution_version")]
    pub distribution_version: u32,

    // File-backed vaults
    #[serde(default)]
    pub blob_urls: Vec<String>,
    #[serde(default)]
    pub blob_hashes: Vec<String>,
    #[serde(default)]
    pub file_names: Vec<String>,
    #[serde(default)]
    pub blob_expires_at: Option<u64>,
}

impl ShardData {
    pub(crate) fn new(
        share: Vec<u8>,
        threshold: u8,
        shard_index: u8,
        total_shards: u8,
        secret_len: u32,
        creator: Identity,
        created_at: u64,
    ) -> Self {
        Self {
            share,
            threshold,
            shard_index,
            total_shards,
            prime_mod: PRIME_MODULUS_HEX.to_string(),
            secret_len,
            creator,
            created_at,
            vault_id: None,
            peers: Vec::new(),
            channels: Vec::new(),
            owner_name: None,
            instructions: None,
            recipient: None,
            received: false,
            received_at: None,
            message_ref: None,
            distribution_version: default_distribution_version(),
            blob_urls: Vec::new(),
            blob_hashes: Vec::new(),
            file_names: Vec::new(),
            blob_expires_at: None,
        }
    }

    /// Check the index/threshold invariants and the share length.
    pub fn validate(&self) -> Result<()> {
        let (t, i, n) = (self.threshold, self.shard_index, self.total_shards);
        if t == 0 || t > n || n as usize > MAX_SHARES {
            return Err(ValidationError::InvalidShard(format!(
                "threshold {t} of {n} out of range"
            ))
            .into());
        }
        if i == 0 || i > n {
            return Err(
                ValidationError::InvalidShard(format!("index {i} outside 1..={n}")).into(),
            );
        }
        let expected = chunk_count(self.secret_len as usize) * SCALAR_SIZE;
        if self.share.len() != expected {
            return Err(ValidationError::InvalidShard(format!(
                "share is {} bytes, expected {expected}",
                self.share.len()
            ))
            .into());
        }
        if self.blob_urls.len() != self.blob_hashes.len() {
            return Err(
                ValidationError::InvalidShard("blob urls and hashes differ in count".into())
                    .into(),
            );
        }
        Ok(())
    }

    pub fn is_for(&self, identity: &Identity) -> bool {
        self.recipient.as_ref() == Some(identity)
    }

    /// Serialize to MessagePack with field names, so optional fields can evolve.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
