/// Custody messages exchanged between owner and steward devices.
///
/// Encoded as MessagePack with field names, then sealed to the recipient.
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{self, SealedPayload};
use crate::error::Result;
use crate::identity::{Identity, KeyIdentity};
use crate::sharing::ShardData;
use crate::types::VaultId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustodyMessage {
    /// Owner → steward: a shard to hold.
    ShardDistribution { shard: ShardData },

    /// Steward → owner: the shard of `distribution_version` is stored.
    ShardAck {
        vault_id: VaultId,
        distribution_version: u32,
        ack_ref: String,
    },

    /// Initiator → steward: please return your shard.
    RecoveryRequest {
        request_id: String,
        vault_id: VaultId,
        threshold: u8,
        created_at: u64,
        expires_at: Option<u64>,
    },

    /// Steward → initiator: approval (with shard) or denial.
    RecoveryResponse {
        request_id: String,
        vault_id: VaultId,
        approved: bool,
        shard: Option<ShardData>,
        responded_at: u64,
    },

    /// Steward → owner: the uploaded vault blob was retrieved.
    FileDownloaded {
        vault_id: VaultId,
        content_hash: String,
        downloaded_at: u64,
    },
}

impl CustodyMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            CustodyMessage::ShardDistribution { .. } => "shard_distribution",
            CustodyMessage::ShardAck { .. } => "shard_ack",
            CustodyMessage::RecoveryRequest { .. } => "recovery_request",
            CustodyMessage::RecoveryResponse { .. } => "recovery_response",
            CustodyMessage::FileDownloaded { .. } => "file_downloaded",
        }
    }

    /// Vault the message concerns. A shard without vault metadata has none.
    pub fn vault_id(&self) -> Option<&VaultId> {
        match self {
            CustodyMessage::ShardDistribution { shard } => shard.vault_id.as_ref(),
            CustodyMessage::ShardAck { vault_id, .. }
            | CustodyMessage::RecoveryRequest { vault_id, .. }
            | CustodyMessage::RecoveryResponse { vault_id, .. }
            | CustodyMessage::FileDownloaded { vault_id, .. } => Some(vault_id),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }

    /// Encode and seal to `recipient`.
    pub fn seal_for(&self, recipient: &Identity) -> Result<Vec<u8>> {
        let plain = Zeroizing::new(self.to_bytes()?);
        crypto::seal(&plain, recipient)?.to_bytes()
    }

    /// Open a payload sealed to `local` and decode it.
    pub fn open(payload: &[u8], local: &KeyIdentity) -> Result<Self> {
        let sealed = SealedPayload::from_bytes(payload)?;
        let plain = Zeroizing::new(crypto::open(&sealed, local)?);
        Self::from_bytes(&plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CryptoError, KeywardError};
    use crate::sharing::split;

    fn key(seed: u8) -> KeyIdentity {
        KeyIdentity::from_seed([seed; 32])
    }

    #[test]
    fn sealed_shard_opens_for_recipient_only() {
        let owner = key(1);
        let steward = key(2);
        let mut shard = split(b"vault key", 2, 3, owner.identity(), 7)
            .unwrap()
            .remove(0);
        shard.vault_id = Some(VaultId::from("v1"));
        let msg = CustodyMessage::ShardDistribution { shard };

        let sealed = msg.seal_for(&steward.identity()).unwrap();
        assert_eq!(CustodyMessage::open(&sealed, &steward).unwrap(), msg);

        let err = CustodyMessage::open(&sealed, &key(3)).unwrap_err();
        assert!(matches!(err, KeywardError::Crypto(CryptoError::Unseal(_))));
    }

    #[test]
    fn garbage_payload_is_deserialization_error() {
        let err = CustodyMessage::open(b"\x01\x02\x03", &key(1)).unwrap_err();
        assert!(matches!(err, KeywardError::Deserialization(_)));
    }

    #[test]
    fn kind_and_vault() {
        let msg = CustodyMessage::ShardAck {
            vault_id: VaultId::from("v9"),
            distribution_version: 3,
            ack_ref: "a".into(),
        };
        assert_eq!(msg.kind(), "shard_ack");
        assert_eq!(msg.vault_id().map(VaultId::as_str), Some("v9"));
    }

    #[test]
    fn recovery_response_without_shard_roundtrips() {
        let msg = CustodyMessage::RecoveryResponse {
            request_id: "r1".into(),
            vault_id: VaultId::from("v"),
            approved: false,
            shard: None,
            responded_at: 10,
        };
        let back = CustodyMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(back, msg);
    }
}
