use crate::identity::Identity;
use crate::types::VaultId;

pub type Result<T> = std::result::Result<T, KeywardError>;

/// Errors for the Keyward protocol layer.
///
/// Four families mirror how a failure is handled: validation errors are
/// local and never retried, protocol errors end an aggregate's progress,
/// transport errors are retried per unit of work, crypto errors abort only
/// the attempt that hit them.
#[derive(Debug, thiserror::Error)]
pub enum KeywardError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl KeywardError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        KeywardError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Transport failures are worth retrying; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeywardError::Transport(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid threshold {threshold} of {total} (require 1 <= threshold <= total <= {max})")]
    InvalidThreshold {
        threshold: usize,
        total: usize,
        max: usize,
    },

    #[error("steward count {actual} does not match total keys {expected}")]
    StewardCountMismatch { expected: usize, actual: usize },

    #[error("duplicate steward id {0}")]
    DuplicateStewardId(String),

    #[error("identity {0} is already assigned to another steward")]
    DuplicateIdentity(Identity),

    #[error("duplicate vault {0}")]
    DuplicateVault(VaultId),

    #[error("at least one channel endpoint is required")]
    NoChannels,

    #[error("malformed channel endpoint {endpoint}: {reason}")]
    MalformedChannel { endpoint: String, reason: String },

    #[error("approval from {steward} carries no shard")]
    MissingShard { steward: Identity },

    #[error("download at {downloaded_at} precedes upload at {uploaded_at}")]
    DownloadBeforeUpload { uploaded_at: u64, downloaded_at: u64 },

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid shard: {0}")]
    InvalidShard(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("insufficient shares: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },

    #[error("insufficient approvals: {approved} approved, {threshold} required")]
    InsufficientApprovals { approved: usize, threshold: usize },

    #[error("duplicate shard index {0}")]
    DuplicateShardIndex(u8),

    #[error("recovery request {request_id} expired")]
    RecoveryExpired { request_id: String },

    #[error("steward {steward} acknowledged version {acknowledged}, current is {current}")]
    VersionMismatch {
        steward: String,
        acknowledged: u32,
        current: u32,
    },

    #[error("vault {vault_id} not ready for distribution: {reason}")]
    NotReadyForDistribution { vault_id: VaultId, reason: String },

    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("distribution window closed for {steward} on vault {vault_id}")]
    WindowClosed { vault_id: VaultId, steward: Identity },

    #[error("no pending distribution for vault {0}")]
    NoPendingDistribution(VaultId),

    #[error("pending distribution for vault {0} was superseded by a config change")]
    DistributionSuperseded(VaultId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("send to {recipient} failed: {reason}")]
    SendFailed { recipient: Identity, reason: String },

    #[error("blob store unavailable: {0}")]
    BlobUnavailable(String),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("blob hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("runtime shut down")]
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("inconsistent shares: {0}")]
    InconsistentShares(String),

    #[error("seal failed: {0}")]
    Seal(String),

    #[error("unseal failed: {0}")]
    Unseal(String),
}

impl From<rmp_serde::encode::Error> for KeywardError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        KeywardError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for KeywardError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        KeywardError::Deserialization(e.to_string())
    }
}

impl From<serde_json::Error> for KeywardError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            KeywardError::Deserialization(e.to_string())
        } else {
            KeywardError::Serialization(e.to_string())
        }
    }
}

impl From<rusqlite::Error> for KeywardError {
    fn from(e: rusqlite::Error) -> Self {
        KeywardError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_invalid_threshold() {
        let err: KeywardError = ValidationError::InvalidThreshold {
            threshold: 4,
            total: 3,
            max: 10,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "validation failed: invalid threshold 4 of 3 (require 1 <= threshold <= total <= 10)"
        );
    }

    #[test]
    fn display_not_found() {
        let err = KeywardError::not_found("vault", "v-1");
        assert_eq!(err.to_string(), "vault not found: v-1");
    }

    #[test]
    fn display_duplicate_index() {
        let err: KeywardError = ProtocolError::DuplicateShardIndex(2).into();
        assert_eq!(err.to_string(), "protocol error: duplicate shard index 2");
    }

    #[test]
    fn only_transport_is_retryable() {
        assert!(KeywardError::from(TransportError::Shutdown).is_retryable());
        assert!(!KeywardError::from(CryptoError::Seal("x".into())).is_retryable());
        assert!(!KeywardError::from(ProtocolError::InsufficientShares { have: 1, need: 2 })
            .is_retryable());
    }

    #[test]
    fn json_errors_are_deserialization() {
        let err: KeywardError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, KeywardError::Deserialization(_)));
    }
}
