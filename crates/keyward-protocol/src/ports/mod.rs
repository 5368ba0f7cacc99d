//! Boundaries to the outside world.
//!
//! The protocol never talks to a relay, a blob server or a database
//! directly; it goes through these traits. In-memory implementations back
//! the tests and the simulator, `SqliteRepository` persists real devices.

mod memory;
mod sqlite;

use serde::{Deserialize, Serialize};

use crate::config::BackupConfig;
use crate::error::Result;
use crate::identity::Identity;
use crate::recovery::RecoveryRequest;
use crate::types::VaultId;

pub use crate::identity::IdentityProvider;
pub use memory::{MemoryBlobStore, MemoryChannel, MemoryNetwork, MemoryRepository};
pub use sqlite::SqliteRepository;

// ── Messaging ────────────────────────────────────────────────────────────

/// The channel accepted a payload for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    pub message_ref: String,
    pub accepted_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: Identity,
    pub payload: Vec<u8>,
}

/// Pub/sub style channel keyed by recipient identity.
///
/// `recv` yields messages addressed to the local identity, including those
/// queued while the device was offline. `None` means the channel closed.
#[async_trait::async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send(&self, recipient: &Identity, payload: &[u8]) -> Result<DeliveryAck>;

    async fn recv(&mut self) -> Option<InboundMessage>;
}

// ── Blob storage ─────────────────────────────────────────────────────────

/// Location and fingerprint (lowercase hex SHA-256) of an uploaded blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub url: String,
    pub content_hash: String,
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, data: &[u8]) -> Result<BlobRef>;

    /// Fails with `TransportError::HashMismatch` when the content does not match.
    async fn download(&self, url: &str, expected_hash: &str) -> Result<Vec<u8>>;

    async fn delete(&self, url: &str) -> Result<()>;
}

// ── Persistence ──────────────────────────────────────────────────────────

pub trait Repository: Send {
    fn load_config(&self, vault_id: &VaultId) -> Result<Option<BackupConfig>>;

    fn save_config(&self, config: &BackupConfig) -> Result<()>;

    fn list_configs(&self) -> Result<Vec<BackupConfig>>;

    fn load_recovery_request(&self, request_id: &str) -> Result<Option<RecoveryRequest>>;

    fn save_recovery_request(&self, request: &RecoveryRequest) -> Result<()>;

    fn list_recovery_requests(&self) -> Result<Vec<RecoveryRequest>>;
}
