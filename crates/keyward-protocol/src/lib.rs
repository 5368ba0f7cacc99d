//! Keyward protocol layer.
//!
//! Protects a vault key by splitting it into Shamir shares held by
//! stewards, tracks which steward holds which distribution version, and
//! runs threshold recovery over an asynchronous message channel.
//!
//! Wire format: MessagePack (compact binary), sealed to the recipient.
//! Crypto: Shamir over the Ed25519 scalar field, X25519 + XChaCha20-Poly1305 sealing.

pub mod config;
pub mod crypto;
pub mod distribution;
pub mod error;
pub mod file_tracker;
pub mod identity;
pub mod message;
pub mod ports;
pub mod recovery;
pub mod runtime;
pub mod sharing;
pub mod steward;
pub mod types;

pub use config::{
    BackupConfig, BackupConfigManager, BackupStatus, ChannelEndpoint, ConfigFailure, ConfigUpdate,
    NewBackupConfig,
};
pub use crypto::SealedPayload;
pub use distribution::{
    AckDisposition, DistributionAction, DistributionCoordinator, DistributionEvent,
    DistributionResult, HeldShards, SendOutcome, ShardAcceptance, StewardOutcome, VaultFiles,
};
pub use error::{
    CryptoError, KeywardError, ProtocolError, Result, TransportError, ValidationError,
};
pub use file_tracker::{
    FileDistributionStatus, FileDistributionTracker, FileState, UploadedBlob,
    DISTRIBUTION_WINDOW_MS,
};
pub use identity::{Identity, IdentityProvider, KeyIdentity};
pub use message::CustodyMessage;
pub use ports::{
    BlobRef, BlobStore, DeliveryAck, InboundMessage, MemoryBlobStore, MemoryChannel,
    MemoryNetwork, MemoryRepository, MessageChannel, Repository, SqliteRepository,
};
pub use recovery::{
    RecoveryAction, RecoveryCoordinator, RecoveryEvent, RecoveryFailure, RecoveryParams,
    RecoveryPrompt, RecoveryRequest, RecoveryResponse, RecoveryStatus, ResponseOutcome,
    ResponseStatus,
};
pub use runtime::{KeywardRuntime, RuntimeChannels, RuntimeConfig, RuntimeEvent, RuntimeHandle};
pub use sharing::{reconstruct, split, ShardData};
pub use steward::{AckOutcome, Steward, StewardRegistry, StewardStatus};
pub use types::{now_ms, VaultId, MAX_SHARES, SPECIFICATION_VERSION};
