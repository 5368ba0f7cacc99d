/// Custody runtime: one device's live event loop.
///
/// The runtime owns every aggregate of the device (backup configs, pending
/// distributions, held shards, recovery requests, file windows) inside a
/// single task. The application talks to it through a `RuntimeHandle` and
/// observes it through `RuntimeEvent`s; stewards' devices run the same
/// runtime and answer shards and recovery requests from the channel.
mod r#loop;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use zeroize::Zeroizing;

use crate::config::{BackupConfig, ConfigUpdate, NewBackupConfig};
use crate::distribution::{AckDisposition, DistributionEvent, DistributionResult, ShardAcceptance};
use crate::error::{Result, TransportError};
use crate::identity::{Identity, KeyIdentity};
use crate::ports::{BlobRef, BlobStore, MessageChannel, Repository};
use crate::recovery::{
    RecoveryEvent, RecoveryParams, RecoveryPrompt, RecoveryRequest, ResponseOutcome,
    DEFAULT_RECOVERY_TTL_MS,
};
use crate::sharing::ShardData;
use crate::types::VaultId;

// ── Configuration ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How often open recovery requests are checked for expiry.
    pub recovery_sweep_interval: Duration,
    /// How often file distribution windows are checked.
    pub file_sweep_interval: Duration,
    /// Lifetime of recovery requests started without explicit params.
    /// `None` means they never expire.
    pub default_recovery_ttl: Option<Duration>,
    pub command_buffer: usize,
    pub event_buffer: usize,
    /// Shown to stewards in the shards this device distributes.
    pub owner_name: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            recovery_sweep_interval: Duration::from_secs(30),
            file_sweep_interval: Duration::from_secs(60),
            default_recovery_ttl: Some(Duration::from_millis(DEFAULT_RECOVERY_TTL_MS)),
            command_buffer: 64,
            event_buffer: 256,
            owner_name: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `KEYWARD_RECOVERY_SWEEP_SECS`,
    /// `KEYWARD_FILE_SWEEP_SECS` and `KEYWARD_RECOVERY_TTL_SECS`
    /// (`0` disables expiry). Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_secs("KEYWARD_RECOVERY_SWEEP_SECS") {
            config.recovery_sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_secs("KEYWARD_FILE_SWEEP_SECS") {
            config.file_sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_secs("KEYWARD_RECOVERY_TTL_SECS") {
            config.default_recovery_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }
        config
    }

    pub fn with_owner_name(mut self, name: impl Into<String>) -> Self {
        self.owner_name = Some(name.into());
        self
    }

    pub fn with_recovery_sweep_interval(mut self, interval: Duration) -> Self {
        self.recovery_sweep_interval = interval;
        self
    }

    pub fn with_file_sweep_interval(mut self, interval: Duration) -> Self {
        self.file_sweep_interval = interval;
        self
    }

    pub fn with_default_recovery_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_recovery_ttl = ttl;
        self
    }
}

fn env_secs(name: &str) -> Option<u64> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(secs) => Some(secs),
        Err(_) => {
            tracing::warn!("ignoring {name}={value}: not a number of seconds");
            None
        }
    }
}

// ── Commands (app → runtime) ──────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum RuntimeCommand {
    // ── Backup configuration ────────────────────────
    CreateBackupConfig {
        config: NewBackupConfig,
        reply: Reply<BackupConfig>,
    },
    UpdateBackupConfig {
        vault_id: VaultId,
        update: ConfigUpdate,
        reply: Reply<BackupConfig>,
    },
    InviteSteward {
        vault_id: VaultId,
        name: Option<String>,
        reply: Reply<(String, String)>,
    },
    AcceptInvitation {
        vault_id: VaultId,
        invite_code: String,
        identity: Identity,
        reply: Reply<String>,
    },
    RevokeSteward {
        vault_id: VaultId,
        steward_id: String,
        reply: Reply<()>,
    },
    ContentChanged {
        vault_id: VaultId,
        content_hash: Option<String>,
        reply: Reply<bool>,
    },
    Deactivate {
        vault_id: VaultId,
        reply: Reply<()>,
    },
    // ── Distribution ────────────────────────────────
    Distribute {
        vault_id: VaultId,
        secret: Zeroizing<Vec<u8>>,
        reply: Reply<DistributionResult>,
    },
    RetryDistribution {
        vault_id: VaultId,
        reply: Reply<DistributionResult>,
    },
    AbandonDistribution {
        vault_id: VaultId,
        reply: Reply<()>,
    },
    // ── Recovery (initiator) ────────────────────────
    InitiateRecovery {
        vault_id: VaultId,
        params: Option<RecoveryParams>,
        reply: Reply<String>,
    },
    RetryRecoveryBroadcast {
        request_id: String,
        reply: Reply<usize>,
    },
    RecordResponse {
        request_id: String,
        steward: Identity,
        approved: bool,
        shard: Option<Box<ShardData>>,
        responded_at: u64,
        reply: Reply<ResponseOutcome>,
    },
    PerformRecovery {
        request_id: String,
        reply: Reply<Zeroizing<Vec<u8>>>,
    },
    CancelRecovery {
        request_id: String,
        reply: Reply<bool>,
    },
    ArchiveRecovery {
        request_id: String,
        reply: Reply<()>,
    },
    // ── Recovery (steward) ──────────────────────────
    RespondToRecovery {
        request_id: String,
        approved: bool,
        reply: Reply<()>,
    },
    // ── Files ───────────────────────────────────────
    UploadFile {
        vault_id: VaultId,
        name: String,
        data: Vec<u8>,
        reply: Reply<BlobRef>,
    },
    ConfirmFileDownload {
        vault_id: VaultId,
        steward: Identity,
        downloaded_at: u64,
        reply: Reply<bool>,
    },
    PurgeBlob {
        vault_id: VaultId,
        reply: Reply<bool>,
    },
    // ── Queries ─────────────────────────────────────
    Query {
        query: Query,
        reply: Reply<QueryAnswer>,
    },
    Shutdown,
}

pub(crate) enum Query {
    Config(VaultId),
    IsReady(VaultId),
    NeedsRedistribution(VaultId),
    HasVersionMismatch(VaultId),
    CanDeleteFromBlobStore(VaultId),
    RecoveryRequest(String),
    HeldShard(VaultId),
    RecoveryPrompts,
}

pub(crate) enum QueryAnswer {
    Config(Option<BackupConfig>),
    Flag(bool),
    RecoveryRequest(Option<RecoveryRequest>),
    HeldShard(Option<ShardData>),
    RecoveryPrompts(Vec<RecoveryPrompt>),
}

// ── Events (runtime → app) ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    // ── Owner ───────────────────────────────────────
    Distribution(DistributionEvent),
    AckReceived {
        vault_id: VaultId,
        steward: Identity,
        version: u32,
        disposition: AckDisposition,
    },
    FileDownloaded {
        vault_id: VaultId,
        steward: Identity,
    },
    FileWindowMissed {
        vault_id: VaultId,
        steward: Identity,
    },
    // ── Recovery initiator ──────────────────────────
    Recovery(RecoveryEvent),
    ResponseRecorded {
        request_id: String,
        steward: Identity,
        outcome: ResponseOutcome,
    },
    RecoveryExpired {
        request_id: String,
    },
    // ── Steward ─────────────────────────────────────
    ShardReceived {
        vault_id: VaultId,
        from: Identity,
        version: u32,
        acceptance: ShardAcceptance,
    },
    RecoveryRequested(RecoveryPrompt),
    /// The vault blob referenced by a held shard was fetched and verified.
    BlobRetrieved {
        vault_id: VaultId,
        url: String,
        size: usize,
    },
    /// Runtime encountered a non-fatal error.
    Error {
        description: String,
    },
}

// ── RuntimeHandle (app-facing API) ───────────────────────────────────

/// Handle to a running `KeywardRuntime`. Cheap to clone.
///
/// Every call fails with `TransportError::Shutdown` once the runtime stopped.
#[derive(Clone)]
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    local_id: Identity,
}

impl RuntimeHandle {
    pub fn local_id(&self) -> Identity {
        self.local_id
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> RuntimeCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(command(tx))
            .await
            .map_err(|_| TransportError::Shutdown)?;
        rx.await.map_err(|_| TransportError::Shutdown)?
    }

    async fn query(&self, query: Query) -> Result<QueryAnswer> {
        self.request(|reply| RuntimeCommand::Query { query, reply })
            .await
    }

    async fn flag(&self, query: Query) -> Result<bool> {
        match self.query(query).await? {
            QueryAnswer::Flag(flag) => Ok(flag),
            _ => Err(TransportError::Shutdown.into()),
        }
    }

    // ── Backup configuration ───────────────────────

    pub async fn create_backup_config(&self, config: NewBackupConfig) -> Result<BackupConfig> {
        self.request(|reply| RuntimeCommand::CreateBackupConfig { config, reply })
            .await
    }

    pub async fn update_backup_config(
        &self,
        vault_id: VaultId,
        update: ConfigUpdate,
    ) -> Result<BackupConfig> {
        self.request(|reply| RuntimeCommand::UpdateBackupConfig {
            vault_id,
            update,
            reply,
        })
        .await
    }

    /// Returns `(steward_id, invite_code)`.
    pub async fn invite_steward(
        &self,
        vault_id: VaultId,
        name: Option<String>,
    ) -> Result<(String, String)> {
        self.request(|reply| RuntimeCommand::InviteSteward {
            vault_id,
            name,
            reply,
        })
        .await
    }

    /// Returns the steward id the invitation belonged to.
    pub async fn accept_invitation(
        &self,
        vault_id: VaultId,
        invite_code: String,
        identity: Identity,
    ) -> Result<String> {
        self.request(|reply| RuntimeCommand::AcceptInvitation {
            vault_id,
            invite_code,
            identity,
            reply,
        })
        .await
    }

    pub async fn revoke_steward(&self, vault_id: VaultId, steward_id: String) -> Result<()> {
        self.request(|reply| RuntimeCommand::RevokeSteward {
            vault_id,
            steward_id,
            reply,
        })
        .await
    }

    /// Returns false when the content hash did not change.
    pub async fn content_changed(
        &self,
        vault_id: VaultId,
        content_hash: Option<String>,
    ) -> Result<bool> {
        self.request(|reply| RuntimeCommand::ContentChanged {
            vault_id,
            content_hash,
            reply,
        })
        .await
    }

    pub async fn deactivate(&self, vault_id: VaultId) -> Result<()> {
        self.request(|reply| RuntimeCommand::Deactivate { vault_id, reply })
            .await
    }

    // ── Distribution ───────────────────────────────

    /// Split `secret` and send one shard to every steward.
    pub async fn distribute(&self, vault_id: VaultId, secret: Vec<u8>) -> Result<DistributionResult> {
        let secret = Zeroizing::new(secret);
        self.request(|reply| RuntimeCommand::Distribute {
            vault_id,
            secret,
            reply,
        })
        .await
    }

    /// Resend shards the channel did not accept.
    pub async fn retry_distribution(&self, vault_id: VaultId) -> Result<DistributionResult> {
        self.request(|reply| RuntimeCommand::RetryDistribution { vault_id, reply })
            .await
    }

    pub async fn abandon_distribution(&self, vault_id: VaultId) -> Result<()> {
        self.request(|reply| RuntimeCommand::AbandonDistribution { vault_id, reply })
            .await
    }

    // ── Recovery ───────────────────────────────────

    /// Ask the vault's stewards for their shards. Returns the request id.
    pub async fn initiate_recovery(&self, vault_id: VaultId) -> Result<String> {
        self.request(|reply| RuntimeCommand::InitiateRecovery {
            vault_id,
            params: None,
            reply,
        })
        .await
    }

    /// Start a recovery without a local backup config, e.g. on a new device.
    pub async fn initiate_recovery_with(&self, params: RecoveryParams) -> Result<String> {
        self.request(|reply| RuntimeCommand::InitiateRecovery {
            vault_id: params.vault_id.clone(),
            params: Some(params),
            reply,
        })
        .await
    }

    /// Resend the request to stewards whose copy was not accepted.
    pub async fn retry_recovery_broadcast(&self, request_id: String) -> Result<usize> {
        self.request(|reply| RuntimeCommand::RetryRecoveryBroadcast { request_id, reply })
            .await
    }

    /// Record a response that arrived out of band.
    pub async fn record_response(
        &self,
        request_id: String,
        steward: Identity,
        approved: bool,
        shard: Option<ShardData>,
        responded_at: u64,
    ) -> Result<ResponseOutcome> {
        self.request(|reply| RuntimeCommand::RecordResponse {
            request_id,
            steward,
            approved,
            shard: shard.map(Box::new),
            responded_at,
            reply,
        })
        .await
    }

    pub async fn perform_recovery(&self, request_id: String) -> Result<Zeroizing<Vec<u8>>> {
        self.request(|reply| RuntimeCommand::PerformRecovery { request_id, reply })
            .await
    }

    /// Returns false when the request was already cancelled.
    pub async fn cancel_recovery(&self, request_id: String) -> Result<bool> {
        self.request(|reply| RuntimeCommand::CancelRecovery { request_id, reply })
            .await
    }

    pub async fn archive_recovery(&self, request_id: String) -> Result<()> {
        self.request(|reply| RuntimeCommand::ArchiveRecovery { request_id, reply })
            .await
    }

    /// Steward side: answer a pending recovery request.
    pub async fn respond_to_recovery(&self, request_id: String, approved: bool) -> Result<()> {
        self.request(|reply| RuntimeCommand::RespondToRecovery {
            request_id,
            approved,
            reply,
        })
        .await
    }

    // ── Files ──────────────────────────────────────

    /// Upload an encrypted vault file and open the download window for
    /// every steward. The next distribution carries its reference.
    pub async fn upload_file(&self, vault_id: VaultId, name: String, data: Vec<u8>) -> Result<BlobRef> {
        self.request(|reply| RuntimeCommand::UploadFile {
            vault_id,
            name,
            data,
            reply,
        })
        .await
    }

    pub async fn confirm_file_download(
        &self,
        vault_id: VaultId,
        steward: Identity,
        downloaded_at: u64,
    ) -> Result<bool> {
        self.request(|reply| RuntimeCommand::ConfirmFileDownload {
            vault_id,
            steward,
            downloaded_at,
            reply,
        })
        .await
    }

    /// Delete the vault blob once every window is resolved.
    /// Returns false while some steward may still download it.
    pub async fn purge_blob(&self, vault_id: VaultId) -> Result<bool> {
        self.request(|reply| RuntimeCommand::PurgeBlob { vault_id, reply })
            .await
    }

    // ── Queries ────────────────────────────────────

    pub async fn config(&self, vault_id: VaultId) -> Result<Option<BackupConfig>> {
        match self.query(Query::Config(vault_id)).await? {
            QueryAnswer::Config(config) => Ok(config),
            _ => Err(TransportError::Shutdown.into()),
        }
    }

    pub async fn is_ready(&self, vault_id: VaultId) -> Result<bool> {
        self.flag(Query::IsReady(vault_id)).await
    }

    pub async fn needs_redistribution(&self, vault_id: VaultId) -> Result<bool> {
        self.flag(Query::NeedsRedistribution(vault_id)).await
    }

    pub async fn has_version_mismatch(&self, vault_id: VaultId) -> Result<bool> {
        self.flag(Query::HasVersionMismatch(vault_id)).await
    }

    pub async fn can_delete_from_blob_store(&self, vault_id: VaultId) -> Result<bool> {
        self.flag(Query::CanDeleteFromBlobStore(vault_id)).await
    }

    pub async fn recovery_request(&self, request_id: String) -> Result<Option<RecoveryRequest>> {
        match self.query(Query::RecoveryRequest(request_id)).await? {
            QueryAnswer::RecoveryRequest(request) => Ok(request),
            _ => Err(TransportError::Shutdown.into()),
        }
    }

    /// Steward side: the shard held for `vault_id`.
    pub async fn held_shard(&self, vault_id: VaultId) -> Result<Option<ShardData>> {
        match self.query(Query::HeldShard(vault_id)).await? {
            QueryAnswer::HeldShard(shard) => Ok(shard),
            _ => Err(TransportError::Shutdown.into()),
        }
    }

    /// Steward side: recovery requests waiting for an answer.
    pub async fn recovery_prompts(&self) -> Result<Vec<RecoveryPrompt>> {
        match self.query(Query::RecoveryPrompts).await? {
            QueryAnswer::RecoveryPrompts(prompts) => Ok(prompts),
            _ => Err(TransportError::Shutdown.into()),
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Shutdown).await;
    }
}

// ── KeywardRuntime ───────────────────────────────────────────────────

/// Channels returned to the application when the runtime starts.
pub struct RuntimeChannels {
    pub handle: RuntimeHandle,
    pub events: mpsc::Receiver<RuntimeEvent>,
}

pub struct KeywardRuntime;

impl KeywardRuntime {
    /// Load persisted state and spawn the event loop as a tokio task.
    ///
    /// Fails only when the repository cannot be read.
    pub fn spawn<C>(
        identity: KeyIdentity,
        channel: C,
        blobs: Arc<dyn BlobStore>,
        repository: Box<dyn Repository>,
        config: RuntimeConfig,
    ) -> Result<RuntimeChannels>
    where
        C: MessageChannel + 'static,
    {
        let local_id = identity.identity();
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));

        let state = state::RuntimeState::load(identity, blobs, repository, &config, event_tx)?;
        tokio::spawn(r#loop::runtime_loop(state, channel, config, cmd_rx));

        Ok(RuntimeChannels {
            handle: RuntimeHandle { cmd_tx, local_id },
            events: event_rx,
        })
    }
}
