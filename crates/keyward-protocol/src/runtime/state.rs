/// Everything one device owns, and the handlers that change it.
///
/// Handlers take `now` from the wall clock once and pass it down; the
/// coordinators below stay pure. Every mutation of a config or recovery
/// request is written to the repository before the handler returns.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::{BackupConfig, BackupConfigManager, ConfigUpdate, NewBackupConfig};
use crate::distribution::{
    DistributionAction, DistributionCoordinator, DistributionResult, HeldShards, ShardAcceptance,
    VaultFiles,
};
use crate::error::{KeywardError, Result};
use crate::file_tracker::{FileDistributionTracker, DISTRIBUTION_WINDOW_MS};
use crate::identity::{Identity, KeyIdentity};
use crate::message::CustodyMessage;
use crate::ports::{BlobRef, BlobStore, InboundMessage, MessageChannel, Repository};
use crate::recovery::{
    respond, RecoveryCoordinator, RecoveryParams, RecoveryPrompt, ResponseOutcome,
};
use crate::sharing::ShardData;
use crate::types::{now_ms, VaultId};

use super::{Query, QueryAnswer, RuntimeConfig, RuntimeEvent};

pub(super) struct RuntimeState {
    identity: KeyIdentity,
    local_id: Identity,

    // Owner
    manager: BackupConfigManager,
    distribution: DistributionCoordinator,
    files: FileDistributionTracker,
    vault_files: HashMap<VaultId, VaultFiles>,

    // Recovery initiator
    recovery: RecoveryCoordinator,
    recovery_ttl: Option<Duration>,

    // Steward
    held: HeldShards,
    prompts: BTreeMap<String, RecoveryPrompt>,

    blobs: Arc<dyn BlobStore>,
    repository: Box<dyn Repository>,
    event_tx: mpsc::Sender<RuntimeEvent>,
}

impl RuntimeState {
    /// Build the state and restore persisted configs and recovery requests.
    pub(super) fn load(
        identity: KeyIdentity,
        blobs: Arc<dyn BlobStore>,
        repository: Box<dyn Repository>,
        config: &RuntimeConfig,
        event_tx: mpsc::Sender<RuntimeEvent>,
    ) -> Result<Self> {
        let local_id = identity.identity();
        let mut manager = BackupConfigManager::new();
        for stored in repository.list_configs()? {
            let vault_id = stored.vault_id.clone();
            if let Err(e) = manager.restore(stored) {
                warn!(vault = %vault_id, "skipping invalid stored config: {e}");
            }
        }
        let mut recovery = RecoveryCoordinator::new(local_id);
        for request in repository.list_recovery_requests()? {
            recovery.restore(request);
        }
        info!(identity = %local_id.short(), configs = manager.len(), requests = recovery.requests().count(), "runtime state loaded");

        Ok(Self {
            distribution: DistributionCoordinator::new(local_id)
                .with_owner_name(config.owner_name.clone()),
            files: FileDistributionTracker::new(),
            vault_files: HashMap::new(),
            recovery,
            recovery_ttl: config.default_recovery_ttl,
            held: HeldShards::new(),
            prompts: BTreeMap::new(),
            manager,
            identity,
            local_id,
            blobs,
            repository,
            event_tx,
        })
    }

    fn emit(&self, event: RuntimeEvent) {
        if self.event_tx.try_send(event).is_err() {
            debug!("event dropped: receiver full or closed");
        }
    }

    fn persist_config(&self, vault_id: &VaultId) {
        let Some(config) = self.manager.get(vault_id) else {
            return;
        };
        if let Err(e) = self.repository.save_config(config) {
            warn!(vault = %vault_id, "failed to persist config: {e}");
            self.emit(RuntimeEvent::Error {
                description: format!("persist config {vault_id}: {e}"),
            });
        }
    }

    fn persist_request(&self, request_id: &str) {
        let Some(request) = self.recovery.get(request_id) else {
            return;
        };
        if let Err(e) = self.repository.save_recovery_request(request) {
            warn!(request = request_id, "failed to persist recovery request: {e}");
            self.emit(RuntimeEvent::Error {
                description: format!("persist recovery request {request_id}: {e}"),
            });
        }
    }

    /// Persist after `op`, whether or not it succeeded.
    fn with_config<T>(
        &mut self,
        vault_id: &VaultId,
        op: impl FnOnce(&mut BackupConfigManager, u64) -> Result<T>,
    ) -> Result<T> {
        let result = op(&mut self.manager, now_ms());
        self.persist_config(vault_id);
        result
    }

    /// Like `with_config`, for operations that may invalidate a pending
    /// distribution of the vault.
    fn with_config_change<T>(
        &mut self,
        vault_id: &VaultId,
        op: impl FnOnce(&mut BackupConfigManager, u64) -> Result<T>,
    ) -> Result<T> {
        let result = self.with_config(vault_id, op);
        if let Some(config) = self.manager.get(vault_id) {
            if let Some(event) = self.distribution.discard_if_stale(config) {
                self.emit(RuntimeEvent::Distribution(event));
            }
        }
        result
    }

    fn with_request<T>(
        &mut self,
        request_id: &str,
        op: impl FnOnce(&mut RecoveryCoordinator, u64) -> Result<T>,
    ) -> Result<T> {
        let result = op(&mut self.recovery, now_ms());
        self.persist_request(request_id);
        result
    }

    // ── Backup configuration ─────────────────────────────────────────────

    pub(super) fn create_backup_config(&mut self, new: NewBackupConfig) -> Result<BackupConfig> {
        let vault_id = new.vault_id.clone();
        let config = self.manager.create(new, now_ms())?.clone();
        self.persist_config(&vault_id);
        Ok(config)
    }

    pub(super) fn update_backup_config(
        &mut self,
        vault_id: &VaultId,
        update: ConfigUpdate,
    ) -> Result<BackupConfig> {
        self.with_config_change(vault_id, |m, now| m.update(vault_id, update, now).cloned())
    }

    pub(super) fn invite_steward(
        &mut self,
        vault_id: &VaultId,
        name: Option<String>,
    ) -> Result<(String, String)> {
        self.with_config_change(vault_id, |m, now| m.invite_steward(vault_id, name, now))
    }

    pub(super) fn accept_invitation(
        &mut self,
        vault_id: &VaultId,
        invite_code: &str,
        identity: Identity,
    ) -> Result<String> {
        self.with_config(vault_id, |m, now| {
            m.accept_invitation(vault_id, invite_code, identity, now)
        })
    }

    pub(super) fn revoke_steward(&mut self, vault_id: &VaultId, steward_id: &str) -> Result<()> {
        self.with_config_change(vault_id, |m, now| m.revoke_steward(vault_id, steward_id, now))
    }

    pub(super) fn content_changed(
        &mut self,
        vault_id: &VaultId,
        content_hash: Option<String>,
    ) -> Result<bool> {
        self.with_config_change(vault_id, |m, now| {
            m.on_content_changed(vault_id, content_hash, now)
        })
    }

    pub(super) fn deactivate(&mut self, vault_id: &VaultId) -> Result<()> {
        self.with_config(vault_id, |m, now| m.deactivate(vault_id, now))
    }

    // ── Distribution ─────────────────────────────────────────────────────

    pub(super) async fn distribute<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &C,
        vault_id: &VaultId,
        secret: &[u8],
    ) -> Result<DistributionResult> {
        let files = self.vault_files.get(vault_id).cloned();
        let result = self
            .distribution
            .distribute(channel, &mut self.manager, vault_id, secret, files.as_ref(), now_ms())
            .await;
        self.finish_distribution(vault_id, result)
    }

    pub(super) async fn retry_distribution<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &C,
        vault_id: &VaultId,
    ) -> Result<DistributionResult> {
        let result = self
            .distribution
            .retry(channel, &mut self.manager, vault_id, now_ms())
            .await;
        self.finish_distribution(vault_id, result)
    }

    fn finish_distribution(
        &mut self,
        vault_id: &VaultId,
        result: Result<DistributionResult>,
    ) -> Result<DistributionResult> {
        self.persist_config(vault_id);
        let result = result?;
        for event in &result.events {
            self.emit(RuntimeEvent::Distribution(event.clone()));
        }
        Ok(result)
    }

    pub(super) fn abandon_distribution(&mut self, vault_id: &VaultId) -> Result<()> {
        let actions = self.distribution.abandon(vault_id, &mut self.manager)?;
        self.persist_config(vault_id);
        for action in actions {
            if let DistributionAction::Event(event) = action {
                self.emit(RuntimeEvent::Distribution(event));
            }
        }
        Ok(())
    }

    // ── Recovery (initiator) ─────────────────────────────────────────────

    pub(super) async fn initiate_recovery<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &C,
        vault_id: &VaultId,
        params: Option<RecoveryParams>,
    ) -> Result<String> {
        let now = now_ms();
        let params = match params {
            Some(params) => params,
            None => {
                let config = self
                    .manager
                    .get(vault_id)
                    .ok_or_else(|| KeywardError::not_found("vault", vault_id))?;
                RecoveryParams {
                    vault_id: vault_id.clone(),
                    stewards: config
                        .stewards
                        .iter()
                        .filter(|s| !s.status.is_terminal())
                        .filter_map(|s| s.identity)
                        .collect(),
                    threshold: config.threshold,
                    expires_at: self
                        .recovery_ttl
                        .map(|ttl| now.saturating_add(ttl.as_millis() as u64)),
                }
            }
        };
        let (request_id, actions) = self.recovery.initiate(params, now)?;
        let broadcast = self.recovery.broadcast(channel, actions).await;
        self.persist_request(&request_id);
        let (accepted, events) = broadcast?;
        for event in events {
            self.emit(RuntimeEvent::Recovery(event));
        }
        debug!(request = %request_id, accepted, "recovery request broadcast");
        Ok(request_id)
    }

    pub(super) async fn retry_recovery_broadcast<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &C,
        request_id: &str,
    ) -> Result<usize> {
        let actions = self.recovery.retry_broadcast(request_id)?;
        let broadcast = self.recovery.broadcast(channel, actions).await;
        self.persist_request(request_id);
        let (accepted, events) = broadcast?;
        for event in events {
            self.emit(RuntimeEvent::Recovery(event));
        }
        Ok(accepted)
    }

    pub(super) fn record_response(
        &mut self,
        request_id: &str,
        steward: &Identity,
        approved: bool,
        shard: Option<ShardData>,
        responded_at: u64,
    ) -> Result<ResponseOutcome> {
        let outcome = self.with_request(request_id, |r, now| {
            r.record_response(request_id, steward, approved, shard, responded_at, now)
        })?;
        if let ResponseOutcome::Ignored(reason) = &outcome {
            debug!(request = request_id, steward = %steward.short(), ?reason, "response ignored");
        }
        self.emit(RuntimeEvent::ResponseRecorded {
            request_id: request_id.to_string(),
            steward: *steward,
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    pub(super) fn perform_recovery(&mut self, request_id: &str) -> Result<Zeroizing<Vec<u8>>> {
        self.with_request(request_id, |r, now| r.perform_recovery(request_id, now))
            .map(Zeroizing::new)
    }

    pub(super) fn cancel_recovery(&mut self, request_id: &str) -> Result<bool> {
        self.with_request(request_id, |r, _| r.cancel(request_id))
    }

    pub(super) fn archive_recovery(&mut self, request_id: &str) -> Result<()> {
        self.with_request(request_id, |r, _| r.archive(request_id))
    }

    // ── Recovery (steward) ───────────────────────────────────────────────

    pub(super) async fn respond_to_recovery<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &C,
        request_id: &str,
        approved: bool,
    ) -> Result<()> {
        let prompt = self
            .prompts
            .get(request_id)
            .ok_or_else(|| KeywardError::not_found("recovery prompt", request_id))?;
        let message = respond(
            prompt,
            &self.local_id,
            approved,
            self.held.get(&prompt.vault_id),
            now_ms(),
        )?;
        let initiator = prompt.initiator;
        let payload = message.seal_for(&initiator)?;
        channel.send(&initiator, &payload).await?;
        self.prompts.remove(request_id);
        info!(request = request_id, approved, "recovery response sent");
        Ok(())
    }

    // ── Files ────────────────────────────────────────────────────────────

    pub(super) async fn upload_file(
        &mut self,
        vault_id: &VaultId,
        name: String,
        data: &[u8],
    ) -> Result<BlobRef> {
        let stewards = self
            .manager
            .get(vault_id)
            .ok_or_else(|| KeywardError::not_found("vault", vault_id))?
            .stewards
            .identities();
        let blob = self.blobs.upload(data).await?;
        let now = now_ms();
        let replaced = self
            .files
            .register_upload(vault_id, &blob.url, &blob.content_hash, &stewards, now);
        // Same content lands on the same url.
        if let Some(old) = replaced.filter(|old| old.url != blob.url) {
            match self.blobs.delete(&old.url).await {
                Ok(()) => info!(vault = %vault_id, url = %old.url, "replaced blob deleted"),
                Err(e) => {
                    warn!(vault = %vault_id, url = %old.url, "failed to delete replaced blob: {e}");
                    self.emit(RuntimeEvent::Error {
                        description: format!("delete replaced blob {}: {e}", old.url),
                    });
                }
            }
        }
        self.vault_files.insert(
            vault_id.clone(),
            VaultFiles {
                urls: vec![blob.url.clone()],
                hashes: vec![blob.content_hash.clone()],
                names: vec![name],
                expires_at: Some(now.saturating_add(DISTRIBUTION_WINDOW_MS)),
            },
        );
        Ok(blob)
    }

    pub(super) fn confirm_file_download(
        &mut self,
        vault_id: &VaultId,
        steward: &Identity,
        downloaded_at: u64,
    ) -> Result<bool> {
        let confirmed = self.files.confirm_download(vault_id, steward, downloaded_at)?;
        if confirmed {
            self.emit(RuntimeEvent::FileDownloaded {
                vault_id: vault_id.clone(),
                steward: *steward,
            });
        }
        Ok(confirmed)
    }

    pub(super) async fn purge_blob(&mut self, vault_id: &VaultId) -> Result<bool> {
        if !self.files.can_delete_from_blob_store(vault_id, now_ms()) {
            return Ok(false);
        }
        let Some(blob) = self.files.blob_for(vault_id).cloned() else {
            return Ok(false);
        };
        self.blobs.delete(&blob.url).await?;
        self.files.forget(vault_id);
        self.vault_files.remove(vault_id);
        info!(vault = %vault_id, url = %blob.url, "vault blob purged");
        Ok(true)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub(super) fn query(&self, query: Query) -> Result<QueryAnswer> {
        Ok(match query {
            Query::Config(vault_id) => QueryAnswer::Config(self.manager.get(&vault_id).cloned()),
            Query::IsReady(vault_id) => QueryAnswer::Flag(self.manager.is_ready(&vault_id)?),
            Query::NeedsRedistribution(vault_id) => {
                QueryAnswer::Flag(self.manager.needs_redistribution(&vault_id)?)
            }
            Query::HasVersionMismatch(vault_id) => {
                QueryAnswer::Flag(self.manager.has_version_mismatch(&vault_id)?)
            }
            Query::CanDeleteFromBlobStore(vault_id) => {
                QueryAnswer::Flag(self.files.can_delete_from_blob_store(&vault_id, now_ms()))
            }
            Query::RecoveryRequest(id) => {
                QueryAnswer::RecoveryRequest(self.recovery.get(&id).cloned())
            }
            Query::HeldShard(vault_id) => QueryAnswer::HeldShard(self.held.get(&vault_id).cloned()),
            Query::RecoveryPrompts => {
                QueryAnswer::RecoveryPrompts(self.prompts.values().cloned().collect())
            }
        })
    }

    // ── Inbound messages ─────────────────────────────────────────────────

    pub(super) async fn handle_inbound<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &C,
        inbound: InboundMessage,
    ) {
        let from = inbound.from;
        let message = match CustodyMessage::open(&inbound.payload, &self.identity) {
            Ok(message) => message,
            Err(e) => {
                debug!(from = %from.short(), "unreadable payload: {e}");
                return;
            }
        };
        let kind = message.kind();
        let now = now_ms();
        let result = match message {
            CustodyMessage::ShardDistribution { shard } => {
                self.on_shard(channel, shard, from, now).await
            }
            CustodyMessage::ShardAck {
                vault_id,
                distribution_version,
                ack_ref,
            } => self.on_ack(&vault_id, from, distribution_version, ack_ref, now),
            CustodyMessage::RecoveryRequest {
                request_id,
                vault_id,
                threshold,
                created_at,
                expires_at,
            } => {
                self.on_recovery_request(RecoveryPrompt {
                    request_id,
                    vault_id,
                    initiator: from,
                    threshold,
                    created_at,
                    expires_at,
                    received_at: now,
                });
                Ok(())
            }
            CustodyMessage::RecoveryResponse {
                request_id,
                approved,
                shard,
                responded_at,
                ..
            } => self
                .record_response(&request_id, &from, approved, shard, responded_at)
                .map(|_| ()),
            CustodyMessage::FileDownloaded {
                vault_id,
                content_hash,
                downloaded_at,
            } => self.on_file_downloaded(&vault_id, from, &content_hash, downloaded_at),
        };
        if let Err(e) = result {
            warn!(from = %from.short(), kind, "inbound message rejected: {e}");
            self.emit(RuntimeEvent::Error {
                description: format!("{kind} from {}: {e}", from.short()),
            });
        }
    }

    async fn on_shard<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &C,
        shard: ShardData,
        from: Identity,
        now: u64,
    ) -> Result<()> {
        let (acceptance, ack) = self.held.accept_shard(shard, &from, &self.local_id, now)?;
        let Some(ack) = ack else {
            return Ok(());
        };
        let (vault_id, version) = match &ack {
            CustodyMessage::ShardAck {
                vault_id,
                distribution_version,
                ..
            } => (vault_id.clone(), *distribution_version),
            _ => return Ok(()),
        };
        self.emit(RuntimeEvent::ShardReceived {
            vault_id: vault_id.clone(),
            from,
            version,
            acceptance,
        });
        channel.send(&from, &ack.seal_for(&from)?).await?;

        if matches!(acceptance, ShardAcceptance::Stored | ShardAcceptance::Replaced { .. }) {
            self.fetch_blobs(channel, &vault_id, from).await;
        }
        Ok(())
    }

    /// Download the blobs a fresh shard points to and tell the owner.
    async fn fetch_blobs<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &C,
        vault_id: &VaultId,
        owner: Identity,
    ) {
        let Some(shard) = self.held.get(vault_id) else {
            return;
        };
        let blobs: Vec<(String, String)> = shard
            .blob_urls
            .iter()
            .cloned()
            .zip(shard.blob_hashes.iter().cloned())
            .collect();

        for (url, hash) in blobs {
            let data = match self.blobs.download(&url, &hash).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(vault = %vault_id, %url, "blob download failed: {e}");
                    self.emit(RuntimeEvent::Error {
                        description: format!("download {url}: {e}"),
                    });
                    continue;
                }
            };
            self.emit(RuntimeEvent::BlobRetrieved {
                vault_id: vault_id.clone(),
                url: url.clone(),
                size: data.len(),
            });
            let notice = CustodyMessage::FileDownloaded {
                vault_id: vault_id.clone(),
                content_hash: hash,
                downloaded_at: now_ms(),
            };
            let sent = match notice.seal_for(&owner) {
                Ok(payload) => channel.send(&owner, &payload).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!(vault = %vault_id, "download notice not sent: {e}");
            }
        }
    }

    fn on_ack(
        &mut self,
        vault_id: &VaultId,
        from: Identity,
        version: u32,
        ack_ref: String,
        now: u64,
    ) -> Result<()> {
        let disposition = self.distribution.record_ack(
            vault_id,
            &from,
            version,
            Some(ack_ref),
            &mut self.manager,
            now,
        );
        self.persist_config(vault_id);
        self.emit(RuntimeEvent::AckReceived {
            vault_id: vault_id.clone(),
            steward: from,
            version,
            disposition: disposition?,
        });
        Ok(())
    }

    fn on_recovery_request(&mut self, prompt: RecoveryPrompt) {
        if prompt
            .expires_at
            .is_some_and(|at| prompt.received_at >= at)
        {
            debug!(request = %prompt.request_id, "expired recovery request ignored");
            return;
        }
        info!(request = %prompt.request_id, vault = %prompt.vault_id, initiator = %prompt.initiator.short(), "recovery requested");
        self.prompts
            .insert(prompt.request_id.clone(), prompt.clone());
        self.emit(RuntimeEvent::RecoveryRequested(prompt));
    }

    fn on_file_downloaded(
        &mut self,
        vault_id: &VaultId,
        from: Identity,
        content_hash: &str,
        downloaded_at: u64,
    ) -> Result<()> {
        let current = self
            .files
            .blob_for(vault_id)
            .is_some_and(|b| b.content_hash.eq_ignore_ascii_case(content_hash));
        if !current {
            debug!(vault = %vault_id, steward = %from.short(), "download notice for another blob ignored");
            return Ok(());
        }
        self.confirm_file_download(vault_id, &from, downloaded_at)
            .map(|_| ())
    }

    // ── Sweeps ───────────────────────────────────────────────────────────

    pub(super) fn sweep_recovery(&mut self, now: u64) {
        for request_id in self.recovery.sweep(now) {
            self.persist_request(&request_id);
            self.emit(RuntimeEvent::RecoveryExpired { request_id });
        }
        self.prompts
            .retain(|_, p| !p.expires_at.is_some_and(|at| now >= at));
    }

    pub(super) fn sweep_files(&mut self, now: u64) {
        for (vault_id, steward) in self.files.sweep(now) {
            self.emit(RuntimeEvent::FileWindowMissed { vault_id, steward });
        }
    }
}
