/// DistributionCoordinator: splits a vault key and pushes one shard per steward.
///
/// `prepare`, `record_send`, `retry_failed` and `abandon` are pure and
/// return actions; `distribute` and `retry` drive them over a channel.
/// A vault has at most one pending distribution, and retries resend its
/// shares rather than drawing a new polynomial. A pending distribution is
/// only valid for the config state it was split from.
use std::collections::{BTreeMap, HashMap};

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::{BackupConfig, BackupConfigManager, ConfigFailure};
use crate::error::{KeywardError, ProtocolError, Result};
use crate::identity::Identity;
use crate::message::CustodyMessage;
use crate::ports::MessageChannel;
use crate::sharing::{self, ShardData};
use crate::types::VaultId;

use super::types::*;

pub struct DistributionCoordinator {
    local_id: Identity,
    owner_name: Option<String>,
    pending: HashMap<VaultId, PendingDistribution>,
}

impl DistributionCoordinator {
    pub fn new(local_id: Identity) -> Self {
        Self {
            local_id,
            owner_name: None,
            pending: HashMap::new(),
        }
    }

    /// Name shown to stewards in every shard.
    pub fn with_owner_name(mut self, name: Option<String>) -> Self {
        self.owner_name = name;
        self
    }

    pub fn pending(&self, vault_id: &VaultId) -> Option<&PendingDistribution> {
        self.pending.get(vault_id)
    }

    pub fn has_pending(&self, vault_id: &VaultId) -> bool {
        self.pending.contains_key(vault_id)
    }

    // ── Preparation ──────────────────────────────────────────────────────

    /// Split `secret` for `config` and stage one shard per steward.
    ///
    /// Replaces any distribution still pending for the vault.
    pub fn prepare(
        &mut self,
        config: &BackupConfig,
        secret: &[u8],
        files: Option<&VaultFiles>,
        now: u64,
    ) -> Result<Vec<DistributionAction>> {
        let vault_id = &config.vault_id;
        if !config.can_distribute() {
            return Err(not_ready(vault_id, "every steward needs an identity"));
        }
        if config.stewards.len() != config.total_keys {
            return Err(not_ready(vault_id, "steward count differs from total keys"));
        }
        let stewards = config.stewards.identities();
        if stewards.len() != config.total_keys {
            return Err(not_ready(vault_id, "steward identities missing"));
        }

        // Shards of a replacement must sort after the ones they replace.
        let created_at = match self.pending.get(vault_id) {
            Some(previous) => now.max(previous.started_at + 1),
            None => now,
        };
        let target_version = config.distribution_version + 1;
        let shares = sharing::split(
            secret,
            config.threshold,
            config.total_keys,
            self.local_id,
            created_at,
        )?;
        let channels: Vec<String> = config
            .channels
            .iter()
            .map(|c| c.as_str().to_string())
            .collect();

        let mut shards = BTreeMap::new();
        for (share, steward) in shares.into_iter().zip(&stewards) {
            let shard = ShardData {
                vault_id: Some(vault_id.clone()),
                peers: stewards.iter().filter(|p| *p != steward).copied().collect(),
                channels: channels.clone(),
                owner_name: self.owner_name.clone(),
                instructions: config.instructions.clone(),
                recipient: Some(*steward),
                distribution_version: target_version,
                ..share
            };
            let shard = match files {
                Some(files) => ShardData {
                    blob_urls: files.urls.clone(),
                    blob_hashes: files.hashes.clone(),
                    file_names: files.names.clone(),
                    blob_expires_at: files.expires_at,
                    ..shard
                },
                None => shard,
            };
            shards.insert(*steward, shard);
        }

        if self.pending.contains_key(vault_id) {
            debug!(vault = %vault_id, "replacing pending distribution");
        }
        info!(vault = %vault_id, target_version, stewards = shards.len(), threshold = config.threshold, "distribution prepared");

        let mut actions = send_actions(vault_id, shards.values());
        actions.push(DistributionAction::Event(DistributionEvent::Prepared {
            vault_id: vault_id.clone(),
            target_version,
            stewards: shards.len(),
        }));
        self.pending.insert(
            vault_id.clone(),
            PendingDistribution {
                vault_id: vault_id.clone(),
                target_version,
                basis: ConfigBasis::of(config),
                shards,
                delivered: BTreeMap::new(),
                failures: BTreeMap::new(),
                early_acks: BTreeMap::new(),
                started_at: created_at,
            },
        );
        Ok(actions)
    }

    /// Drop the pending distribution if `config` changed since it was
    /// prepared. Returns the `Superseded` event when one was dropped.
    pub fn discard_if_stale(&mut self, config: &BackupConfig) -> Option<DistributionEvent> {
        let vault_id = &config.vault_id;
        let pending = self.pending.get(vault_id)?;
        if pending.basis == ConfigBasis::of(config) {
            return None;
        }
        let pending = self.pending.remove(vault_id)?;
        let undelivered = pending.undelivered().len();
        warn!(vault = %vault_id, target = pending.target_version, undelivered, "config changed, pending distribution dropped");
        Some(DistributionEvent::Superseded {
            vault_id: vault_id.clone(),
            target_version: pending.target_version,
            undelivered,
        })
    }

    fn ensure_current(&mut self, vault_id: &VaultId, manager: &BackupConfigManager) -> Result<()> {
        if !self.pending.contains_key(vault_id) {
            return Err(ProtocolError::NoPendingDistribution(vault_id.clone()).into());
        }
        let config = manager
            .get(vault_id)
            .ok_or_else(|| KeywardError::not_found("vault", vault_id))?;
        match self.discard_if_stale(config) {
            Some(_) => Err(ProtocolError::DistributionSuperseded(vault_id.clone()).into()),
            None => Ok(()),
        }
    }

    // ── Feedback ─────────────────────────────────────────────────────────

    /// Feed back the channel's answer for one steward's shard.
    ///
    /// Once every send is accepted the new version is recorded on the config
    /// and buffered acknowledgments are applied. Fails with
    /// `DistributionSuperseded` if the config changed since `prepare`.
    pub fn record_send(
        &mut self,
        vault_id: &VaultId,
        steward: &Identity,
        outcome: SendOutcome,
        manager: &mut BackupConfigManager,
        now: u64,
    ) -> Result<Vec<DistributionAction>> {
        self.ensure_current(vault_id, manager)?;
        let pending = self
            .pending
            .get_mut(vault_id)
            .ok_or_else(|| ProtocolError::NoPendingDistribution(vault_id.clone()))?;
        if !pending.shards.contains_key(steward) {
            return Err(KeywardError::not_found("steward", steward));
        }

        let mut actions = Vec::new();
        match outcome {
            SendOutcome::Accepted { message_ref } => {
                manager.record_shard_sent(vault_id, steward, message_ref.clone())?;
                pending.failures.remove(steward);
                pending.delivered.insert(*steward, message_ref.clone());
                actions.push(DistributionAction::Event(DistributionEvent::ShardSent {
                    vault_id: vault_id.clone(),
                    steward: *steward,
                    message_ref,
                }));
            }
            SendOutcome::Failed { reason } => {
                warn!(vault = %vault_id, steward = %steward.short(), "shard send failed: {reason}");
                pending.failures.insert(*steward, reason.clone());
                actions.push(DistributionAction::Event(DistributionEvent::ShardFailed {
                    vault_id: vault_id.clone(),
                    steward: *steward,
                    reason,
                }));
            }
        }

        if !pending.is_complete() {
            return Ok(actions);
        }
        let Some(done) = self.pending.remove(vault_id) else {
            return Ok(actions);
        };
        let version = manager.mark_redistributed(vault_id, now)?;
        if version != done.target_version {
            warn!(vault = %vault_id, version, target = done.target_version, "config version moved during distribution");
        }
        for (identity, ack_ref) in done.early_acks {
            if let Err(e) = manager.record_acknowledgment(vault_id, &identity, version, ack_ref, now) {
                debug!(vault = %vault_id, steward = %identity.short(), "buffered ack dropped: {e}");
            }
        }
        info!(vault = %vault_id, version, "distribution completed");
        actions.push(DistributionAction::Event(DistributionEvent::Completed {
            vault_id: vault_id.clone(),
            version,
        }));
        Ok(actions)
    }

    /// Route an inbound acknowledgment.
    ///
    /// An ack for the version still being distributed is held back until
    /// that version is recorded, everything else goes to the manager.
    pub fn record_ack(
        &mut self,
        vault_id: &VaultId,
        from: &Identity,
        version: u32,
        ack_ref: Option<String>,
        manager: &mut BackupConfigManager,
        now: u64,
    ) -> Result<AckDisposition> {
        if let Some(pending) = self.pending.get_mut(vault_id) {
            if pending.target_version == version && pending.shards.contains_key(from) {
                debug!(vault = %vault_id, steward = %from.short(), version, "ack buffered");
                pending.early_acks.insert(*from, ack_ref);
                return Ok(AckDisposition::Buffered);
            }
        }
        manager
            .record_acknowledgment(vault_id, from, version, ack_ref, now)
            .map(AckDisposition::Recorded)
    }

    /// Resend the shards of the pending distribution that were not accepted.
    pub fn retry_failed(
        &mut self,
        vault_id: &VaultId,
        manager: &BackupConfigManager,
    ) -> Result<Vec<DistributionAction>> {
        self.ensure_current(vault_id, manager)?;
        let pending = self
            .pending
            .get(vault_id)
            .ok_or_else(|| ProtocolError::NoPendingDistribution(vault_id.clone()))?;
        let undelivered = pending.undelivered();
        Ok(send_actions(
            vault_id,
            undelivered.iter().filter_map(|id| pending.shards.get(id)),
        ))
    }

    /// Give up on the pending distribution and mark the config Failed.
    /// Shards already accepted are not retracted.
    pub fn abandon(
        &mut self,
        vault_id: &VaultId,
        manager: &mut BackupConfigManager,
    ) -> Result<Vec<DistributionAction>> {
        let pending = self
            .pending
            .remove(vault_id)
            .ok_or_else(|| ProtocolError::NoPendingDistribution(vault_id.clone()))?;
        let undelivered = pending.undelivered().len();
        manager.mark_failed(vault_id, ConfigFailure::DistributionIncomplete { undelivered })?;
        Ok(vec![DistributionAction::Event(DistributionEvent::Abandoned {
            vault_id: vault_id.clone(),
            undelivered,
        })])
    }

    // ── Async drivers ────────────────────────────────────────────────────

    /// Prepare and send every shard concurrently.
    ///
    /// A config that is not ready is marked Failed with the reason.
    pub async fn distribute<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &C,
        manager: &mut BackupConfigManager,
        vault_id: &VaultId,
        secret: &[u8],
        files: Option<&VaultFiles>,
        now: u64,
    ) -> Result<DistributionResult> {
        let config = manager
            .get(vault_id)
            .ok_or_else(|| KeywardError::not_found("vault", vault_id))?;
        let actions = match self.prepare(config, secret, files, now) {
            Ok(actions) => actions,
            Err(KeywardError::Protocol(ProtocolError::NotReadyForDistribution {
                vault_id,
                reason,
            })) => {
                manager.mark_failed(
                    &vault_id,
                    ConfigFailure::NotReadyForDistribution {
                        reason: reason.clone(),
                    },
                )?;
                return Err(ProtocolError::NotReadyForDistribution { vault_id, reason }.into());
            }
            Err(e) => return Err(e),
        };
        self.execute(channel, manager, vault_id, actions, now).await
    }

    /// Resend undelivered shards of the pending distribution.
    pub async fn retry<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &C,
        manager: &mut BackupConfigManager,
        vault_id: &VaultId,
        now: u64,
    ) -> Result<DistributionResult> {
        let actions = self.retry_failed(vault_id, manager)?;
        self.execute(channel, manager, vault_id, actions, now).await
    }

    async fn execute<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &C,
        manager: &mut BackupConfigManager,
        vault_id: &VaultId,
        actions: Vec<DistributionAction>,
        now: u64,
    ) -> Result<DistributionResult> {
        let target_version = self
            .pending
            .get(vault_id)
            .map(|p| p.target_version)
            .unwrap_or_default();
        let mut events = Vec::new();
        let mut sends = Vec::new();
        for action in actions {
            match action {
                DistributionAction::SendShard { to, message, .. } => sends.push((to, message)),
                DistributionAction::Event(event) => events.push(event),
            }
        }

        let results = join_all(sends.iter().map(|(to, message)| async move {
            let payload = message.seal_for(to)?;
            channel.send(to, &payload).await
        }))
        .await;

        let mut outcomes = Vec::with_capacity(sends.len());
        let mut new_version = None;
        for ((to, _), result) in sends.iter().zip(results) {
            let outcome = match result {
                Ok(ack) => SendOutcome::Accepted {
                    message_ref: ack.message_ref,
                },
                Err(e) => SendOutcome::Failed {
                    reason: e.to_string(),
                },
            };
            for action in self.record_send(vault_id, to, outcome.clone(), manager, now)? {
                if let DistributionAction::Event(event) = action {
                    if let DistributionEvent::Completed { version, .. } = &event {
                        new_version = Some(*version);
                    }
                    events.push(event);
                }
            }
            outcomes.push(StewardOutcome {
                steward: *to,
                outcome,
            });
        }

        Ok(DistributionResult {
            vault_id: vault_id.clone(),
            target_version,
            outcomes,
            events,
            completed: new_version.is_some(),
            new_version,
        })
    }
}

fn not_ready(vault_id: &VaultId, reason: &str) -> KeywardError {
    ProtocolError::NotReadyForDistribution {
        vault_id: vault_id.clone(),
        reason: reason.to_string(),
    }
    .into()
}

fn send_actions<'a>(
    vault_id: &VaultId,
    shards: impl Iterator<Item = &'a ShardData>,
) -> Vec<DistributionAction> {
    shards
        .filter_map(|shard| {
            Some(DistributionAction::SendShard {
                to: shard.recipient?,
                vault_id: vault_id.clone(),
                message: CustodyMessage::ShardDistribution {
                    shard: shard.clone(),
                },
            })
        })
        .collect()
}
