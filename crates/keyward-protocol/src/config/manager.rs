/// BackupConfigManager: owns every vault's `BackupConfig`.
///
/// Pure state: no I/O, the caller passes `now` and persists the result.
/// Timestamps recorded on a config are strictly increasing, so
/// "updated after the last redistribution" never ties.
use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::{KeywardError, Result, ValidationError};
use crate::identity::Identity;
use crate::steward::{AckOutcome, StewardRegistry};
use crate::types::{VaultId, SPECIFICATION_VERSION};

use super::types::{
    parse_channels, validate_threshold, BackupConfig, BackupStatus, ConfigFailure, ConfigUpdate,
    NewBackupConfig,
};

#[derive(Debug, Default)]
pub struct BackupConfigManager {
    configs: HashMap<VaultId, BackupConfig>,
}

/// Next timestamp for `config`: `now`, or one past the latest recorded one.
fn stamp(config: &BackupConfig, now: u64) -> u64 {
    now.max(config.latest_timestamp() + 1)
}

impl BackupConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn get(&self, vault_id: &VaultId) -> Option<&BackupConfig> {
        self.configs.get(vault_id)
    }

    pub fn configs(&self) -> impl Iterator<Item = &BackupConfig> {
        self.configs.values()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn needs_redistribution(&self, vault_id: &VaultId) -> Result<bool> {
        self.require(vault_id).map(BackupConfig::needs_redistribution)
    }

    pub fn has_version_mismatch(&self, vault_id: &VaultId) -> Result<bool> {
        self.require(vault_id).map(BackupConfig::has_version_mismatch)
    }

    pub fn is_ready(&self, vault_id: &VaultId) -> Result<bool> {
        self.require(vault_id).map(BackupConfig::is_ready)
    }

    pub fn can_distribute(&self, vault_id: &VaultId) -> Result<bool> {
        self.require(vault_id).map(BackupConfig::can_distribute)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Load a persisted config without touching its timestamps.
    pub fn restore(&mut self, config: BackupConfig) -> Result<()> {
        config.validate()?;
        self.configs.insert(config.vault_id.clone(), config);
        Ok(())
    }

    pub fn create(&mut self, new: NewBackupConfig, now: u64) -> Result<&BackupConfig> {
        if self.configs.contains_key(&new.vault_id) {
            return Err(ValidationError::DuplicateVault(new.vault_id).into());
        }
        validate_threshold(new.threshold, new.stewards.len())?;
        let stewards = StewardRegistry::new(new.stewards)?;
        let channels = parse_channels(&new.channels)?;

        let config = BackupConfig {
            vault_id: new.vault_id.clone(),
            specification_version: SPECIFICATION_VERSION.to_string(),
            threshold: new.threshold,
            total_keys: stewards.len(),
            stewards,
            channels,
            instructions: new.instructions,
            created_at: now,
            last_updated: now,
            last_content_change: None,
            last_redistribution: None,
            content_hash: None,
            status: BackupStatus::Pending,
            last_failure: None,
            distribution_version: 0,
        };
        info!(vault = %config.vault_id, threshold = config.threshold, total = config.total_keys, "backup config created");
        Ok(self.configs.entry(new.vault_id).or_insert(config))
    }

    /// Apply a partial update. Threshold, steward or channel changes move the
    /// config back to Pending; an instructions-only change does not.
    pub fn update(
        &mut self,
        vault_id: &VaultId,
        update: ConfigUpdate,
        now: u64,
    ) -> Result<&BackupConfig> {
        let current = self.require(vault_id)?;
        let mut next = current.clone();
        let mut structural = false;

        if let Some(stewards) = update.stewards {
            let registry = StewardRegistry::new(stewards)?;
            let before: Vec<_> = current.stewards.iter().map(|s| (&s.id, s.identity)).collect();
            let after: Vec<_> = registry.iter().map(|s| (&s.id, s.identity)).collect();
            structural |= before != after;
            next.total_keys = registry.len();
            next.stewards = registry;
        }
        if let Some(threshold) = update.threshold {
            structural |= threshold != current.threshold;
            next.threshold = threshold;
        }
        if let Some(channels) = update.channels {
            let channels = parse_channels(&channels)?;
            structural |= channels != current.channels;
            next.channels = channels;
        }
        if let Some(instructions) = update.instructions {
            next.instructions = instructions;
        }
        next.validate()?;

        if structural {
            next.last_updated = stamp(current, now);
            next.status = BackupStatus::Pending;
            info!(vault = %vault_id, "backup config changed, redistribution needed");
        }
        let slot = self.require_mut(vault_id)?;
        *slot = next;
        Ok(slot)
    }

    /// Vault content changed. Returns false when `content_hash` matches the
    /// recorded fingerprint and nothing was updated.
    pub fn on_content_changed(
        &mut self,
        vault_id: &VaultId,
        content_hash: Option<String>,
        now: u64,
    ) -> Result<bool> {
        let config = self.require_mut(vault_id)?;
        if content_hash.is_some() && content_hash == config.content_hash {
            debug!(vault = %vault_id, "content hash unchanged");
            return Ok(false);
        }
        config.last_content_change = Some(stamp(config, now));
        if content_hash.is_some() {
            config.content_hash = content_hash;
        }
        config.status = BackupStatus::Pending;
        Ok(true)
    }

    /// Shards of a new version are out. Returns the new distribution version.
    pub fn mark_redistributed(&mut self, vault_id: &VaultId, now: u64) -> Result<u32> {
        let config = self.require_mut(vault_id)?;
        config.last_redistribution = Some(stamp(config, now));
        config.distribution_version += 1;
        config.last_failure = None;
        config.status = if config.can_distribute() {
            BackupStatus::Active
        } else {
            BackupStatus::Pending
        };
        let version = config.distribution_version;
        let moved = config.stewards.mark_all_stale(version);
        info!(vault = %vault_id, version, stale = moved.len(), status = %config.status, "redistribution recorded");
        Ok(version)
    }

    pub fn mark_failed(&mut self, vault_id: &VaultId, failure: ConfigFailure) -> Result<()> {
        let config = self.require_mut(vault_id)?;
        info!(vault = %vault_id, %failure, "backup config failed");
        config.status = BackupStatus::Failed;
        config.last_failure = Some(failure);
        Ok(())
    }

    pub fn deactivate(&mut self, vault_id: &VaultId, now: u64) -> Result<()> {
        let config = self.require_mut(vault_id)?;
        config.status = BackupStatus::Inactive;
        debug!(vault = %vault_id, at = now, "backup deactivated");
        Ok(())
    }

    pub fn remove(&mut self, vault_id: &VaultId) -> Option<BackupConfig> {
        self.configs.remove(vault_id)
    }

    // ── Steward operations ───────────────────────────────────────────────

    /// Add an invited steward. Returns `(steward_id, invite_code)`.
    pub fn invite_steward(
        &mut self,
        vault_id: &VaultId,
        name: Option<String>,
        now: u64,
    ) -> Result<(String, String)> {
        let config = self.require_mut(vault_id)?;
        validate_threshold(config.threshold, config.stewards.len() + 1)?;
        let invite_code = uuid::Uuid::new_v4().simple().to_string();
        let steward_id = config.stewards.register_invited(name, invite_code.clone());
        config.total_keys = config.stewards.len();
        config.last_updated = stamp(config, now);
        config.status = BackupStatus::Pending;
        Ok((steward_id, invite_code))
    }

    /// An invited steward accepted with `identity`. Returns the steward id.
    pub fn accept_invitation(
        &mut self,
        vault_id: &VaultId,
        invite_code: &str,
        identity: Identity,
        now: u64,
    ) -> Result<String> {
        let config = self.require_mut(vault_id)?;
        let steward_id = config
            .stewards
            .find_by_invite_code(invite_code)
            .map(|s| s.id.clone())
            .ok_or_else(|| KeywardError::not_found("invitation", invite_code))?;
        config.stewards.attach_identity(&steward_id, identity, now)?;
        info!(vault = %vault_id, steward = %identity.short(), "invitation accepted");
        Ok(steward_id)
    }

    pub fn attach_identity(
        &mut self,
        vault_id: &VaultId,
        steward_id: &str,
        identity: Identity,
        now: u64,
    ) -> Result<()> {
        self.require_mut(vault_id)?
            .stewards
            .attach_identity(steward_id, identity, now)
    }

    /// Acknowledgment from the steward holding `identity`.
    pub fn record_acknowledgment(
        &mut self,
        vault_id: &VaultId,
        identity: &Identity,
        version: u32,
        ack_ref: Option<String>,
        now: u64,
    ) -> Result<AckOutcome> {
        let config = self.require_mut(vault_id)?;
        let current = config.distribution_version;
        let steward_id = steward_id_for(config, identity)?;
        let outcome = config
            .stewards
            .record_acknowledgment(&steward_id, version, ack_ref, current, now)?;
        debug!(vault = %vault_id, steward = %identity.short(), version, ?outcome, "acknowledgment");
        Ok(outcome)
    }

    pub fn record_shard_sent(
        &mut self,
        vault_id: &VaultId,
        identity: &Identity,
        send_ref: String,
    ) -> Result<()> {
        let config = self.require_mut(vault_id)?;
        let steward_id = steward_id_for(config, identity)?;
        config.stewards.record_sent(&steward_id, send_ref)
    }

    /// Revoking a steward who may hold a shard calls for a new distribution.
    pub fn revoke_steward(&mut self, vault_id: &VaultId, steward_id: &str, now: u64) -> Result<()> {
        let config = self.require_mut(vault_id)?;
        config.stewards.revoke(steward_id)?;
        config.last_updated = stamp(config, now);
        config.status = BackupStatus::Pending;
        info!(vault = %vault_id, steward = steward_id, "steward revoked");
        Ok(())
    }

    pub fn mark_steward_inactive(&mut self, vault_id: &VaultId, steward_id: &str) -> Result<()> {
        self.require_mut(vault_id)?.stewards.mark_inactive(steward_id)
    }

    pub fn mark_steward_error(
        &mut self,
        vault_id: &VaultId,
        steward_id: &str,
        reason: impl Into<String>,
    ) -> Result<()> {
        self.require_mut(vault_id)?
            .stewards
            .mark_error(steward_id, reason)
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn require(&self, vault_id: &VaultId) -> Result<&BackupConfig> {
        self.configs
            .get(vault_id)
            .ok_or_else(|| KeywardError::not_found("vault", vault_id))
    }

    fn require_mut(&mut self, vault_id: &VaultId) -> Result<&mut BackupConfig> {
        self.configs
            .get_mut(vault_id)
            .ok_or_else(|| KeywardError::not_found("vault", vault_id))
    }
}

fn steward_id_for(config: &BackupConfig, identity: &Identity) -> Result<String> {
    config
        .stewards
        .find_by_identity(identity)
        .map(|s| s.id.clone())
        .ok_or_else(|| KeywardError::not_found("steward", identity))
}
