/// Backup configuration aggregate.
///
/// One `BackupConfig` per vault: threshold, steward list, channel endpoints
/// and the distribution version that tells stewards which shard is current.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, ValidationError};
use crate::steward::{Steward, StewardRegistry};
use crate::types::{VaultId, MAX_SHARES};

// ── BackupStatus ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupStatus {
    /// Needs (re)distribution.
    Pending,
    /// Shards of the current version are out.
    Active,
    /// Disabled by the owner.
    Inactive,
    Failed,
}

impl BackupStatus {
    pub fn description(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "waiting for distribution",
            BackupStatus::Active => "backup is active",
            BackupStatus::Inactive => "backup disabled",
            BackupStatus::Failed => "distribution failed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, BackupStatus::Active)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a configuration stopped making progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigFailure {
    NotReadyForDistribution { reason: String },
    /// Given up with shards still undelivered.
    DistributionIncomplete { undelivered: usize },
}

impl fmt::Display for ConfigFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigFailure::NotReadyForDistribution { reason } => {
                write!(f, "not ready for distribution: {reason}")
            }
            ConfigFailure::DistributionIncomplete { undelivered } => {
                write!(f, "{undelivered} shard(s) could not be delivered")
            }
        }
    }
}

// ── ChannelEndpoint ──────────────────────────────────────────────────────

/// A relay endpoint: `ws://` or `wss://` URL with a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelEndpoint(String);

impl ChannelEndpoint {
    pub fn parse(endpoint: &str) -> Result<Self> {
        let malformed = |reason: &str| ValidationError::MalformedChannel {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        };
        let url = url::Url::parse(endpoint.trim()).map_err(|e| malformed(&e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(malformed("scheme must be ws or wss").into());
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(malformed("missing host").into());
        }
        Ok(Self(endpoint.trim().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChannelEndpoint {
    type Error = crate::error::KeywardError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ChannelEndpoint> for String {
    fn from(endpoint: ChannelEndpoint) -> Self {
        endpoint.0
    }
}

impl fmt::Display for ChannelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn parse_channels(channels: &[String]) -> Result<Vec<ChannelEndpoint>> {
    if channels.is_empty() {
        return Err(ValidationError::NoChannels.into());
    }
    channels.iter().map(|c| ChannelEndpoint::parse(c)).collect()
}

pub(crate) fn validate_threshold(threshold: usize, total: usize) -> Result<()> {
    if threshold == 0 || threshold > total || total > MAX_SHARES {
        return Err(ValidationError::InvalidThreshold {
            threshold,
            total,
            max: MAX_SHARES,
        }
        .into());
    }
    Ok(())
}

// ── BackupConfig ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    pub vault_id: VaultId,
    pub specification_version: String,
    pub threshold: usize,
    pub total_keys: usize,
    pub stewards: StewardRegistry,
    pub channels: Vec<ChannelEndpoint>,
    pub instructions: Option<String>,
    pub created_at: u64,
    pub last_updated: u64,
    pub last_content_change: Option<u64>,
    pub last_redistribution: Option<u64>,
    pub content_hash: Option<String>,
    pub status: BackupStatus,
    pub last_failure: Option<ConfigFailure>,
    #[serde(default)]
    pub distribution_version: u32,
}

impl BackupConfig {
    /// Threshold bounds and steward count.
    pub fn validate(&self) -> Result<()> {
        validate_threshold(self.threshold, self.total_keys)?;
        if self.stewards.len() != self.total_keys {
            return Err(ValidationError::StewardCountMismatch {
                expected: self.total_keys,
                actual: self.stewards.len(),
            }
            .into());
        }
        if self.channels.is_empty() {
            return Err(ValidationError::NoChannels.into());
        }
        Ok(())
    }

    pub fn can_distribute(&self) -> bool {
        self.stewards.len() == self.total_keys && self.stewards.can_distribute()
    }

    pub fn needs_redistribution(&self) -> bool {
        match self.last_redistribution {
            None => true,
            Some(done) => {
                self.last_updated > done || self.last_content_change.is_some_and(|c| c > done)
            }
        }
    }

    pub fn has_version_mismatch(&self) -> bool {
        self.stewards.has_version_mismatch(self.distribution_version)
    }

    pub fn holding_count(&self) -> usize {
        self.stewards.holding_count(self.distribution_version)
    }

    /// Active and at least `threshold` stewards hold the current shard.
    pub fn is_ready(&self) -> bool {
        self.status.is_active() && self.holding_count() >= self.threshold
    }

    pub(crate) fn latest_timestamp(&self) -> u64 {
        [
            Some(self.created_at),
            Some(self.last_updated),
            self.last_content_change,
            self.last_redistribution,
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0)
    }
}

/// Input to `BackupConfigManager::create`.
#[derive(Debug, Clone)]
pub struct NewBackupConfig {
    pub vault_id: VaultId,
    pub threshold: usize,
    pub stewards: Vec<Steward>,
    pub channels: Vec<String>,
    pub instructions: Option<String>,
}

/// Partial update; `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub threshold: Option<usize>,
    pub stewards: Option<Vec<Steward>>,
    pub channels: Option<Vec<String>>,
    /// `Some(None)` clears the instructions.
    pub instructions: Option<Option<String>>,
}

impl ConfigUpdate {
    pub fn threshold(mut self, threshold: usize) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn stewards(mut self, stewards: Vec<Steward>) -> Self {
        self.stewards = Some(stewards);
        self
    }

    pub fn channels(mut self, channels: Vec<String>) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn instructions(mut self, instructions: Option<String>) -> Self {
        self.instructions = Some(instructions);
        self
    }
}
