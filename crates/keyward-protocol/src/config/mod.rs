mod manager;
mod types;

pub use manager::BackupConfigManager;
pub use types::{
    BackupConfig, BackupStatus, ChannelEndpoint, ConfigFailure, ConfigUpdate, NewBackupConfig,
};
