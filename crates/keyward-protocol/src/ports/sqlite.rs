use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::config::BackupConfig;
use crate::error::Result;
use crate::recovery::RecoveryRequest;
use crate::types::VaultId;

use super::Repository;

/// SQLite-backed repository. Each aggregate is one row holding its JSON body.
pub struct SqliteRepository {
    conn: Connection,
}

impl SqliteRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS backup_configs (
                vault_id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS recovery_requests (
                id TEXT PRIMARY KEY,
                vault_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_recovery_vault ON recovery_requests(vault_id);",
        )?;
        Ok(Self { conn })
    }
}

impl Repository for SqliteRepository {
    fn load_config(&self, vault_id: &VaultId) -> Result<Option<BackupConfig>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM backup_configs WHERE vault_id = ?1",
                params![vault_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(Into::into))
            .transpose()
    }

    fn save_config(&self, config: &BackupConfig) -> Result<()> {
        let body = serde_json::to_string(config)?;
        self.conn.execute(
            "INSERT INTO backup_configs (vault_id, created_at, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(vault_id) DO UPDATE SET body = excluded.body",
            params![config.vault_id.as_str(), config.created_at as i64, body],
        )?;
        Ok(())
    }

    fn list_configs(&self) -> Result<Vec<BackupConfig>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM backup_configs ORDER BY created_at, vault_id")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Into::into))
            .collect()
    }

    fn load_recovery_request(&self, request_id: &str) -> Result<Option<RecoveryRequest>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM recovery_requests WHERE id = ?1",
                params![request_id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(Into::into))
            .transpose()
    }

    fn save_recovery_request(&self, request: &RecoveryRequest) -> Result<()> {
        let body = serde_json::to_string(request)?;
        self.conn.execute(
            "INSERT INTO recovery_requests (id, vault_id, created_at, status, body)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, body = excluded.body",
            params![
                request.id,
                request.vault_id.as_str(),
                request.created_at as i64,
                request.status.to_string(),
                body
            ],
        )?;
        Ok(())
    }

    fn list_recovery_requests(&self) -> Result<Vec<RecoveryRequest>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM recovery_requests ORDER BY created_at, id")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupConfigManager, NewBackupConfig};
    use crate::identity::KeyIdentity;
    use crate::steward::Steward;

    fn config(vault: &str) -> BackupConfig {
        let mut mgr = BackupConfigManager::new();
        mgr.create(
            NewBackupConfig {
                vault_id: VaultId::from(vault),
                threshold: 1,
                stewards: vec![Steward::with_identity(
                    KeyIdentity::from_seed([1; 32]).identity(),
                    Some("Ann".into()),
                )],
                channels: vec!["wss://relay.example".into()],
                instructions: None,
            },
            100,
        )
        .unwrap()
        .clone()
    }

    #[test]
    fn save_and_load_config() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        assert!(repo.load_config(&VaultId::from("v1")).unwrap().is_none());

        let mut cfg = config("v1");
        repo.save_config(&cfg).unwrap();
        assert_eq!(repo.load_config(&cfg.vault_id).unwrap().unwrap(), cfg);

        cfg.distribution_version = 3;
        repo.save_config(&cfg).unwrap();
        let configs = repo.list_configs().unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].distribution_version, 3);
    }
}
