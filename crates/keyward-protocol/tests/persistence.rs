/// Persistence across restarts: SQLite repository and runtime reload.
use std::sync::Arc;

use keyward_protocol::{
    BackupConfigManager, BackupStatus, BlobStore, KeyIdentity, KeywardRuntime, MemoryBlobStore,
    MemoryNetwork, MemoryRepository, NewBackupConfig, RecoveryCoordinator, RecoveryParams,
    RecoveryStatus, Repository, RuntimeConfig, SqliteRepository, Steward, VaultId,
};

fn identity(seed: u8) -> keyward_protocol::Identity {
    KeyIdentity::from_seed([seed; 32]).identity()
}

fn new_config(vault: &str) -> NewBackupConfig {
    NewBackupConfig {
        vault_id: VaultId::from(vault),
        threshold: 2,
        stewards: vec![
            Steward::with_identity(identity(2), Some("Alan".into())),
            Steward::with_identity(identity(3), None),
            Steward::invited(Some("Barbara".into()), "invite-1"),
        ],
        channels: vec!["wss://relay.example.com".into()],
        instructions: Some("ask twice".into()),
    }
}

#[test]
fn sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keyward.db");

    let mut manager = BackupConfigManager::new();
    let config = manager.create(new_config("vault-a"), 100).unwrap().clone();
    let mut recovery = RecoveryCoordinator::new(identity(1));
    let (request_id, _) = recovery
        .initiate(
            RecoveryParams {
                vault_id: VaultId::from("vault-a"),
                stewards: vec![identity(2), identity(3)],
                threshold: 2,
                expires_at: Some(10_000),
            },
            200,
        )
        .unwrap();
    recovery
        .record_response(&request_id, &identity(2), false, None, 300, 300)
        .unwrap();
    let request = recovery.get(&request_id).unwrap().clone();

    {
        let repo = SqliteRepository::open(&path).unwrap();
        repo.save_config(&config).unwrap();
        repo.save_recovery_request(&request).unwrap();
    }

    let repo = SqliteRepository::open(&path).unwrap();
    let loaded = repo.load_config(&VaultId::from("vault-a")).unwrap().unwrap();
    assert_eq!(loaded, config);
    assert_eq!(repo.list_configs().unwrap().len(), 1);

    let loaded = repo.load_recovery_request(&request_id).unwrap().unwrap();
    assert_eq!(loaded, request);
    assert_eq!(loaded.status, RecoveryStatus::Failed);
    assert!(repo.load_recovery_request("missing").unwrap().is_none());
}

#[test]
fn sqlite_upsert_replaces_body() {
    let repo = SqliteRepository::open_in_memory().unwrap();
    let mut manager = BackupConfigManager::new();
    manager.create(new_config("vault-b"), 100).unwrap();
    repo.save_config(manager.get(&VaultId::from("vault-b")).unwrap())
        .unwrap();

    manager.deactivate(&VaultId::from("vault-b"), 200).unwrap();
    repo.save_config(manager.get(&VaultId::from("vault-b")).unwrap())
        .unwrap();

    let configs = repo.list_configs().unwrap();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].status, BackupStatus::Inactive);
}

#[tokio::test]
async fn runtime_reloads_configs() {
    let network = MemoryNetwork::new();
    let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    let repository = MemoryRepository::new();
    let owner = KeyIdentity::from_seed([1; 32]);

    let first = KeywardRuntime::spawn(
        owner.clone(),
        network.connect(owner.identity()),
        blobs.clone(),
        Box::new(repository.clone()),
        RuntimeConfig::default(),
    )
    .unwrap();
    first
        .handle
        .create_backup_config(new_config("vault-c"))
        .await
        .unwrap();
    first
        .handle
        .content_changed(VaultId::from("vault-c"), Some("h1".into()))
        .await
        .unwrap();
    first.handle.shutdown().await;

    let stored = repository
        .load_config(&VaultId::from("vault-c"))
        .unwrap()
        .unwrap();
    assert_eq!(stored.content_hash.as_deref(), Some("h1"));

    let second = KeywardRuntime::spawn(
        owner.clone(),
        network.connect(owner.identity()),
        blobs,
        Box::new(repository),
        RuntimeConfig::default(),
    )
    .unwrap();
    let config = second
        .handle
        .config(VaultId::from("vault-c"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(config, stored);
    assert!(second
        .handle
        .needs_redistribution(VaultId::from("vault-c"))
        .await
        .unwrap());
}
