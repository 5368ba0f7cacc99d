use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::config::BackupConfig;
use crate::crypto::content_hash;
use crate::error::{Result, TransportError};
use crate::identity::Identity;
use crate::recovery::RecoveryRequest;
use crate::types::{now_ms, VaultId};

use super::{
    BlobRef, BlobStore, DeliveryAck, InboundMessage, MessageChannel, Repository,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── MemoryNetwork ────────────────────────────────────────────────────────

struct Mailbox {
    tx: mpsc::UnboundedSender<InboundMessage>,
    rx: Option<mpsc::UnboundedReceiver<InboundMessage>>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
struct NetworkState {
    mailboxes: HashMap<Identity, Mailbox>,
    unreachable: HashSet<Identity>,
}

/// In-process relay. Messages to identities that are not connected yet are
/// queued until they connect.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    accepted: Arc<AtomicUsize>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `identity` to the network. Connecting again replaces the
    /// previous channel; anything still queued for it is kept.
    pub fn connect(&self, identity: Identity) -> MemoryChannel {
        let mut state = lock(&self.state);
        let mailbox = state.mailboxes.entry(identity).or_insert_with(Mailbox::new);
        let rx = match mailbox.rx.take() {
            Some(rx) => rx,
            None => {
                *mailbox = Mailbox::new();
                mailbox.rx.take().unwrap_or_else(|| mpsc::unbounded_channel().1)
            }
        };
        MemoryChannel {
            local: identity,
            network: self.clone(),
            rx,
        }
    }

    /// Sends to an unreachable identity fail instead of queueing.
    pub fn set_unreachable(&self, identity: Identity, unreachable: bool) {
        let mut state = lock(&self.state);
        if unreachable {
            state.unreachable.insert(identity);
        } else {
            state.unreachable.remove(&identity);
        }
    }

    /// Payloads accepted so far.
    pub fn accepted_count(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    fn deliver(&self, from: Identity, recipient: &Identity, payload: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        if state.unreachable.contains(recipient) {
            return Err(TransportError::SendFailed {
                recipient: *recipient,
                reason: "recipient unreachable".into(),
            }
            .into());
        }
        let message = InboundMessage {
            from,
            payload: payload.to_vec(),
        };
        let mailbox = state
            .mailboxes
            .entry(*recipient)
            .or_insert_with(Mailbox::new);
        if let Err(mpsc::error::SendError(message)) = mailbox.tx.send(message) {
            // Receiver dropped: start a fresh queue for the next connect.
            *mailbox = Mailbox::new();
            mailbox
                .tx
                .send(message)
                .map_err(|_| TransportError::SendFailed {
                    recipient: *recipient,
                    reason: "mailbox closed".into(),
                })?;
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// One device's end of a `MemoryNetwork`.
pub struct MemoryChannel {
    local: Identity,
    network: MemoryNetwork,
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

impl MemoryChannel {
    pub fn local_identity(&self) -> Identity {
        self.local
    }
}

#[async_trait::async_trait]
impl MessageChannel for MemoryChannel {
    async fn send(&self, recipient: &Identity, payload: &[u8]) -> Result<DeliveryAck> {
        self.network.deliver(self.local, recipient, payload)?;
        Ok(DeliveryAck {
            message_ref: uuid::Uuid::new_v4().to_string(),
            accepted_at: now_ms(),
        })
    }

    async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

// ── MemoryBlobStore ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self {
            blobs: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `BlobUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    pub fn contains(&self, url: &str) -> bool {
        lock(&self.blobs).contains_key(url)
    }

    pub fn len(&self) -> usize {
        lock(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite stored bytes without updating any reference to them.
    pub fn tamper(&self, url: &str, data: Vec<u8>) {
        lock(&self.blobs).insert(url.to_string(), data);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(TransportError::BlobUnavailable("memory blob store offline".into()).into())
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, data: &[u8]) -> Result<BlobRef> {
        self.ensure_available()?;
        let blob = BlobRef {
            url: format!("mem://blob/{}", uuid::Uuid::new_v4()),
            content_hash: content_hash(data),
        };
        lock(&self.blobs).insert(blob.url.clone(), data.to_vec());
        Ok(blob)
    }

    async fn download(&self, url: &str, expected_hash: &str) -> Result<Vec<u8>> {
        self.ensure_available()?;
        let data = lock(&self.blobs)
            .get(url)
            .cloned()
            .ok_or_else(|| TransportError::BlobNotFound(url.to_string()))?;
        let actual = content_hash(&data);
        if !actual.eq_ignore_ascii_case(expected_hash) {
            return Err(TransportError::HashMismatch {
                expected: expected_hash.to_string(),
                actual,
            }
            .into());
        }
        Ok(data)
    }

    async fn delete(&self, url: &str) -> Result<()> {
        self.ensure_available()?;
        lock(&self.blobs).remove(url);
        Ok(())
    }
}

// ── MemoryRepository ─────────────────────────────────────────────────────

#[derive(Default)]
struct Tables {
    configs: HashMap<VaultId, BackupConfig>,
    requests: HashMap<String, RecoveryRequest>,
}

/// Shared in-memory repository. Clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repository for MemoryRepository {
    fn load_config(&self, vault_id: &VaultId) -> Result<Option<BackupConfig>> {
        Ok(lock(&self.tables).configs.get(vault_id).cloned())
    }

    fn save_config(&self, config: &BackupConfig) -> Result<()> {
        lock(&self.tables)
            .configs
            .insert(config.vault_id.clone(), config.clone());
        Ok(())
    }

    fn list_configs(&self) -> Result<Vec<BackupConfig>> {
        let mut configs: Vec<_> = lock(&self.tables).configs.values().cloned().collect();
        configs.sort_by_key(|c| c.created_at);
        Ok(configs)
    }

    fn load_recovery_request(&self, request_id: &str) -> Result<Option<RecoveryRequest>> {
        Ok(lock(&self.tables).requests.get(request_id).cloned())
    }

    fn save_recovery_request(&self, request: &RecoveryRequest) -> Result<()> {
        lock(&self.tables)
            .requests
            .insert(request.id.clone(), request.clone());
        Ok(())
    }

    fn list_recovery_requests(&self) -> Result<Vec<RecoveryRequest>> {
        let mut requests: Vec<_> = lock(&self.tables).requests.values().cloned().collect();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeywardError;
    use crate::identity::KeyIdentity;

    fn identity(seed: u8) -> Identity {
        KeyIdentity::from_seed([seed; 32]).identity()
    }

    #[tokio::test]
    async fn queued_until_connect() {
        let net = MemoryNetwork::new();
        let alice = net.connect(identity(1));
        alice.send(&identity(2), b"hello").await.unwrap();

        let mut bob = net.connect(identity(2));
        let msg = bob.recv().await.unwrap();
        assert_eq!(msg.from, identity(1));
        assert_eq!(msg.payload, b"hello");
        assert_eq!(net.accepted_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_recipient_fails() {
        let net = MemoryNetwork::new();
        let alice = net.connect(identity(1));
        net.set_unreachable(identity(2), true);
        let err = alice.send(&identity(2), b"x").await.unwrap_err();
        assert!(matches!(
            err,
            KeywardError::Transport(TransportError::SendFailed { .. })
        ));

        net.set_unreachable(identity(2), false);
        alice.send(&identity(2), b"x").await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_after_drop_receives_new_messages() {
        let net = MemoryNetwork::new();
        let alice = net.connect(identity(1));
        let bob = net.connect(identity(2));
        drop(bob);

        alice.send(&identity(2), b"later").await.unwrap();
        let mut bob = net.connect(identity(2));
        assert_eq!(bob.recv().await.unwrap().payload, b"later");
    }

    #[tokio::test]
    async fn blob_roundtrip_and_hash_check() {
        let store = MemoryBlobStore::new();
        let blob = store.upload(b"vault archive").await.unwrap();
        assert_eq!(blob.content_hash, content_hash(b"vault archive"));
        assert_eq!(
            store.download(&blob.url, &blob.content_hash).await.unwrap(),
            b"vault archive"
        );

        store.tamper(&blob.url, b"evil".to_vec());
        let err = store
            .download(&blob.url, &blob.content_hash)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KeywardError::Transport(TransportError::HashMismatch { .. })
        ));

        store.delete(&blob.url).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn blob_store_outage() {
        let store = MemoryBlobStore::new();
        store.set_available(false);
        let err = store.upload(b"x").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
