//! Shared fixtures for integration tests: an in-memory chain with a failure
//! switch and a gate that holds the next publish open.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use stardust_chat::{
    export_public_key, session_id_for, ChainClient, ChainError, ChainEvent, ChatConfig,
    ChatService, Cid, InMemoryContentStore, KeyPair, MessageMetadata, MessageRecord,
    PublishReceipt, SessionRecord,
};
use tokio::sync::{mpsc, oneshot};

pub type Service = ChatService<MockChain, InMemoryContentStore>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
pub struct MockChain {
    keys: Mutex<HashMap<String, Vec<u8>>>,
    offline: AtomicBool,
    hold: Mutex<Option<oneshot::Receiver<()>>>,
    next_id: AtomicU64,
    resolve_calls: AtomicUsize,
    records: Mutex<Vec<MessageRecord>>,
    sessions: Mutex<Vec<SessionRecord>>,
    read_marks: Mutex<Vec<u64>>,
    subscribers: Mutex<Vec<mpsc::Sender<ChainEvent>>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the chat key of `identity`.
    pub fn register(&self, identity: &str, key_pair: &KeyPair) {
        self.keys
            .lock()
            .insert(identity.to_string(), export_public_key(key_pair.public_key()));
    }

    /// While offline every call fails with a network error.
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Hold the next publish until the returned sender fires (or drops).
    pub fn hold_next_publish(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.hold.lock() = Some(rx);
        tx
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<MessageRecord> {
        self.records.lock().clone()
    }

    pub fn last_record(&self) -> MessageRecord {
        self.records.lock().last().cloned().expect("nothing published")
    }

    pub fn add_record(&self, record: MessageRecord) {
        self.records.lock().push(record);
    }

    pub fn add_session(&self, record: SessionRecord) {
        self.sessions.lock().push(record);
    }

    pub fn read_marks(&self) -> Vec<u64> {
        self.read_marks.lock().clone()
    }

    pub async fn emit(&self, event: ChainEvent) {
        let subscribers = self.subscribers.lock().clone();
        for tx in subscribers {
            let _ = tx.send(event.clone()).await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Drop every subscription sender so subscribers see the stream end.
    pub fn close_subscriptions(&self) {
        self.subscribers.lock().clear();
    }

    fn check_online(&self) -> Result<(), ChainError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ChainError::Network("node unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl ChainClient for MockChain {
    async fn resolve_identity(&self, identity: &str) -> Result<Option<Vec<u8>>, ChainError> {
        self.check_online()?;
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.keys.lock().get(identity).cloned())
    }

    async fn publish_message_reference(
        &self,
        session_id: &str,
        cid: &Cid,
        metadata: &MessageMetadata,
    ) -> Result<PublishReceipt, ChainError> {
        let hold = self.hold.lock().take();
        if let Some(gate) = hold {
            let _ = gate.await;
        }
        self.check_online()?;

        let msg_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let block_number = 1000 + msg_id;
        self.records.lock().push(MessageRecord {
            msg_id,
            session_id: session_id.to_string(),
            sender: metadata.sender.clone(),
            receiver: metadata.receiver.clone(),
            content_cid: cid.clone(),
            msg_type: metadata.msg_type,
            block_number,
            is_read: false,
            is_deleted_by_sender: false,
            is_deleted_by_receiver: false,
        });
        Ok(PublishReceipt {
            msg_id,
            block_number,
        })
    }

    async fn list_sessions(&self, _identity: &str) -> Result<Vec<SessionRecord>, ChainError> {
        self.check_online()?;
        Ok(self.sessions.lock().clone())
    }

    async fn list_messages(
        &self,
        session_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, ChainError> {
        self.check_online()?;
        let all: Vec<MessageRecord> = self
            .records
            .lock()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        let end = all.len().saturating_sub(offset as usize);
        let start = end.saturating_sub(limit as usize);
        Ok(all[start..end].to_vec())
    }

    async fn mark_as_read(&self, msg_ids: &[u64]) -> Result<(), ChainError> {
        self.check_online()?;
        self.read_marks.lock().extend_from_slice(msg_ids);
        Ok(())
    }

    async fn mark_session_as_read(&self, _session_id: &str) -> Result<(), ChainError> {
        self.check_online()
    }

    async fn delete_message(&self, _msg_id: u64) -> Result<(), ChainError> {
        self.check_online()
    }

    async fn archive_session(&self, _session_id: &str) -> Result<(), ChainError> {
        self.check_online()
    }

    async fn block_user(&self, _identity: &str) -> Result<(), ChainError> {
        self.check_online()
    }

    async fn unblock_user(&self, _identity: &str) -> Result<(), ChainError> {
        self.check_online()
    }

    async fn subscribe_messages(&self) -> Result<mpsc::Receiver<ChainEvent>, ChainError> {
        self.check_online()?;
        let (tx, rx) = mpsc::channel(16);
        self.subscribers.lock().push(tx);
        Ok(rx)
    }
}

/// Two parties sharing one chain and one content store.
pub struct Network {
    pub chain: Arc<MockChain>,
    pub content: Arc<InMemoryContentStore>,
    pub alice: Arc<Service>,
    pub bob: Arc<Service>,
}

pub const ALICE: &str = "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY";
pub const BOB: &str = "5FHneW46xGXgs5mUiveU4sbTyGBzmstUspZC92UhjJM694ty";

impl Network {
    pub fn new() -> Self {
        Self::with_config(ChatConfig::localnet())
    }

    pub fn with_config(config: ChatConfig) -> Self {
        init_tracing();
        let chain = Arc::new(MockChain::new());
        let content = Arc::new(InMemoryContentStore::new());

        let alice_keys = KeyPair::generate();
        let bob_keys = KeyPair::generate();
        chain.register(ALICE, &alice_keys);
        chain.register(BOB, &bob_keys);

        let alice = Arc::new(ChatService::new(
            ALICE,
            alice_keys,
            config.clone(),
            chain.clone(),
            content.clone(),
        ));
        let bob = Arc::new(ChatService::new(
            BOB,
            bob_keys,
            config,
            chain.clone(),
            content.clone(),
        ));

        Self {
            chain,
            content,
            alice,
            bob,
        }
    }

    pub fn session_id(&self) -> String {
        session_id_for(ALICE, BOB)
    }
}
