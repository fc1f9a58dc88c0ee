//! Main chat service for end-to-end encrypted messaging.
//!
//! This module ties the crypto engine, the content store and the chain
//! collaborator to the [`ChatStore`] read model. Sends are two-phase: the
//! provisional message is inserted synchronously, then the network
//! round-trip settles it as sent or failed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use x25519_dalek::PublicKey;

use crate::blockchain::{
    resolve_public_key, ChainClient, ChainConfig, ChainEvent, MessageMetadata, MessageRecord,
    PublishReceipt,
};
use crate::codec::{ChatPayload, MessageCodec};
use crate::crypto::{default_provider, CryptoProvider};
use crate::keys::{export_public_key, KeyPair, SharedKey};
use crate::models::{Message, MessageId, MessageStatus, MessageType, OutgoingMessage, Session};
use crate::storage::{Cid, ContentStore, PublicKeyCache};
use crate::store::{ChatStore, DEFAULT_PREVIEW_LEN};
use crate::types::{ChatError, DeliveryError, Result, MAX_RETRIES};

/// Configuration for the chat service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Node and gateway settings.
    pub chain: ChainConfig,
    /// Retry budget per message. Values above 3 are treated as 3.
    pub max_retries: u32,
    /// How long resolved public keys are cached.
    pub key_cache_ttl: Duration,
    /// Messages fetched per history page.
    pub page_size: u32,
    /// Length of session-list previews, in characters.
    pub preview_len: usize,
}

impl ChatConfig {
    /// Creates a new configuration with the given chain settings.
    pub fn new(chain: ChainConfig) -> Self {
        Self {
            chain,
            max_retries: MAX_RETRIES,
            key_cache_ttl: Duration::from_secs(24 * 60 * 60),
            page_size: 50,
            preview_len: DEFAULT_PREVIEW_LEN,
        }
    }

    /// Creates a configuration for a local development node.
    pub fn localnet() -> Self {
        Self::new(ChainConfig::localnet())
    }

    /// The retry budget actually enforced.
    pub fn effective_max_retries(&self) -> u32 {
        self.max_retries.min(MAX_RETRIES)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::localnet()
    }
}

/// A send whose provisional message is already visible and whose network
/// round-trip has not run yet. Consumed by [`ChatService::complete`].
#[derive(Debug)]
#[must_use = "the message stays in `sending` until the pending send is completed"]
pub struct PendingSend {
    temp_id: String,
    message: Message,
    payload: ChatPayload,
}

impl PendingSend {
    fn new(message: Message) -> Self {
        Self {
            temp_id: message.id.to_string(),
            payload: ChatPayload::from_message(&message),
            message,
        }
    }

    /// Temporary id of the provisional message.
    pub fn temp_id(&self) -> &str {
        &self.temp_id
    }

    /// The provisional message as inserted.
    pub fn message(&self) -> &Message {
        &self.message
    }
}

/// The chat client for one local identity.
pub struct ChatService<C, S>
where
    C: ChainClient,
    S: ContentStore,
{
    /// The local identity (account address).
    identity: String,
    /// The device's chat key pair.
    key_pair: KeyPair,
    /// Configuration.
    config: ChatConfig,
    /// Chain collaborator.
    chain: Arc<C>,
    /// Encrypt-and-upload pipeline.
    codec: MessageCodec<S>,
    /// Crypto backend.
    crypto: Arc<dyn CryptoProvider>,
    /// Counterpart public keys.
    public_key_cache: PublicKeyCache,
    /// Read model. Never held across an await.
    state: RwLock<ChatStore>,
}

impl<C, S> ChatService<C, S>
where
    C: ChainClient,
    S: ContentStore,
{
    /// Creates a service for `identity` with the platform crypto provider.
    pub fn new(
        identity: &str,
        key_pair: KeyPair,
        config: ChatConfig,
        chain: Arc<C>,
        content_store: Arc<S>,
    ) -> Self {
        Self::with_provider(identity, key_pair, config, chain, content_store, default_provider())
    }

    /// Creates a service with an explicit crypto provider.
    pub fn with_provider(
        identity: &str,
        key_pair: KeyPair,
        config: ChatConfig,
        chain: Arc<C>,
        content_store: Arc<S>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Self {
        let state = ChatStore::new(identity)
            .with_limits(config.effective_max_retries(), config.preview_len);

        Self {
            identity: identity.to_string(),
            key_pair,
            codec: MessageCodec::new(content_store, crypto.clone()),
            crypto,
            public_key_cache: PublicKeyCache::new(config.key_cache_ttl),
            state: RwLock::new(state),
            config,
            chain,
        }
    }

    /// Returns the local identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the chat public key.
    pub fn public_key(&self) -> &PublicKey {
        self.key_pair.public_key()
    }

    /// Returns the chat public key in the form published on chain.
    pub fn exported_public_key(&self) -> Vec<u8> {
        export_public_key(self.key_pair.public_key())
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Returns the chain collaborator.
    pub fn chain(&self) -> &Arc<C> {
        &self.chain
    }

    /// Returns the content store.
    pub fn content_store(&self) -> &Arc<S> {
        self.codec.store()
    }

    /// Returns the public key cache.
    pub fn public_key_cache(&self) -> &PublicKeyCache {
        &self.public_key_cache
    }

    // ------------------------------------------------------------------
    // Read model
    // ------------------------------------------------------------------

    /// A copy of the whole read model. Message lists are shared, not copied.
    pub fn snapshot(&self) -> ChatStore {
        self.state.read().clone()
    }

    /// Lists all sessions.
    pub fn sessions(&self) -> Vec<Session> {
        self.state.read().sessions().to_vec()
    }

    /// A session by id.
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.state.read().session(session_id).cloned()
    }

    /// Snapshot of a session's messages.
    pub fn messages(&self, session_id: &str) -> Arc<Vec<Message>> {
        self.state.read().messages(session_id)
    }

    /// A message by temporary id.
    pub fn message_by_temp_id(&self, temp_id: &str) -> Option<Message> {
        self.state.read().message_by_temp_id(temp_id).cloned()
    }

    /// Unread messages across every session.
    pub fn total_unread(&self) -> u32 {
        self.state.read().total_unread()
    }

    /// The selected session.
    pub fn current_session(&self) -> Option<Session> {
        self.state.read().current_session().cloned()
    }

    /// Selects a session.
    pub fn select_session(&self, session_id: &str) -> Result<Session> {
        Ok(self.state.write().select_session(session_id)?)
    }

    /// Whether `identity` is blocked.
    pub fn is_blocked(&self, identity: &str) -> bool {
        self.state.read().is_blocked(identity)
    }

    /// Blocked identities.
    pub fn blocked_users(&self) -> Vec<String> {
        self.state.read().blocked_users()
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Inserts the provisional message and returns the pending round-trip.
    ///
    /// The message is visible to readers as soon as this returns.
    pub fn begin_send(&self, receiver: &str, outgoing: OutgoingMessage) -> PendingSend {
        PendingSend::new(self.state.write().insert_provisional(receiver, outgoing))
    }

    /// Moves a failed message back to `Sending` and returns the pending
    /// round-trip. Rejected synchronously when the message is not failed or
    /// has no retries left.
    pub fn begin_retry(&self, temp_id: &str) -> Result<PendingSend> {
        let message = self.state.write().begin_retry(temp_id)?;
        Ok(PendingSend::new(message))
    }

    /// Runs the round-trip of a pending send and settles the message.
    ///
    /// Delivery failures do not surface as `Err`: the returned message is
    /// `Failed` and carries the error.
    pub async fn complete(&self, pending: PendingSend) -> Result<Message> {
        let outcome = self.round_trip(&pending).await;

        let settled = {
            let mut state = self.state.write();
            match outcome {
                Ok((receipt, cid)) => {
                    state.confirm(&pending.temp_id, receipt.msg_id, receipt.block_number, cid)
                }
                Err(error) => state.fail(&pending.temp_id, error),
            }
        };

        settled.ok_or_else(|| DeliveryError::MessageNotFound(pending.temp_id).into())
    }

    /// Sends a message: provisional insert, then the round-trip.
    pub async fn send(&self, receiver: &str, outgoing: OutgoingMessage) -> Result<Message> {
        let pending = self.begin_send(receiver, outgoing);
        self.complete(pending).await
    }

    /// Sends `content` of `msg_type` to `receiver`.
    pub async fn send_message(
        &self,
        receiver: &str,
        content: &str,
        msg_type: MessageType,
    ) -> Result<Message> {
        self.send(receiver, OutgoingMessage::new(content, msg_type)).await
    }

    /// Retries a failed message.
    pub async fn retry_message(&self, temp_id: &str) -> Result<Message> {
        let pending = self.begin_retry(temp_id)?;
        self.complete(pending).await
    }

    /// Discards a failed message.
    pub fn remove_failed_message(&self, temp_id: &str) -> Result<Message> {
        Ok(self.state.write().remove_failed(temp_id)?)
    }

    async fn round_trip(&self, pending: &PendingSend) -> Result<(PublishReceipt, Cid)> {
        let message = &pending.message;
        let key = self.shared_key_for(&message.receiver).await?;
        let cid = self.codec.encrypt_and_upload(&pending.payload, &key).await?;
        debug!(temp_id = %pending.temp_id, cid = %cid, "payload uploaded");

        let metadata = MessageMetadata {
            sender: message.sender.clone(),
            receiver: message.receiver.clone(),
            msg_type: message.msg_type,
        };
        let receipt = self
            .chain
            .publish_message_reference(&message.session_id, &cid, &metadata)
            .await?;
        Ok((receipt, cid))
    }

    async fn shared_key_for(&self, counterpart: &str) -> Result<SharedKey> {
        let public_key = match self.public_key_cache.retrieve(counterpart) {
            Some(key) => key,
            None => {
                let key = resolve_public_key(self.chain.as_ref(), counterpart).await?;
                self.public_key_cache.store(counterpart, key);
                debug!(identity = counterpart, "resolved public key");
                key
            }
        };
        Ok(self.crypto.derive_shared_key(&self.key_pair, &public_key)?)
    }

    // ------------------------------------------------------------------
    // Read state, deletion, archive, blocking
    // ------------------------------------------------------------------

    /// Marks received messages read. Returns how many changed locally.
    pub async fn mark_as_read(&self, msg_ids: &[u64]) -> Result<u32> {
        if msg_ids.is_empty() {
            return Ok(0);
        }
        self.chain.mark_as_read(msg_ids).await.map_err(|e| {
            warn!(count = msg_ids.len(), error = %e, "mark as read failed");
            e
        })?;
        Ok(self.state.write().mark_read(msg_ids))
    }

    /// Marks a whole session read. Returns the unread count cleared.
    pub async fn mark_session_as_read(&self, session_id: &str) -> Result<u32> {
        self.require_session(session_id)?;
        self.chain.mark_session_as_read(session_id).await?;
        Ok(self.state.write().mark_session_read(session_id)?)
    }

    /// Deletes a confirmed message.
    pub async fn delete_message(&self, msg_id: u64) -> Result<bool> {
        self.chain.delete_message(msg_id).await?;
        Ok(self.state.write().delete_message(msg_id).is_some())
    }

    /// Archives a session.
    pub async fn archive_session(&self, session_id: &str) -> Result<()> {
        self.require_session(session_id)?;
        self.chain.archive_session(session_id).await?;
        self.state.write().set_archived(session_id, true)?;
        info!(session_id, "session archived");
        Ok(())
    }

    /// Blocks an identity. Its messages are dropped from then on.
    pub async fn block_user(&self, identity: &str) -> Result<()> {
        self.chain.block_user(identity).await?;
        self.state.write().block(identity);
        info!(identity, "user blocked");
        Ok(())
    }

    /// Unblocks an identity.
    pub async fn unblock_user(&self, identity: &str) -> Result<()> {
        self.chain.unblock_user(identity).await?;
        self.state.write().unblock(identity);
        info!(identity, "user unblocked");
        Ok(())
    }

    fn require_session(&self, session_id: &str) -> Result<()> {
        if self.state.read().session(session_id).is_some() {
            Ok(())
        } else {
            Err(DeliveryError::SessionNotFound(session_id.to_string()).into())
        }
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Loads session metadata from chain.
    pub async fn load_sessions(&self) -> Result<Vec<Session>> {
        let records = self.chain.list_sessions(&self.identity).await?;

        let mut state = self.state.write();
        state.replace_sessions(records.into_iter().map(Session::from).collect());
        Ok(state.sessions().to_vec())
    }

    /// Loads one page of history. Offset 0 replaces the list; a later
    /// offset prepends older messages.
    pub async fn load_messages(&self, session_id: &str, offset: u32) -> Result<Arc<Vec<Message>>> {
        let identity = self.identity.as_str();
        let records = self
            .chain
            .list_messages(session_id, offset, self.config.page_size)
            .await?;

        let mut history = Vec::with_capacity(records.len());
        for record in records {
            let hidden = (record.sender == identity && record.is_deleted_by_sender)
                || (record.receiver == identity && record.is_deleted_by_receiver);
            if hidden {
                continue;
            }
            history.push(self.open_record(record).await);
        }

        let mut state = self.state.write();
        let merged = state.merge_history(session_id, history, offset);
        debug!(session_id, offset, merged, "history loaded");
        Ok(state.messages(session_id))
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Appends a confirmed message. Returns false when the sender is blocked
    /// or the message is already held.
    pub fn handle_new_message(&self, message: Message) -> bool {
        let mut state = self.state.write();
        if state.is_blocked(&message.sender) {
            debug!(sender = %message.sender, "message from blocked user dropped");
            return false;
        }
        state.append_inbound(message)
    }

    /// Applies one chain event.
    pub async fn handle_event(&self, event: ChainEvent) {
        match event {
            ChainEvent::NewMessage(record) => {
                if self.is_blocked(&record.sender) {
                    debug!(msg_id = record.msg_id, "message from blocked user dropped");
                    return;
                }
                let message = self.open_record(record).await;
                self.handle_new_message(message);
            }
            ChainEvent::MessageRead { msg_id, reader } => {
                self.state.write().apply_read_receipt(msg_id, &reader);
            }
            ChainEvent::MessageDeleted { msg_id } => {
                self.state.write().delete_message(msg_id);
            }
            ChainEvent::SessionCreated(record) => {
                self.state.write().insert_session(record.into());
            }
            ChainEvent::UserBlocked { blocker, blocked } if blocker == self.identity => {
                self.state.write().block(&blocked);
            }
            ChainEvent::UserUnblocked { blocker, blocked } if blocker == self.identity => {
                self.state.write().unblock(&blocked);
            }
            ChainEvent::UserBlocked { .. } | ChainEvent::UserUnblocked { .. } => {}
        }
    }

    /// Applies events until the channel closes.
    pub async fn run(&self, mut events: mpsc::Receiver<ChainEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        info!("event stream closed");
    }

    /// Subscribes to the chain and applies events until the subscription ends.
    pub async fn subscribe_and_run(&self) -> Result<()> {
        let events = self.chain.subscribe_messages().await?;
        self.run(events).await;
        Ok(())
    }

    /// Fetches and decrypts the payload of a chain record. A payload that
    /// cannot be read leaves the message in place with `content_error` set.
    async fn open_record(&self, record: MessageRecord) -> Message {
        let counterpart = if record.sender == self.identity {
            record.receiver.clone()
        } else {
            record.sender.clone()
        };

        let payload = match self.shared_key_for(&counterpart).await {
            Ok(key) => self.codec.fetch_and_decrypt(&record.content_cid, &key).await,
            Err(e) => Err(e),
        };
        if let Err(ref e) = payload {
            warn!(
                msg_id = record.msg_id,
                cid = %record.content_cid,
                tampered = e.is_tampering(),
                error = %e,
                "message content unreadable"
            );
        }
        message_from_record(record, payload)
    }
}

fn message_from_record(
    record: MessageRecord,
    payload: std::result::Result<ChatPayload, ChatError>,
) -> Message {
    let (content, reply_to, attachment, content_error) = match payload {
        Ok(payload) => (payload.text, payload.reply_to, payload.attachment, None),
        Err(e) => (String::new(), None, None, Some(e)),
    };

    Message {
        id: MessageId::Confirmed(record.msg_id),
        temp_id: None,
        session_id: record.session_id,
        sender: record.sender,
        receiver: record.receiver,
        content,
        reply_to,
        attachment,
        content_cid: record.content_cid,
        msg_type: record.msg_type,
        sent_at: record.block_number,
        is_read: record.is_read,
        is_deleted_by_sender: record.is_deleted_by_sender,
        is_deleted_by_receiver: record.is_deleted_by_receiver,
        status: MessageStatus::Sent,
        retry_count: 0,
        error: None,
        content_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StorageError;

    #[test]
    fn test_config_creation() {
        let config = ChatConfig::localnet();
        assert!(config.chain.node_url.contains("9944"));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.page_size, 50);
        assert_eq!(config.key_cache_ttl, Duration::from_secs(86400));
    }

    #[test]
    fn test_config_clamps_retries() {
        let config = ChatConfig {
            max_retries: 10,
            ..ChatConfig::default()
        };
        assert_eq!(config.effective_max_retries(), 3);

        let json = r#"{"max_retries": 1, "page_size": 20}"#;
        let config: ChatConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.effective_max_retries(), 1);
        assert_eq!(config.page_size, 20);
        assert_eq!(config.preview_len, DEFAULT_PREVIEW_LEN);
    }

    #[test]
    fn test_message_from_record() {
        let record = MessageRecord {
            msg_id: 9,
            session_id: "s".to_string(),
            sender: "bob".to_string(),
            receiver: "alice".to_string(),
            content_cid: Cid::from("cid"),
            msg_type: MessageType::Text,
            block_number: 120,
            is_read: false,
            is_deleted_by_sender: false,
            is_deleted_by_receiver: false,
        };

        let ok = message_from_record(record.clone(), Ok(ChatPayload::text("hey")));
        assert_eq!(ok.content, "hey");
        assert_eq!(ok.id, MessageId::Confirmed(9));
        assert_eq!(ok.sent_at, 120);
        assert!(ok.content_error.is_none());

        let missing: ChatError = StorageError::NotFound(Cid::from("cid")).into();
        let broken = message_from_record(record, Err(missing.clone()));
        assert!(broken.content.is_empty());
        assert_eq!(broken.content_error, Some(missing));
        assert_eq!(broken.status, MessageStatus::Sent);
    }
}
