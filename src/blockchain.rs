//! Blockchain interfaces for the chat pallet.
//!
//! This module provides the collaborator trait the chat service talks to
//! and the typed records and events that cross it. Implementations can use
//! any Substrate client; the crate itself never touches the wire.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use x25519_dalek::PublicKey;

use crate::keys::import_public_key;
use crate::models::{MessageType, Session};
use crate::storage::Cid;
use crate::types::{ChainError, Result};

/// Configuration for node and gateway connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Node websocket URL.
    pub node_url: String,
    /// Indexer URL (optional).
    pub indexer_url: Option<String>,
    /// Gateway used to fetch content by CID.
    pub content_gateway_url: String,
}

impl ChainConfig {
    /// Creates a configuration for the given node, using the public IPFS gateway.
    pub fn new(node_url: &str) -> Self {
        Self {
            node_url: node_url.to_string(),
            indexer_url: None,
            content_gateway_url: "https://ipfs.io/ipfs/".to_string(),
        }
    }

    /// Sets the indexer URL.
    pub fn with_indexer(mut self, url: &str) -> Self {
        self.indexer_url = Some(url.to_string());
        self
    }

    /// Sets the content gateway URL.
    pub fn with_gateway(mut self, url: &str) -> Self {
        self.content_gateway_url = url.to_string();
        self
    }

    /// Creates configuration for a local development node.
    pub fn localnet() -> Self {
        Self::new("ws://127.0.0.1:9944")
    }

    /// Gateway URL for a CID.
    pub fn content_url(&self, cid: &Cid) -> String {
        if self.content_gateway_url.ends_with('/') {
            format!("{}{}", self.content_gateway_url, cid)
        } else {
            format!("{}/{}", self.content_gateway_url, cid)
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::localnet()
    }
}

/// Metadata published alongside a content reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    /// Sender identity.
    pub sender: String,
    /// Receiver identity.
    pub receiver: String,
    /// Kind of item.
    pub msg_type: MessageType,
}

/// Returned by the chain once a message reference is included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Chain-assigned message id.
    pub msg_id: u64,
    /// Block the reference was included in.
    pub block_number: u64,
}

/// A message reference as stored on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Chain-assigned message id.
    pub msg_id: u64,
    /// Owning session.
    pub session_id: String,
    /// Sender identity.
    pub sender: String,
    /// Receiver identity.
    pub receiver: String,
    /// Identifier of the encrypted payload.
    pub content_cid: Cid,
    /// Kind of item.
    pub msg_type: MessageType,
    /// Block the reference was included in.
    pub block_number: u64,
    /// Read by the receiver.
    pub is_read: bool,
    /// Deleted on the sender's side.
    pub is_deleted_by_sender: bool,
    /// Deleted on the receiver's side.
    pub is_deleted_by_receiver: bool,
}

/// A session as stored on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Session id.
    pub session_id: String,
    /// The other party, from the local identity's point of view.
    pub participant: String,
    /// Received messages not yet read.
    pub unread_count: u32,
    /// Archived flag.
    pub is_archived: bool,
}

impl From<SessionRecord> for Session {
    fn from(record: SessionRecord) -> Self {
        let mut session = Session::new(record.session_id, record.participant);
        session.unread_count = record.unread_count;
        session.is_archived = record.is_archived;
        session
    }
}

/// Events pushed by the chain subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// A message reference addressed to, or sent by, the local identity.
    NewMessage(MessageRecord),
    /// The receiver read one of our messages.
    MessageRead {
        /// Message id.
        msg_id: u64,
        /// Identity that read it.
        reader: String,
    },
    /// A message was deleted.
    MessageDeleted {
        /// Message id.
        msg_id: u64,
    },
    /// A session involving the local identity was created.
    SessionCreated(SessionRecord),
    /// `blocker` blocked `blocked`.
    UserBlocked {
        /// Identity that blocked.
        blocker: String,
        /// Identity that was blocked.
        blocked: String,
    },
    /// `blocker` unblocked `blocked`.
    UserUnblocked {
        /// Identity that unblocked.
        blocker: String,
        /// Identity that was unblocked.
        blocked: String,
    },
}

/// Trait for interacting with the chat pallet.
///
/// Every call is a network round-trip and may fail with a [`ChainError`].
#[async_trait::async_trait]
pub trait ChainClient: Send + Sync {
    /// Look up the published chat public key of an identity (SPKI DER or
    /// raw 32 bytes). None when the identity never published one.
    async fn resolve_identity(
        &self,
        identity: &str,
    ) -> std::result::Result<Option<Vec<u8>>, ChainError>;

    /// Publish a content reference. Returns once the reference is included.
    async fn publish_message_reference(
        &self,
        session_id: &str,
        cid: &Cid,
        metadata: &MessageMetadata,
    ) -> std::result::Result<PublishReceipt, ChainError>;

    /// Sessions of `identity`.
    async fn list_sessions(
        &self,
        identity: &str,
    ) -> std::result::Result<Vec<SessionRecord>, ChainError>;

    /// Message references of a session, newest page first.
    async fn list_messages(
        &self,
        session_id: &str,
        offset: u32,
        limit: u32,
    ) -> std::result::Result<Vec<MessageRecord>, ChainError>;

    /// Mark messages read.
    async fn mark_as_read(&self, msg_ids: &[u64]) -> std::result::Result<(), ChainError>;

    /// Mark every message of a session read.
    async fn mark_session_as_read(&self, session_id: &str) -> std::result::Result<(), ChainError>;

    /// Delete a confirmed message.
    async fn delete_message(&self, msg_id: u64) -> std::result::Result<(), ChainError>;

    /// Archive a session.
    async fn archive_session(&self, session_id: &str) -> std::result::Result<(), ChainError>;

    /// Block an identity.
    async fn block_user(&self, identity: &str) -> std::result::Result<(), ChainError>;

    /// Unblock an identity.
    async fn unblock_user(&self, identity: &str) -> std::result::Result<(), ChainError>;

    /// Subscribe to chat events for the local identity.
    async fn subscribe_messages(
        &self,
    ) -> std::result::Result<mpsc::Receiver<ChainEvent>, ChainError>;
}

/// Resolves and parses the chat public key of `identity`.
pub async fn resolve_public_key(chain: &dyn ChainClient, identity: &str) -> Result<PublicKey> {
    let bytes = chain
        .resolve_identity(identity)
        .await?
        .ok_or_else(|| ChainError::IdentityNotFound(identity.to_string()))?;

    Ok(import_public_key(&bytes)?)
}
