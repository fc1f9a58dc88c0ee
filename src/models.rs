//! Data models for the chat read model.
//!
//! This module defines sessions, messages and the small value types that
//! describe them. Plaintext content lives only here, in memory.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::storage::Cid;
use crate::types::{ChatError, TEMP_ID_PREFIX};

/// Kind of chat item. The discriminant is the on-chain `u8` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Plain text.
    #[default]
    Text = 0,
    /// Image attachment.
    Image = 1,
    /// File attachment.
    File = 2,
    /// Voice note.
    Voice = 3,
    /// Video attachment.
    Video = 4,
    /// System notice (order status change and the like).
    System = 5,
    /// AI-generated message.
    Ai = 6,
}

impl MessageType {
    /// Decode the on-chain code.
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0 => MessageType::Text,
            1 => MessageType::Image,
            2 => MessageType::File,
            3 => MessageType::Voice,
            4 => MessageType::Video,
            5 => MessageType::System,
            6 => MessageType::Ai,
            _ => return None,
        })
    }

    /// The on-chain code.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether the payload refers to an attachment.
    pub fn is_media(self) -> bool {
        matches!(
            self,
            MessageType::Image | MessageType::File | MessageType::Voice | MessageType::Video
        )
    }
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    /// Network round-trip in flight.
    Sending,
    /// Confirmed on chain.
    Sent,
    /// Round-trip failed; may be retried or discarded.
    Failed,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        })
    }
}

/// Message identifier: client-generated until the chain assigns one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Temporary id of an unconfirmed local send.
    Temp(String),
    /// Chain-assigned id.
    Confirmed(u64),
}

impl MessageId {
    /// Generate a fresh temporary id.
    pub fn new_temp() -> Self {
        use rand::Rng;
        let bytes: [u8; 12] = rand::thread_rng().gen();
        MessageId::Temp(format!("{}{}", TEMP_ID_PREFIX, hex::encode(bytes)))
    }

    /// The chain id, if confirmed.
    pub fn confirmed(&self) -> Option<u64> {
        match self {
            MessageId::Confirmed(id) => Some(*id),
            MessageId::Temp(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Temp(id) => f.write_str(id),
            MessageId::Confirmed(id) => write!(f, "{}", id),
        }
    }
}

/// Context for a reply message, linking it to the original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyContext {
    /// Chain id of the original message.
    pub msg_id: u64,
    /// Preview of the original message (truncated).
    pub preview: String,
}

impl ReplyContext {
    /// Creates a new reply context.
    pub fn new(msg_id: u64, preview: impl Into<String>) -> Self {
        Self {
            msg_id,
            preview: preview.into(),
        }
    }

    /// Creates a reply context from a confirmed message, truncating the preview.
    /// Returns None for messages the chain has not confirmed yet.
    pub fn from_message(message: &Message, max_chars: usize) -> Option<Self> {
        let msg_id = message.id.confirmed()?;
        Some(Self {
            msg_id,
            preview: preview_of(&message.content, max_chars),
        })
    }
}

/// Attachment metadata carried inside the encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Identifier of the attachment bytes in the content store.
    pub cid: Cid,
    /// Original file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Image or video width in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Image or video height in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// What the user asked to send.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutgoingMessage {
    /// Text, or caption for media.
    pub content: String,
    /// Kind of item.
    pub msg_type: MessageType,
    /// Message being answered, if any.
    pub reply_to: Option<ReplyContext>,
    /// Attachment metadata for media.
    pub attachment: Option<Attachment>,
}

impl OutgoingMessage {
    /// A message of `msg_type` with `content`.
    pub fn new(content: impl Into<String>, msg_type: MessageType) -> Self {
        Self {
            content: content.into(),
            msg_type,
            ..Default::default()
        }
    }

    /// A plain text message.
    pub fn text(content: impl Into<String>) -> Self {
        Self::new(content, MessageType::Text)
    }

    /// Set the reply context.
    pub fn replying_to(mut self, context: ReplyContext) -> Self {
        self.reply_to = Some(context);
        self
    }

    /// Attach media metadata.
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// Truncate `text` to at most `max_chars` characters, marking the cut with "...".
pub fn preview_of(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// Deterministic session id for an unordered pair of identities.
pub fn session_id_for(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let digest = Sha256::digest(format!("{}\n{}", first, second).as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// Denormalized summary of the newest message in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessage {
    /// Who sent it.
    pub sender: String,
    /// Truncated plaintext.
    pub preview: String,
    /// Kind of item.
    pub msg_type: MessageType,
    /// Block reference (0 while unconfirmed).
    pub sent_at: u64,
}

/// A conversation with one counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Session id.
    pub id: String,
    /// The other party.
    pub participant: String,
    /// Summary of the newest message.
    pub last_message: Option<LastMessage>,
    /// Received messages not yet read.
    pub unread_count: u32,
    /// Archived sessions stay in memory; archival is only a flag.
    pub is_archived: bool,
}

impl Session {
    /// Creates an empty session with `participant`.
    pub fn new(id: impl Into<String>, participant: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            participant: participant.into(),
            last_message: None,
            unread_count: 0,
            is_archived: false,
        }
    }
}

/// One chat item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Temporary until confirmed, then the chain id.
    pub id: MessageId,
    /// Temporary id this entry was created under, kept for its whole life.
    /// None for messages that arrived from chain.
    pub temp_id: Option<String>,
    /// Owning session.
    pub session_id: String,
    /// Sender identity.
    pub sender: String,
    /// Receiver identity.
    pub receiver: String,
    /// Decrypted content. Never leaves the device in plaintext.
    pub content: String,
    /// Reply context, if this message answers another.
    pub reply_to: Option<ReplyContext>,
    /// Attachment metadata for media messages.
    pub attachment: Option<Attachment>,
    /// Identifier of the encrypted payload; empty until uploaded.
    pub content_cid: Cid,
    /// Kind of item.
    pub msg_type: MessageType,
    /// Block reference; 0 while unconfirmed.
    pub sent_at: u64,
    /// Read by the receiver.
    pub is_read: bool,
    /// Deleted on the sender's side.
    pub is_deleted_by_sender: bool,
    /// Deleted on the receiver's side.
    pub is_deleted_by_receiver: bool,
    /// Delivery status.
    pub status: MessageStatus,
    /// Retries spent (0..=3).
    pub retry_count: u32,
    /// Present iff `status` is `Failed`.
    pub error: Option<ChatError>,
    /// Why the payload of an inbound message could not be read, if it could not.
    pub content_error: Option<ChatError>,
}

impl Message {
    /// Creates a provisional outbound message in `Sending` status.
    pub fn provisional(
        session_id: impl Into<String>,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        content: impl Into<String>,
        msg_type: MessageType,
        reply_to: Option<ReplyContext>,
    ) -> Self {
        let id = MessageId::new_temp();
        let temp_id = id.to_string();
        Self {
            id,
            temp_id: Some(temp_id),
            session_id: session_id.into(),
            sender: sender.into(),
            receiver: receiver.into(),
            content: content.into(),
            reply_to,
            attachment: None,
            content_cid: Cid::default(),
            msg_type,
            sent_at: 0,
            is_read: false,
            is_deleted_by_sender: false,
            is_deleted_by_receiver: false,
            status: MessageStatus::Sending,
            retry_count: 0,
            error: None,
            content_error: None,
        }
    }

    /// Whether `identity` sent this message.
    pub fn is_from(&self, identity: &str) -> bool {
        self.sender == identity
    }

    /// Whether this entry still carries a temporary id.
    pub fn is_provisional(&self) -> bool {
        matches!(self.id, MessageId::Temp(_))
    }

    /// Summary for the session list.
    pub fn summary(&self, max_chars: usize) -> LastMessage {
        LastMessage {
            sender: self.sender.clone(),
            preview: preview_of(&self.content, max_chars),
            msg_type: self.msg_type,
            sent_at: self.sent_at,
        }
    }
}
