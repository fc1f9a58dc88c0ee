//! Chat payload serialization and the encrypt → upload / fetch → decrypt pipeline.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::CryptoProvider;
use crate::envelope::EncryptedBlob;
use crate::keys::SharedKey;
use crate::models::{Attachment, Message, MessageType, ReplyContext};
use crate::storage::{Cid, ContentStore};
use crate::types::{CodecError, Result};

/// The logical content of one chat item, as it travels inside the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    /// Kind of item.
    #[serde(rename = "type", default)]
    pub msg_type: MessageType,
    /// Text, or caption for media.
    #[serde(default)]
    pub text: String,
    /// Reply context, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyContext>,
    /// Attachment metadata for media items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

impl ChatPayload {
    /// A plain text payload.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::Text,
            text: text.into(),
            reply_to: None,
            attachment: None,
        }
    }

    /// Rebuild the payload of a local message (used on retry).
    pub fn from_message(message: &Message) -> Self {
        Self {
            msg_type: message.msg_type,
            text: message.content.clone(),
            reply_to: message.reply_to.clone(),
            attachment: message.attachment.clone(),
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    /// Parse decrypted bytes.
    ///
    /// Bytes that are valid UTF-8 but not a JSON payload are read as plain
    /// text, so clients that only ever sent raw strings stay readable.
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, CodecError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| CodecError::Deserialize(format!("Invalid UTF-8: {}", e)))?;

        if text.starts_with('{') {
            if let Ok(payload) = serde_json::from_str::<ChatPayload>(text) {
                return Ok(payload);
            }
        }

        Ok(Self::text(text))
    }
}

/// Composes the crypto engine with a content store.
pub struct MessageCodec<S: ContentStore> {
    store: Arc<S>,
    crypto: Arc<dyn CryptoProvider>,
}

impl<S: ContentStore> MessageCodec<S> {
    /// Creates a codec over `store` using `crypto`.
    pub fn new(store: Arc<S>, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self { store, crypto }
    }

    /// Serialize, encrypt under `key` and upload. Returns the CID of the blob.
    ///
    /// Each call encrypts with a fresh nonce, so the same payload never maps
    /// to the same CID twice.
    pub async fn encrypt_and_upload(&self, payload: &ChatPayload, key: &SharedKey) -> Result<Cid> {
        let plaintext = payload.to_bytes()?;
        let blob = self.crypto.encrypt(&plaintext, key)?;
        let cid = self.store.upload(blob.to_base64().into_bytes()).await?;
        Ok(cid)
    }

    /// Fetch `cid`, decrypt under `key` and parse.
    ///
    /// Storage failures and authentication failures surface as distinct
    /// error variants.
    pub async fn fetch_and_decrypt(&self, cid: &Cid, key: &SharedKey) -> Result<ChatPayload> {
        let data = self.store.fetch(cid).await?;
        let text = String::from_utf8_lossy(&data);
        let blob = EncryptedBlob::from_base64(&text)?;
        let plaintext = self.crypto.decrypt(&blob, key)?;
        Ok(ChatPayload::from_bytes(&plaintext)?)
    }

    /// The underlying content store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}
