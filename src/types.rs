//! Type definitions, protocol constants and the error taxonomy.

use thiserror::Error;

use crate::storage::Cid;

/// Size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the PBKDF2 salt in bytes.
pub const SALT_SIZE: usize = 16;

/// Size of the AES-GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Size of a symmetric key in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// Size of a raw X25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// PBKDF2-HMAC-SHA256 iteration count for the password mode.
///
/// Blobs carry no version byte, so changing this breaks every existing
/// password blob unless a format version is introduced at the same time.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Upper bound on retry attempts for a single message.
pub const MAX_RETRIES: u32 = 3;

/// HKDF salt used when stretching an ECDH shared secret into a message key.
pub const SHARED_KEY_SALT: &[u8] = b"StardustChat-v1-ecdh";

/// HKDF info used when stretching an ECDH shared secret into a message key.
pub const SHARED_KEY_INFO: &[u8] = b"aes-256-gcm message key";

/// HKDF salt for deriving the chat key pair from a wallet seed.
pub const SEED_DERIVATION_SALT: &[u8] = b"StardustChat-v1-identity";

/// HKDF info for deriving the chat key pair from a wallet seed.
pub const SEED_DERIVATION_INFO: &[u8] = b"x25519-key";

/// Prefix for temporary (client-generated) message ids.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Errors raised by the crypto engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material could not be parsed or is unusable.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The AEAD tag did not verify (tampered data or wrong key).
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Password-mode decryption failed. Deliberately indistinguishable from tampering.
    #[error("Wrong password or corrupted data")]
    WrongPassword,

    /// The blob is too short to contain a nonce and tag.
    #[error("Malformed blob: {0} bytes")]
    MalformedBlob(usize),
}

/// Errors raised by the content-addressed store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backend does not know this CID. Retrying will not help.
    #[error("Content not found: {0}")]
    NotFound(Cid),

    /// Transient backend or network failure.
    #[error("Content store unavailable: {0}")]
    Unavailable(String),

    /// No sealed chat key is stored for this identity.
    #[error("Key not found for identity: {0}")]
    KeyNotFound(String),
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// Errors raised synchronously by the delivery state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The message has used up its retry budget.
    #[error("Retry limit reached ({retry_count} attempts)")]
    RetryExhausted {
        /// Retries already spent.
        retry_count: u32,
    },

    /// The operation is not allowed in the message's current status.
    #[error("Invalid state for {operation}: message {id} is {status}")]
    InvalidState {
        /// Operation that was rejected.
        operation: &'static str,
        /// Message id (temporary or confirmed).
        id: String,
        /// Status the message was in.
        status: String,
    },

    /// No message with this id is held in memory.
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// No session with this id is held in memory.
    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

/// Opaque failures reported by the blockchain collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// The identity has no published chat key.
    #[error("Identity not found: {0}")]
    IdentityNotFound(String),

    /// The chain rejected the call (dispatch error, bad origin, ...).
    #[error("Rejected by chain: {0}")]
    Rejected(String),

    /// Connection, timeout or RPC failure.
    #[error("Network error: {0}")]
    Network(String),
}

/// Chat payload (de)serialization failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Payload could not be serialized.
    #[error("Serialize failed: {0}")]
    Serialize(String),

    /// Decrypted bytes are not a valid payload.
    #[error("Deserialize failed: {0}")]
    Deserialize(String),
}

/// Errors that can occur during chat operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Key agreement or encryption failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Content store failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Rejected state transition.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Chain or network failure.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Payload encoding failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ChatError {
    /// True for errors that mean the content was tampered with or keys do not match,
    /// as opposed to being merely unavailable.
    pub fn is_tampering(&self) -> bool {
        matches!(
            self,
            ChatError::Crypto(CryptoError::AuthenticationFailed | CryptoError::MalformedBlob(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: ChatError = CryptoError::AuthenticationFailed.into();
        assert!(err.is_tampering());

        let err: ChatError = StorageError::NotFound(Cid::from("abc")).into();
        assert!(!err.is_tampering());
        assert_eq!(err.to_string(), "Content not found: abc");
    }

    #[test]
    fn test_storage_error_transience() {
        assert!(StorageError::Unavailable("timeout".into()).is_transient());
        assert!(!StorageError::NotFound(Cid::from("x")).is_transient());
    }
}
