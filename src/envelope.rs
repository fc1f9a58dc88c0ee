//! Wire encoding of encrypted blobs.
//!
//! Shared-key mode:  `nonce (12) || ciphertext + tag`
//! Password mode:    `salt (16) || nonce (12) || ciphertext + tag`
//!
//! Both are base64 (standard alphabet, padded) when carried as text.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::types::{CryptoError, NONCE_SIZE, SALT_SIZE, TAG_SIZE};

/// Ciphertext produced under a shared key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    /// Fresh random nonce (12 bytes).
    pub nonce: [u8; NONCE_SIZE],
    /// AES-GCM ciphertext with the tag appended.
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    /// Encode as `nonce || ciphertext`.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        data.extend_from_slice(&self.nonce);
        data.extend_from_slice(&self.ciphertext);
        data
    }

    /// Split bytes into nonce and ciphertext.
    pub fn decode(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::MalformedBlob(data.len()));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);

        Ok(Self {
            nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }

    /// Encode for text transport.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.encode())
    }

    /// Decode from text transport.
    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let data = STANDARD
            .decode(text.trim())
            .map_err(|_| CryptoError::MalformedBlob(text.len()))?;
        Self::decode(&data)
    }
}

/// Ciphertext produced under a password-derived key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordBlob {
    /// PBKDF2 salt (16 bytes).
    pub salt: [u8; SALT_SIZE],
    /// Fresh random nonce (12 bytes).
    pub nonce: [u8; NONCE_SIZE],
    /// AES-GCM ciphertext with the tag appended.
    pub ciphertext: Vec<u8>,
}

impl PasswordBlob {
    /// Encode as `salt || nonce || ciphertext`.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + self.ciphertext.len());
        data.extend_from_slice(&self.salt);
        data.extend_from_slice(&self.nonce);
        data.extend_from_slice(&self.ciphertext);
        data
    }

    /// Split bytes into salt, nonce and ciphertext.
    ///
    /// A truncated blob reports `WrongPassword`, the same as any other
    /// password-mode failure.
    pub fn decode(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::WrongPassword);
        }

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&data[..SALT_SIZE]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[SALT_SIZE..SALT_SIZE + NONCE_SIZE]);

        Ok(Self {
            salt,
            nonce,
            ciphertext: data[SALT_SIZE + NONCE_SIZE..].to_vec(),
        })
    }

    /// Encode for text transport.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.encode())
    }

    /// Decode from text transport.
    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let data = STANDARD
            .decode(text.trim())
            .map_err(|_| CryptoError::WrongPassword)?;
        Self::decode(&data)
    }
}
