//! Authenticated encryption for chat payloads and local secrets.
//!
//! Payloads use AES-256-GCM under an ECDH-derived [`SharedKey`]. Local
//! secrets (wallet mnemonic, chat private key) use AES-256-GCM under a key
//! stretched from a password with PBKDF2-HMAC-SHA256.

use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

use crate::envelope::{EncryptedBlob, PasswordBlob};
use crate::keys::{derive_shared_key, KeyPair, SharedKey};
use crate::types::{CryptoError, KEY_SIZE, NONCE_SIZE, PBKDF2_ITERATIONS, SALT_SIZE};

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &SharedKey) -> Result<EncryptedBlob, CryptoError> {
    let nonce = random_bytes::<NONCE_SIZE>();
    let ciphertext = aes_gcm_seal(key.as_bytes(), &nonce, plaintext)?;
    Ok(EncryptedBlob { nonce, ciphertext })
}

/// Decrypt a blob produced by [`encrypt`].
///
/// Any tag mismatch (wrong key, flipped bit, truncated tag) is
/// `AuthenticationFailed`; no plaintext is ever returned in that case.
pub fn decrypt(blob: &EncryptedBlob, key: &SharedKey) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::InvalidKey("AES-256 key must be 32 bytes".to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(&blob.nonce), blob.ciphertext.as_slice())
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Encrypt a local secret under a password. Output is `salt || nonce || ciphertext`.
pub fn encrypt_with_password(plaintext: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
    let salt = random_bytes::<SALT_SIZE>();
    let nonce = random_bytes::<NONCE_SIZE>();
    let key = password_key(password, &salt);
    let ciphertext = aes_gcm_seal(&key, &nonce, plaintext)?;

    Ok(PasswordBlob {
        salt,
        nonce,
        ciphertext,
    }
    .encode())
}

/// Decrypt bytes produced by [`encrypt_with_password`].
///
/// A wrong password and a corrupted blob both yield `WrongPassword`.
pub fn decrypt_with_password(
    data: &[u8],
    password: &str,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let blob = PasswordBlob::decode(data)?;
    let key = password_key(password, &blob.salt);

    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|_| CryptoError::WrongPassword)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&blob.nonce), blob.ciphertext.as_slice())
        .map_err(|_| CryptoError::WrongPassword)?;

    Ok(Zeroizing::new(plaintext))
}

fn password_key(password: &str, salt: &[u8; SALT_SIZE]) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut *key);
    key
}

fn aes_gcm_seal(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey("AES-256 key must be 32 bytes".to_string()))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::InvalidKey("AES-GCM encryption failed".to_string()))
}

/// Backend for every crypto primitive the chat core uses.
///
/// The chat service, codec and key storage only talk to this trait, so a
/// host can plug a hardware-backed implementation in at startup.
pub trait CryptoProvider: Send + Sync {
    /// Generate a fresh key pair.
    fn generate_key_pair(&self) -> KeyPair;

    /// ECDH + HKDF into a message key.
    fn derive_shared_key(
        &self,
        my_key_pair: &KeyPair,
        their_public_key: &PublicKey,
    ) -> Result<SharedKey, CryptoError>;

    /// Shared-key encryption with a fresh nonce.
    fn encrypt(&self, plaintext: &[u8], key: &SharedKey) -> Result<EncryptedBlob, CryptoError>;

    /// Shared-key decryption.
    fn decrypt(&self, blob: &EncryptedBlob, key: &SharedKey) -> Result<Vec<u8>, CryptoError>;

    /// Password-mode encryption.
    fn encrypt_with_password(&self, plaintext: &[u8], password: &str)
        -> Result<Vec<u8>, CryptoError>;

    /// Password-mode decryption.
    fn decrypt_with_password(
        &self,
        data: &[u8],
        password: &str,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError>;
}

/// Pure-Rust provider (x25519-dalek, aes-gcm, pbkdf2).
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareCryptoProvider;

impl CryptoProvider for SoftwareCryptoProvider {
    fn generate_key_pair(&self) -> KeyPair {
        KeyPair::generate()
    }

    fn derive_shared_key(
        &self,
        my_key_pair: &KeyPair,
        their_public_key: &PublicKey,
    ) -> Result<SharedKey, CryptoError> {
        derive_shared_key(my_key_pair, their_public_key)
    }

    fn encrypt(&self, plaintext: &[u8], key: &SharedKey) -> Result<EncryptedBlob, CryptoError> {
        encrypt(plaintext, key)
    }

    fn decrypt(&self, blob: &EncryptedBlob, key: &SharedKey) -> Result<Vec<u8>, CryptoError> {
        decrypt(blob, key)
    }

    fn encrypt_with_password(
        &self,
        plaintext: &[u8],
        password: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        encrypt_with_password(plaintext, password)
    }

    fn decrypt_with_password(
        &self,
        data: &[u8],
        password: &str,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        decrypt_with_password(data, password)
    }
}

/// The provider for this platform.
pub fn default_provider() -> Arc<dyn CryptoProvider> {
    Arc::new(SoftwareCryptoProvider)
}
