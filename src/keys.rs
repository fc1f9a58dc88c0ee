//! Key generation, exchange encoding and ECDH key agreement.

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::types::{
    CryptoError, KEY_SIZE, PUBLIC_KEY_SIZE, SEED_DERIVATION_INFO, SEED_DERIVATION_SALT,
    SHARED_KEY_INFO, SHARED_KEY_SALT,
};

/// DER prefix of a SubjectPublicKeyInfo wrapping an X25519 key (OID 1.3.101.110).
const X25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x03, 0x21, 0x00,
];

/// Length of an SPKI-encoded X25519 public key.
pub const SPKI_PUBLIC_KEY_SIZE: usize = X25519_SPKI_PREFIX.len() + PUBLIC_KEY_SIZE;

/// An X25519 key pair owned by this device.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Derive the chat key pair from a 32-byte wallet seed using HKDF-SHA256.
    ///
    /// The same seed always yields the same key pair, so a restored wallet
    /// can read its old conversations.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        if seed.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "seed must be 32 bytes, got {}",
                seed.len()
            )));
        }

        let hkdf = Hkdf::<Sha256>::new(Some(SEED_DERIVATION_SALT), seed);
        let mut derived = Zeroizing::new([0u8; 32]);
        hkdf.expand(SEED_DERIVATION_INFO, &mut *derived)
            .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand failed: {}", e)))?;

        Ok(Self::from_secret_bytes(*derived))
    }

    /// Rebuild a key pair from raw private key bytes (as unsealed from key storage).
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Raw private key bytes, for sealing into key storage only.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// The public half.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Symmetric AES-256-GCM key agreed with one counterpart.
///
/// There is no public accessor for the key bytes: it can only be handed to
/// the crypto engine.
pub struct SharedKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl SharedKey {
    pub(crate) fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// Encode a public key as SPKI DER for exchange or on-chain publication.
pub fn export_public_key(public_key: &PublicKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(SPKI_PUBLIC_KEY_SIZE);
    out.extend_from_slice(&X25519_SPKI_PREFIX);
    out.extend_from_slice(public_key.as_bytes());
    out
}

/// Decode a public key from SPKI DER or from the raw 32-byte form.
pub fn import_public_key(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    let raw = match bytes.len() {
        SPKI_PUBLIC_KEY_SIZE => {
            if bytes[..X25519_SPKI_PREFIX.len()] != X25519_SPKI_PREFIX {
                return Err(CryptoError::InvalidKey(
                    "not an X25519 SubjectPublicKeyInfo".to_string(),
                ));
            }
            &bytes[X25519_SPKI_PREFIX.len()..]
        }
        PUBLIC_KEY_SIZE => bytes,
        n => {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} or {} bytes, got {}",
                SPKI_PUBLIC_KEY_SIZE, PUBLIC_KEY_SIZE, n
            )))
        }
    };

    let mut key = [0u8; PUBLIC_KEY_SIZE];
    key.copy_from_slice(raw);
    Ok(PublicKey::from(key))
}

/// Perform X25519 ECDH and stretch the result into an AES-256 key.
///
/// Rejects low-order counterpart keys, which would force an all-zero secret.
pub fn derive_shared_key(
    my_key_pair: &KeyPair,
    their_public_key: &PublicKey,
) -> Result<SharedKey, CryptoError> {
    let shared = my_key_pair.secret.diffie_hellman(their_public_key);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey(
            "public key is of low order".to_string(),
        ));
    }

    let hkdf = Hkdf::<Sha256>::new(Some(SHARED_KEY_SALT), shared.as_bytes());
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(SHARED_KEY_INFO, &mut key)
        .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand failed: {}", e)))?;

    Ok(SharedKey::from_bytes(key))
}
