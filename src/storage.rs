//! Storage interfaces and implementations.
//!
//! This module provides the content-addressed blob store that carries
//! encrypted payloads, a TTL cache for counterpart public keys, and sealed
//! storage for the device's chat private key.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use x25519_dalek::PublicKey;

use crate::crypto::CryptoProvider;
use crate::keys::KeyPair;
use crate::types::{CryptoError, Result, StorageError};

// ============================================================================
// Content Store
// ============================================================================

/// Content identifier returned by a [`ContentStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    /// Derive the identifier for `bytes` (hex SHA-256).
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// The identifier as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the empty placeholder carried by unconfirmed messages.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Cid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Content-addressed blob storage (IPFS-style).
///
/// Knows nothing about encryption; it only moves opaque bytes.
#[async_trait::async_trait]
pub trait ContentStore: Send + Sync {
    /// Store bytes and return their identifier. Uploading identical bytes
    /// twice returns the same identifier.
    async fn upload(&self, bytes: Vec<u8>) -> std::result::Result<Cid, StorageError>;

    /// Fetch previously stored bytes.
    async fn fetch(&self, cid: &Cid) -> std::result::Result<Vec<u8>, StorageError>;
}

/// In-memory implementation of ContentStore.
///
/// Can be switched offline to simulate transient network failures.
pub struct InMemoryContentStore {
    blobs: Arc<RwLock<HashMap<Cid, Vec<u8>>>>,
    online: AtomicBool,
}

impl InMemoryContentStore {
    /// Creates a new, online, empty store.
    pub fn new() -> Self {
        Self {
            blobs: Arc::new(RwLock::new(HashMap::new())),
            online: AtomicBool::new(true),
        }
    }

    /// Toggle availability. While offline every call fails with `Unavailable`.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of distinct blobs held.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    /// Returns true if nothing has been stored.
    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    /// Overwrite the bytes behind `cid` without changing the identifier.
    /// Only useful for simulating a misbehaving gateway.
    pub async fn corrupt(&self, cid: &Cid, bytes: Vec<u8>) {
        self.blobs.write().await.insert(cid.clone(), bytes);
    }

    fn check_online(&self) -> std::result::Result<(), StorageError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("content store offline".to_string()))
        }
    }
}

impl Default for InMemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ContentStore for InMemoryContentStore {
    async fn upload(&self, bytes: Vec<u8>) -> std::result::Result<Cid, StorageError> {
        self.check_online()?;
        let cid = Cid::of(&bytes);
        self.blobs.write().await.entry(cid.clone()).or_insert(bytes);
        Ok(cid)
    }

    async fn fetch(&self, cid: &Cid) -> std::result::Result<Vec<u8>, StorageError> {
        self.check_online()?;
        self.blobs
            .read()
            .await
            .get(cid)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(cid.clone()))
    }
}

// ============================================================================
// Public Key Cache
// ============================================================================

struct CacheEntry {
    key: PublicKey,
    expires_at: Instant,
}

/// Counterpart public keys resolved from chain, with TTL expiration.
pub struct PublicKeyCache {
    cache: SyncRwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl PublicKeyCache {
    /// Creates a cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: SyncRwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Remember the key for an identity.
    pub fn store(&self, identity: &str, key: PublicKey) {
        self.cache.write().insert(
            identity.to_string(),
            CacheEntry {
                key,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// The cached key, or None when absent or expired.
    pub fn retrieve(&self, identity: &str) -> Option<PublicKey> {
        self.cache
            .read()
            .get(identity)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.key)
    }

    /// Forget the key for an identity (e.g. after a key rotation).
    pub fn invalidate(&self, identity: &str) {
        self.cache.write().remove(identity);
    }

    /// Drop all expired entries.
    pub fn prune_expired(&self) {
        let now = Instant::now();
        self.cache.write().retain(|_, entry| entry.expires_at > now);
    }
}

impl Default for PublicKeyCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(86400))
    }
}

// ============================================================================
// Encryption Key Storage
// ============================================================================

/// Persistence for the chat private key, sealed at rest with the password mode.
#[async_trait::async_trait]
pub trait EncryptionKeyStorage: Send + Sync {
    /// Store sealed key bytes for an identity.
    async fn store(&self, identity: &str, sealed: Vec<u8>) -> Result<()>;

    /// Retrieve sealed key bytes for an identity.
    async fn retrieve(&self, identity: &str) -> Result<Vec<u8>>;

    /// Check if a key exists for an identity.
    async fn has_key(&self, identity: &str) -> bool;

    /// Delete the key for an identity.
    async fn delete(&self, identity: &str) -> Result<()>;

    /// Seal `key_pair` under `password` and store it.
    async fn store_key_pair(
        &self,
        crypto: &dyn CryptoProvider,
        identity: &str,
        key_pair: &KeyPair,
        password: &str,
    ) -> Result<()> {
        let secret = key_pair.secret_bytes();
        let sealed = crypto.encrypt_with_password(secret.as_slice(), password)?;
        self.store(identity, sealed).await
    }

    /// Load and unseal the key pair for `identity`.
    async fn load_key_pair(
        &self,
        crypto: &dyn CryptoProvider,
        identity: &str,
        password: &str,
    ) -> Result<KeyPair> {
        let sealed = self.retrieve(identity).await?;
        let secret = crypto.decrypt_with_password(&sealed, password)?;
        let bytes: [u8; 32] = secret
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("sealed key is not 32 bytes".to_string()))?;
        Ok(KeyPair::from_secret_bytes(bytes))
    }
}

/// In-memory implementation of EncryptionKeyStorage.
///
/// Keys are held sealed, but are lost when the process exits.
#[derive(Default)]
pub struct InMemoryKeyStorage {
    keys: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryKeyStorage {
    /// Creates a new in-memory key storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EncryptionKeyStorage for InMemoryKeyStorage {
    async fn store(&self, identity: &str, sealed: Vec<u8>) -> Result<()> {
        self.keys.write().await.insert(identity.to_string(), sealed);
        Ok(())
    }

    async fn retrieve(&self, identity: &str) -> Result<Vec<u8>> {
        self.keys
            .read()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| StorageError::KeyNotFound(identity.to_string()).into())
    }

    async fn has_key(&self, identity: &str) -> bool {
        self.keys.read().await.contains_key(identity)
    }

    async fn delete(&self, identity: &str) -> Result<()> {
        self.keys.write().await.remove(identity);
        Ok(())
    }
}
