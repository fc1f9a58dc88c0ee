//! Stardust Chat - End-to-end encrypted messaging over a content-addressed store
//!
//! Payloads are encrypted with X25519 + AES-256-GCM, uploaded to an
//! IPFS-style store, and referenced on chain by CID. The [`ChatService`]
//! keeps an optimistic in-memory read model of sessions and messages.

mod blockchain;
mod chat;
mod codec;
mod crypto;
mod envelope;
mod keys;
mod models;
mod storage;
mod store;
mod types;

pub use blockchain::*;
pub use chat::*;
pub use codec::*;
pub use crypto::*;
pub use envelope::*;
pub use keys::*;
pub use models::*;
pub use storage::*;
pub use store::*;
pub use types::*;
