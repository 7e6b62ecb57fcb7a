//! Persistence ports. The relay only needs append and "most recent N" for
//! messages, plus credential and session-token lookups for login; Redis backs
//! them in production and an in-process store backs tests and `--ephemeral`.

mod memory;
mod redis_store;

use async_trait::async_trait;
use flare_core::{ChatMessage, CredentialRecord, Identity, SessionClaims};
use uuid::Uuid;

use crate::error::{AccountError, PersistenceError};

pub use self::memory::MemoryStore;
pub use self::redis_store::{RedisStore, DEFAULT_NAMESPACE};

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends an ordinary chat record.
    async fn append(&self, message: &ChatMessage) -> Result<(), PersistenceError>;

    /// Appends a distress alert to the dedicated alert log.
    async fn append_priority(&self, message: &ChatMessage) -> Result<(), PersistenceError>;

    /// Up to `limit` ordinary records, newest first.
    async fn recent_ordinary(&self, limit: usize) -> Result<Vec<ChatMessage>, PersistenceError>;

    /// Up to `limit` distress alerts, newest first.
    async fn recent_priority(&self, limit: usize) -> Result<Vec<ChatMessage>, PersistenceError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn create_account(&self, record: CredentialRecord) -> Result<(), AccountError>;

    async fn find_account(
        &self,
        identity: &Identity,
    ) -> Result<Option<CredentialRecord>, AccountError>;

    /// Stores login claims until they expire.
    async fn store_session(&self, claims: &SessionClaims) -> Result<(), AccountError>;

    async fn load_session(&self, token: Uuid) -> Result<Option<SessionClaims>, AccountError>;
}
