use std::collections::HashMap;

use async_trait::async_trait;
use flare_core::{ChatMessage, CredentialRecord, Identity, SessionClaims};
use parking_lot::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{AccountStore, MessageStore};
use crate::error::{AccountError, PersistenceError};

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    messages: Mutex<Vec<ChatMessage>>,
    alerts: Mutex<Vec<ChatMessage>>,
    accounts: Mutex<HashMap<Identity, CredentialRecord>>,
    sessions: Mutex<HashMap<Uuid, SessionClaims>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(log: &[ChatMessage], limit: usize) -> Vec<ChatMessage> {
    log.iter().rev().take(limit).cloned().collect()
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, message: &ChatMessage) -> Result<(), PersistenceError> {
        self.messages.lock().push(message.clone());
        Ok(())
    }

    async fn append_priority(&self, message: &ChatMessage) -> Result<(), PersistenceError> {
        self.alerts.lock().push(message.clone());
        Ok(())
    }

    async fn recent_ordinary(&self, limit: usize) -> Result<Vec<ChatMessage>, PersistenceError> {
        Ok(newest_first(&self.messages.lock(), limit))
    }

    async fn recent_priority(&self, limit: usize) -> Result<Vec<ChatMessage>, PersistenceError> {
        Ok(newest_first(&self.alerts.lock(), limit))
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn create_account(&self, record: CredentialRecord) -> Result<(), AccountError> {
        let mut accounts = self.accounts.lock();
        if accounts.contains_key(&record.identity) {
            return Err(AccountError::Duplicate);
        }
        accounts.insert(record.identity.clone(), record);
        Ok(())
    }

    async fn find_account(
        &self,
        identity: &Identity,
    ) -> Result<Option<CredentialRecord>, AccountError> {
        Ok(self.accounts.lock().get(identity).cloned())
    }

    async fn store_session(&self, claims: &SessionClaims) -> Result<(), AccountError> {
        let now = OffsetDateTime::now_utc();
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, existing| existing.ensure_not_expired(now).is_ok());
        sessions.insert(claims.token, claims.clone());
        Ok(())
    }

    async fn load_session(&self, token: Uuid) -> Result<Option<SessionClaims>, AccountError> {
        Ok(self.sessions.lock().get(&token).cloned())
    }
}
