use async_trait::async_trait;
use flare_core::{ChatMessage, CredentialRecord, Identity, SessionClaims};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use super::{AccountStore, MessageStore};
use crate::error::{AccountError, PersistenceError};

pub const DEFAULT_NAMESPACE: &str = "flare";

/// Redis-backed store. Both logs are lists with the newest record at the head,
/// so "most recent N" is a single `LRANGE 0 N-1`.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    namespace: String,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, redis::RedisError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            namespace: namespace.to_string(),
        })
    }

    fn messages_key(&self) -> String {
        format!("{}:messages", self.namespace)
    }

    fn alerts_key(&self) -> String {
        format!("{}:alerts", self.namespace)
    }

    fn accounts_key(&self) -> String {
        format!("{}:accounts", self.namespace)
    }

    fn session_key(&self, token: Uuid) -> String {
        format!("{}:session:{}", self.namespace, token)
    }

    async fn push(&self, key: String, message: &ChatMessage) -> Result<(), PersistenceError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(message)?;
        conn.lpush::<_, _, ()>(&key, serialized).await?;
        Ok(())
    }

    async fn newest(&self, key: String, limit: usize) -> Result<Vec<ChatMessage>, PersistenceError> {
        // LRANGE 0 -1 would return the whole list
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let stop = isize::try_from(limit - 1).unwrap_or(isize::MAX);
        let raw: Vec<String> = conn.lrange(&key, 0, stop).await?;
        Ok(decode_all(&key, raw))
    }
}

fn decode_all<T: DeserializeOwned>(key: &str, raw: Vec<String>) -> Vec<T> {
    raw.into_iter()
        .filter_map(|entry| match serde_json::from_str(&entry) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(%key, error = %err, "skipping undecodable record");
                None
            }
        })
        .collect()
}

#[async_trait]
impl MessageStore for RedisStore {
    async fn append(&self, message: &ChatMessage) -> Result<(), PersistenceError> {
        self.push(self.messages_key(), message).await
    }

    async fn append_priority(&self, message: &ChatMessage) -> Result<(), PersistenceError> {
        self.push(self.alerts_key(), message).await
    }

    async fn recent_ordinary(&self, limit: usize) -> Result<Vec<ChatMessage>, PersistenceError> {
        self.newest(self.messages_key(), limit).await
    }

    async fn recent_priority(&self, limit: usize) -> Result<Vec<ChatMessage>, PersistenceError> {
        self.newest(self.alerts_key(), limit).await
    }
}

#[async_trait]
impl AccountStore for RedisStore {
    async fn create_account(&self, record: CredentialRecord) -> Result<(), AccountError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(&record)?;
        let created: bool = conn
            .hset_nx(self.accounts_key(), record.identity.as_str(), serialized)
            .await?;
        if created {
            Ok(())
        } else {
            Err(AccountError::Duplicate)
        }
    }

    async fn find_account(
        &self,
        identity: &Identity,
    ) -> Result<Option<CredentialRecord>, AccountError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.hget(self.accounts_key(), identity.as_str()).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn store_session(&self, claims: &SessionClaims) -> Result<(), AccountError> {
        let mut conn = self.redis.clone();
        let ttl = claims.remaining_secs(OffsetDateTime::now_utc()).max(1);
        let serialized = serde_json::to_string(claims)?;
        conn.set_ex::<_, _, ()>(self.session_key(claims.token), serialized, ttl)
            .await?;
        Ok(())
    }

    async fn load_session(&self, token: Uuid) -> Result<Option<SessionClaims>, AccountError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(self.session_key(token)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
