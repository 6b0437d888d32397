//! Session state storage.

use crate::error::StoreResult;
use crate::options::StoreOptions;
use crate::types::{LogoutClaims, MAX_LIFETIME_SECONDS, SessionRecord};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Trait for session state storage
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn set(
        &self,
        identifier: &str,
        record: SessionRecord,
        options: &StoreOptions,
    ) -> StoreResult<()>;

    async fn get(
        &self,
        identifier: &str,
        options: &StoreOptions,
    ) -> StoreResult<Option<SessionRecord>>;

    async fn delete(&self, identifier: &str, options: &StoreOptions) -> StoreResult<()>;

    /// Remove every session matching the claims of a backchannel logout token.
    ///
    /// Must be safe to call concurrently with reads and writes of the same
    /// sessions.
    async fn delete_by_logout_token(
        &self,
        claims: &LogoutClaims,
        options: &StoreOptions,
    ) -> StoreResult<()>;
}

/// Default absolute session lifetime: 3 days
pub const DEFAULT_ABSOLUTE_DURATION_SECONDS: u64 = 259_200;

/// In-memory implementation of StateStore
pub struct InMemoryStateStore {
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    absolute_duration: Duration,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::with_absolute_duration(DEFAULT_ABSOLUTE_DURATION_SECONDS)
    }

    pub fn with_absolute_duration(seconds: u64) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            absolute_duration: Duration::seconds(seconds.min(MAX_LIFETIME_SECONDS) as i64),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn is_expired(&self, record: &SessionRecord) -> bool {
        Utc::now() >= record.internal.issued_at + self.absolute_duration
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn set(
        &self,
        identifier: &str,
        record: SessionRecord,
        _options: &StoreOptions,
    ) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(identifier.to_string(), record);
        Ok(())
    }

    async fn get(
        &self,
        identifier: &str,
        _options: &StoreOptions,
    ) -> StoreResult<Option<SessionRecord>> {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(identifier) {
                None => return Ok(None),
                Some(record) if !self.is_expired(record) => return Ok(Some(record.clone())),
                Some(_) => {}
            }
        }

        // The record may have been replaced between the two locks
        let mut sessions = self.sessions.write().await;
        match sessions.get(identifier) {
            Some(record) if self.is_expired(record) => {
                debug!("Session {} exceeded its absolute duration", identifier);
                sessions.remove(identifier);
                Ok(None)
            }
            Some(record) => Ok(Some(record.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, identifier: &str, _options: &StoreOptions) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(identifier);
        Ok(())
    }

    async fn delete_by_logout_token(
        &self,
        claims: &LogoutClaims,
        _options: &StoreOptions,
    ) -> StoreResult<()> {
        // Full scan under the write lock: no reader can observe a half-invalidated login
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, record| !record.matches_logout(claims));
        let removed = before - sessions.len();

        info!("Backchannel logout removed {} session(s)", removed);
        Ok(())
    }
}
