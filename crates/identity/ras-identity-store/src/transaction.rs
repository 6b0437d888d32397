//! Transaction storage for in-progress login flows.

use crate::error::StoreResult;
use crate::options::StoreOptions;
use crate::types::TransactionRecord;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Trait for transaction storage.
///
/// Backends may enforce their own TTL, but callers always check
/// [`TransactionRecord::expires_at`] themselves.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Store a transaction, replacing any record under the same identifier
    async fn set(
        &self,
        identifier: &str,
        record: TransactionRecord,
        options: &StoreOptions,
    ) -> StoreResult<()>;

    async fn get(
        &self,
        identifier: &str,
        options: &StoreOptions,
    ) -> StoreResult<Option<TransactionRecord>>;

    async fn delete(&self, identifier: &str, options: &StoreOptions) -> StoreResult<()>;
}

/// In-memory implementation of TransactionStore
pub struct InMemoryTransactionStore {
    transactions: Arc<RwLock<HashMap<String, TransactionRecord>>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self {
            transactions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Clean up expired transactions
    pub async fn cleanup_expired(&self) -> usize {
        let mut transactions = self.transactions.write().await;
        let now = Utc::now();

        let before = transactions.len();
        transactions.retain(|_, record| now < record.expires_at);
        let count = before - transactions.len();

        if count > 0 {
            debug!("Evicted {} expired transactions", count);
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.transactions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryTransactionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn set(
        &self,
        identifier: &str,
        record: TransactionRecord,
        _options: &StoreOptions,
    ) -> StoreResult<()> {
        let mut transactions = self.transactions.write().await;
        transactions.insert(identifier.to_string(), record);
        Ok(())
    }

    async fn get(
        &self,
        identifier: &str,
        _options: &StoreOptions,
    ) -> StoreResult<Option<TransactionRecord>> {
        let mut transactions = self.transactions.write().await;

        match transactions.get(identifier) {
            Some(record) if record.is_expired() => {
                transactions.remove(identifier);
                Ok(None)
            }
            Some(record) => Ok(Some(record.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, identifier: &str, _options: &StoreOptions) -> StoreResult<()> {
        let mut transactions = self.transactions.write().await;
        transactions.remove(identifier);
        Ok(())
    }
}
