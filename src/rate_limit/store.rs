//! Transactional Store
//!
//! The store is the only state shared between limiter instances. Admission
//! decisions are made exclusively inside [`TransactionalStore::run_transaction`];
//! `get`/`set` exist for diagnostics and maintenance.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::error::StoreError;

/// Stored document
pub type Document = Value;

/// Commit attempts before a transaction gives up on a contended key
pub const MAX_TRANSACTION_ATTEMPTS: u32 = 5;

/// Write produced by a transaction body
#[derive(Debug, Clone, PartialEq)]
pub enum TxWrite {
    /// Leave the document untouched
    Keep,
    /// Replace the document
    Put(Document),
    /// Remove the document
    Delete,
}

/// Transaction body: receives the snapshot of one document, returns the write
pub type TxBody<'a> = dyn FnMut(Option<&Document>) -> Result<TxWrite, StoreError> + Send + 'a;

/// Key-value store with single-document read-modify-write transactions
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Read a document outside any transaction
    async fn get(&self, key: &str) -> Result<Option<Document>, StoreError>;

    /// Blind write (never used for admission decisions)
    async fn set(&self, key: &str, value: Document) -> Result<(), StoreError>;

    /// Remove a document, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Run `body` against a snapshot of `key` and commit its write atomically
    ///
    /// `body` may run more than once when the commit conflicts with a
    /// concurrent writer; only the effects of the final run are committed.
    async fn run_transaction(&self, key: &str, body: &mut TxBody<'_>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct Versioned {
    value: Document,
    version: u64,
}

/// In-memory store with optimistic snapshot isolation
///
/// Every committed write bumps the document version; a commit whose snapshot
/// version no longer matches is retried with a fresh snapshot.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    documents: Arc<RwLock<HashMap<String, Versioned>>>,
    next_version: Arc<AtomicU64>,
    available: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            documents: Arc::new(RwLock::new(HashMap::new())),
            next_version: Arc::new(AtomicU64::new(1)),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage: while unavailable every operation fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored documents
    pub async fn count(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Remove every document
    pub async fn clear(&self) {
        self.documents.write().await.clear();
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Document>, StoreError> {
        self.ensure_available()?;
        let documents = self.documents.read().await;
        Ok(documents.get(key).map(|d| d.value.clone()))
    }

    async fn set(&self, key: &str, value: Document) -> Result<(), StoreError> {
        self.ensure_available()?;
        let version = self.bump();
        let mut documents = self.documents.write().await;
        documents.insert(key.to_string(), Versioned { value, version });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let mut documents = self.documents.write().await;
        Ok(documents.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_available()?;
        let documents = self.documents.read().await;
        Ok(documents
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn run_transaction(&self, key: &str, body: &mut TxBody<'_>) -> Result<(), StoreError> {
        for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
            self.ensure_available()?;

            let (snapshot, read_version) = {
                let documents = self.documents.read().await;
                match documents.get(key) {
                    Some(d) => (Some(d.value.clone()), d.version),
                    None => (None, 0),
                }
            };

            let write = body(snapshot.as_ref())?;

            let mut documents = self.documents.write().await;
            let current_version = documents.get(key).map(|d| d.version).unwrap_or(0);
            if current_version != read_version {
                tracing::debug!(key, attempt, "Transaction conflict, retrying");
                continue;
            }

            match write {
                TxWrite::Keep => {}
                TxWrite::Put(value) => {
                    let version = self.bump();
                    documents.insert(key.to_string(), Versioned { value, version });
                }
                TxWrite::Delete => {
                    documents.remove(key);
                }
            }
            return Ok(());
        }

        Err(StoreError::Contention {
            key: key.to_string(),
            attempts: MAX_TRANSACTION_ATTEMPTS,
        })
    }
}
