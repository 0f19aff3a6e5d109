//! Asynchronous string-keyed store contract.
//!
//! The submission store only needs `get`/`set`/`remove` over string keys and
//! string values, plus key listing for export and clear-all. The durable
//! implementation is the LMDB-backed [`AppDbState`](crate::local_db_state::AppDbState);
//! [`MemoryStore`] keeps everything in process.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError>;

    /// Returns whether the key existed.
    async fn remove(&self, key: &str) -> Result<bool, StorageError>;

    async fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// In-process store.
///
/// `set_available(false)` makes every call fail with
/// [`StorageError::Unavailable`], which is how storage outages are simulated.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn entries(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store switched off".to_string()));
        }
        self.entries
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.entries()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries()?.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries()?.keys().cloned().collect())
    }
}
