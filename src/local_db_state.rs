//! LMDB-backed key-value store.
//!
//! One LMDB environment per database name, stored in a `<name>.lmdb`
//! directory, holding a single named database of UTF-8 keys and values.
//! Every call runs on tokio's blocking pool so the async callers never stall
//! on disk I/O.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lmdb::{Cursor, Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use log::{info, warn};

use crate::error::StorageError;
use crate::kv_store::KeyValueStore;

const DATABASE_NAME: &str = "submission_store";

pub const DEFAULT_MAP_SIZE: usize = 64 * 1024 * 1024;

pub struct AppDbState {
    env: Arc<Environment>,
    db: Database,
    path: PathBuf,
}

impl AppDbState {
    /// Opens (or creates) `<name>.lmdb` with the default map size.
    pub fn init(name: &str) -> Result<Self, StorageError> {
        Self::init_with_map_size(name, DEFAULT_MAP_SIZE)
    }

    pub fn init_with_map_size(name: &str, map_size: usize) -> Result<Self, StorageError> {
        let path = PathBuf::from(format!("{name}.lmdb"));
        Self::open(&path, map_size)
    }

    /// Opens an environment directly at `path`.
    pub fn open(path: &Path, map_size: usize) -> Result<Self, StorageError> {
        if !path.exists() {
            info!("Creating LMDB environment at {}", path.display());
            std::fs::create_dir_all(path).map_err(|e| {
                StorageError::Unavailable(format!("cannot create {}: {e}", path.display()))
            })?;
        }

        let env = Environment::new()
            .set_max_dbs(1)
            .set_map_size(map_size)
            .open(path)?;
        let db = env.create_db(Some(DATABASE_NAME), DatabaseFlags::empty())?;

        info!("LMDB environment ready at {}", path.display());
        Ok(Self {
            env: Arc::new(env),
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forces buffered writes to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.env.sync(true)?;
        Ok(())
    }

    fn get_blocking(env: &Environment, db: Database, key: &str) -> Result<Option<String>, StorageError> {
        let txn = env.begin_ro_txn()?;
        let value = match txn.get(db, &key) {
            Ok(bytes) => Some(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| StorageError::InvalidUtf8(key.to_string()))?,
            ),
            Err(lmdb::Error::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        txn.abort();
        Ok(value)
    }

    fn set_blocking(env: &Environment, db: Database, key: &str, value: &str) -> Result<(), StorageError> {
        let mut txn = env.begin_rw_txn()?;
        txn.put(db, &key, &value, WriteFlags::empty())?;
        txn.commit()?;
        Ok(())
    }

    fn remove_blocking(env: &Environment, db: Database, key: &str) -> Result<bool, StorageError> {
        let mut txn = env.begin_rw_txn()?;
        let existed = match txn.del(db, &key, None) {
            Ok(()) => true,
            Err(lmdb::Error::NotFound) => false,
            Err(e) => return Err(e.into()),
        };
        txn.commit()?;
        Ok(existed)
    }

    fn keys_blocking(env: &Environment, db: Database) -> Result<Vec<String>, StorageError> {
        let txn = env.begin_ro_txn()?;
        let mut keys = Vec::new();
        {
            let mut cursor = txn.open_ro_cursor(db)?;
            for (key, _) in cursor.iter() {
                match std::str::from_utf8(key) {
                    Ok(k) => keys.push(k.to_string()),
                    Err(_) => warn!("Skipping non UTF-8 key in LMDB store"),
                }
            }
        }
        txn.abort();
        Ok(keys)
    }
}

#[async_trait]
impl KeyValueStore for AppDbState {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let env = Arc::clone(&self.env);
        let db = self.db;
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::get_blocking(&env, db, &key)).await?
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        let env = Arc::clone(&self.env);
        let db = self.db;
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::set_blocking(&env, db, &key, &value)).await?
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let env = Arc::clone(&self.env);
        let db = self.db;
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::remove_blocking(&env, db, &key)).await?
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let env = Arc::clone(&self.env);
        let db = self.db;
        tokio::task::spawn_blocking(move || Self::keys_blocking(&env, db)).await?
    }
}
