use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::local_db_state::DEFAULT_MAP_SIZE;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api/v1";

/// Upper bound for `retention_days` (about a century).
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// Tunables for the store, the lifecycle manager and the sync engine.
///
/// Deserializes from a partial JSON object; missing fields take the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api_base_url: String,
    /// Prefix of every key this crate writes.
    pub key_prefix: String,
    pub pending_cap: usize,
    pub synced_cap: usize,
    pub failed_cap: usize,
    /// Pending and failed records older than this are evicted by cleanup.
    pub retention_days: i64,
    pub request_timeout_secs: u64,
    pub auto_sync_interval_secs: u64,
    pub lmdb_map_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            key_prefix: "@livestock_".to_string(),
            pending_cap: 500,
            synced_cap: 1000,
            failed_cap: 100,
            retention_days: 30,
            request_timeout_secs: 30,
            auto_sync_interval_secs: 300, // 5 minutes
            lmdb_map_size: DEFAULT_MAP_SIZE,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `SYNC_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("SYNC_API_BASE_URL") {
            let v = v.trim();
            if !v.is_empty() {
                cfg.api_base_url = v.trim_end_matches('/').to_string();
            }
        }
        if let Ok(v) = std::env::var("SYNC_KEY_PREFIX") {
            cfg.key_prefix = v;
        }
        if let Some(value) = env_usize("SYNC_PENDING_CAP") {
            cfg.pending_cap = value;
        }
        if let Some(value) = env_usize("SYNC_SYNCED_CAP") {
            cfg.synced_cap = value;
        }
        if let Some(value) = env_usize("SYNC_FAILED_CAP") {
            cfg.failed_cap = value;
        }
        if let Some(value) = env_parse::<i64>("SYNC_RETENTION_DAYS") {
            cfg.retention_days = value.clamp(1, MAX_RETENTION_DAYS);
        }
        if let Some(value) = env_parse::<u64>("SYNC_REQUEST_TIMEOUT_SECS") {
            cfg.request_timeout_secs = value.max(1);
        }
        if let Some(value) = env_parse::<u64>("SYNC_AUTO_SYNC_INTERVAL_SECS") {
            cfg.auto_sync_interval_secs = value.max(1);
        }
        if let Some(value) = env_usize("SYNC_LMDB_MAP_SIZE") {
            cfg.lmdb_map_size = value;
        }

        cfg
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.api_base_url.is_empty() {
            return Err("api_base_url must not be empty".to_string());
        }
        if self.pending_cap == 0 || self.synced_cap == 0 || self.failed_cap == 0 {
            return Err("Partition caps must be greater than 0".to_string());
        }
        if self.retention_days <= 0 {
            return Err("retention_days must be greater than 0".to_string());
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(format!("retention_days must not exceed {MAX_RETENTION_DAYS}"));
        }
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be greater than 0".to_string());
        }
        if self.auto_sync_interval_secs == 0 {
            return Err("auto_sync_interval_secs must be greater than 0".to_string());
        }
        if self.lmdb_map_size == 0 {
            return Err("lmdb_map_size must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_secs(self.auto_sync_interval_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse::<T>().ok()
}

fn env_usize(name: &str) -> Option<usize> {
    env_parse::<usize>(name).filter(|v| *v > 0)
}
