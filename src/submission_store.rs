//! Persistent Submission Store.
//!
//! Maps the three lifecycle partitions, the `last_sync` scalar and the
//! farmer-ID counters onto keys of a [`KeyValueStore`]. Partitions are stored
//! as JSON arrays, most recent first.
//!
//! Reads never fail on damaged data: a partition that is not a JSON array
//! reads as empty and an element that is not a valid submission is skipped,
//! both with an error in the log. Only an unavailable backend surfaces as
//! [`StorageError`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, warn};
use serde_json::{Map, Value as JsonValue};

use crate::error::StorageError;
use crate::kv_store::KeyValueStore;
use crate::local_db_model::{Submission, SubmissionStatus};

const LAST_SYNC_KEY: &str = "last_sync";
const FARMER_COUNTER_KEY: &str = "farmer_id_counter_";

#[derive(Clone)]
pub struct SubmissionStore {
    kv: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl SubmissionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn partition_key(&self, partition: SubmissionStatus) -> String {
        format!("{}{}_submissions", self.prefix, partition.as_str())
    }

    fn scalar_key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub async fn get_partition(
        &self,
        partition: SubmissionStatus,
    ) -> Result<Vec<Submission>, StorageError> {
        let key = self.partition_key(partition);
        let raw = match self.kv.get(&key).await? {
            Some(raw) => raw,
            None => return Ok(Vec::new()),
        };

        let items: Vec<JsonValue> = match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(e) => {
                error!("Partition '{key}' is corrupt, reading it as empty: {e}");
                return Ok(Vec::new());
            }
        };

        let total = items.len();
        let submissions: Vec<Submission> = items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<Submission>(item) {
                Ok(submission) => Some(submission),
                Err(e) => {
                    error!("Skipping unreadable record in '{key}': {e}");
                    None
                }
            })
            .collect();

        if submissions.len() != total {
            warn!(
                "Partition '{key}': {} of {total} records could not be read",
                total - submissions.len()
            );
        }
        Ok(submissions)
    }

    /// Full overwrite. Callers serialize read-modify-write sequences.
    pub async fn set_partition(
        &self,
        partition: SubmissionStatus,
        items: &[Submission],
    ) -> Result<(), StorageError> {
        let json = serde_json::to_string(items)?;
        self.kv.set(&self.partition_key(partition), json).await
    }

    pub async fn clear_partition(&self, partition: SubmissionStatus) -> Result<(), StorageError> {
        self.kv.remove(&self.partition_key(partition)).await?;
        Ok(())
    }

    pub async fn get_scalar(&self, name: &str) -> Result<Option<String>, StorageError> {
        self.kv.get(&self.scalar_key(name)).await
    }

    pub async fn set_scalar(&self, name: &str, value: &str) -> Result<(), StorageError> {
        self.kv.set(&self.scalar_key(name), value.to_string()).await
    }

    pub async fn remove_scalar(&self, name: &str) -> Result<bool, StorageError> {
        self.kv.remove(&self.scalar_key(name)).await
    }

    pub async fn last_sync(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let raw = match self.get_scalar(LAST_SYNC_KEY).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(ts) => Ok(Some(ts.with_timezone(&Utc))),
            Err(e) => {
                warn!("Ignoring unreadable last_sync value '{raw}': {e}");
                Ok(None)
            }
        }
    }

    pub async fn set_last_sync(&self, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.set_scalar(LAST_SYNC_KEY, &at.to_rfc3339()).await
    }

    fn counter_name(agent_id: &str, lga: &str, ward: &str) -> String {
        format!("{FARMER_COUNTER_KEY}{agent_id}_{lga}_{ward}")
    }

    pub async fn farmer_counter(
        &self,
        agent_id: &str,
        lga: &str,
        ward: &str,
    ) -> Result<u64, StorageError> {
        let name = Self::counter_name(agent_id, lga, ward);
        Ok(match self.get_scalar(&name).await? {
            Some(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
                warn!("Counter '{name}' holds non-numeric value '{raw}', treating as 0");
                0
            }),
            None => 0,
        })
    }

    pub async fn increment_farmer_counter(
        &self,
        agent_id: &str,
        lga: &str,
        ward: &str,
    ) -> Result<u64, StorageError> {
        let name = Self::counter_name(agent_id, lga, ward);
        let next = self
            .farmer_counter(agent_id, lga, ward)
            .await?
            .checked_add(1)
            .ok_or_else(|| StorageError::CounterOverflow(name.clone()))?;
        self.set_scalar(&name, &next.to_string()).await?;
        Ok(next)
    }

    pub async fn reset_farmer_counter(
        &self,
        agent_id: &str,
        lga: &str,
        ward: &str,
    ) -> Result<(), StorageError> {
        self.remove_scalar(&Self::counter_name(agent_id, lga, ward))
            .await?;
        Ok(())
    }

    async fn namespace_keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .kv
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(&self.prefix))
            .collect())
    }

    /// Removes every key under the prefix. Returns how many were removed.
    pub async fn clear_namespace(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        for key in self.namespace_keys().await? {
            if self.kv.remove(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Every key under the prefix, values decoded as JSON where possible.
    pub async fn export_namespace(&self) -> Result<Map<String, JsonValue>, StorageError> {
        let mut exported = Map::new();
        for key in self.namespace_keys().await? {
            if let Some(raw) = self.kv.get(&key).await? {
                let value = serde_json::from_str(&raw).unwrap_or(JsonValue::String(raw));
                exported.insert(key, value);
            }
        }
        Ok(exported)
    }

    /// Writes back an export. Keys outside the prefix are ignored.
    pub async fn import_namespace(
        &self,
        data: &Map<String, JsonValue>,
    ) -> Result<usize, StorageError> {
        let mut written = 0;
        for (key, value) in data {
            if !key.starts_with(&self.prefix) {
                warn!("Ignoring foreign key '{key}' during import");
                continue;
            }
            let raw = match value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.kv.set(key, raw).await?;
            written += 1;
        }
        Ok(written)
    }

    /// `(total keys, keys under the prefix, bytes of keys and values under the prefix)`.
    pub async fn usage(&self) -> Result<(usize, usize, usize), StorageError> {
        let all = self.kv.keys().await?;
        let total = all.len();
        let mut app_keys = 0;
        let mut size = 0;
        for key in all.iter().filter(|k| k.starts_with(&self.prefix)) {
            app_keys += 1;
            if let Some(value) = self.kv.get(key).await? {
                size += key.len() + value.len();
            }
        }
        Ok((total, app_keys, size))
    }
}
