//! Submission Lifecycle Manager.
//!
//! Owns the partition invariants: every `id` lives in exactly one partition,
//! `submission_status` matches that partition, `registration_id` is never
//! empty, and every partition stays under its cap (oldest entries evicted).
//!
//! Every read-modify-write sequence runs under one async mutex, so two
//! callers can never interleave a read and a write of the same partition.
//! Reads that span several partitions take the same mutex to observe a
//! consistent state.
//!
//! Storage failures never escape: they are logged and turned into a safe
//! default (`false`, `None`, empty list, zero stats).

use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::StorageError;
use crate::identifiers::{area_code, format_farmer_id, generate_registration_id};
use crate::local_db_model::{
    FailureKind, Payload, StorageInfo, Submission, SubmissionStats, SubmissionStatus,
    LOCAL_ONLY_FIELDS,
};
use crate::submission_store::SubmissionStore;

/// Maximum number of records kept per partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionCaps {
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
}

impl PartitionCaps {
    pub fn for_partition(&self, partition: SubmissionStatus) -> usize {
        match partition {
            SubmissionStatus::Pending => self.pending,
            SubmissionStatus::Synced => self.synced,
            SubmissionStatus::Failed => self.failed,
        }
    }
}

impl From<&SyncConfig> for PartitionCaps {
    fn from(config: &SyncConfig) -> Self {
        Self {
            pending: config.pending_cap,
            synced: config.synced_cap,
            failed: config.failed_cap,
        }
    }
}

/// Merges server fields into a payload that has not been stored yet.
/// Same precedence rules as a move to synced.
pub fn merge_server_payload(payload: &mut Payload, server_fields: &Payload) {
    for (key, value) in server_fields {
        match key.as_str() {
            "registration_id" => {
                if value.as_str().is_some_and(|id| !id.trim().is_empty()) {
                    payload.insert(key.clone(), value.clone());
                }
            }
            "id" => {
                payload.insert("server_id".to_string(), value.clone());
            }
            k if LOCAL_ONLY_FIELDS.contains(&k) => {}
            _ => {
                payload.insert(key.clone(), value.clone());
            }
        }
    }
}

pub struct SubmissionManager {
    store: SubmissionStore,
    caps: PartitionCaps,
    write_lock: Mutex<()>,
}

impl SubmissionManager {
    pub fn new(store: SubmissionStore, caps: PartitionCaps) -> Self {
        Self {
            store,
            caps,
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &SubmissionStore {
        &self.store
    }

    pub fn caps(&self) -> PartitionCaps {
        self.caps
    }

    fn new_record(
        mut payload: Payload,
        status: SubmissionStatus,
        sync_error: Option<String>,
        failure_kind: Option<FailureKind>,
    ) -> Submission {
        for field in LOCAL_ONLY_FIELDS {
            payload.remove(field);
        }
        let registration_id = match payload.remove("registration_id") {
            Some(JsonValue::String(id)) if !id.trim().is_empty() => id,
            _ => generate_registration_id(),
        };
        let now = Utc::now();
        Submission {
            id: Uuid::new_v4().to_string(),
            registration_id,
            submission_status: status,
            sync_error,
            failure_kind,
            created_at: now,
            updated_at: now,
            payload,
        }
    }

    /// Prepends to a partition and evicts from the tail past the cap.
    /// Caller holds the write lock.
    async fn prepend(
        &self,
        partition: SubmissionStatus,
        submission: Submission,
    ) -> Result<(), StorageError> {
        let mut items = self.store.get_partition(partition).await?;
        items.insert(0, submission);
        let cap = self.caps.for_partition(partition);
        if items.len() > cap {
            let evicted = items.len() - cap;
            warn!(
                "{} partition over its cap of {cap}, evicting {evicted} oldest record(s)",
                partition.as_str()
            );
            items.truncate(cap);
        }
        self.store.set_partition(partition, &items).await
    }

    async fn add(
        &self,
        payload: Payload,
        status: SubmissionStatus,
        sync_error: Option<String>,
        failure_kind: Option<FailureKind>,
    ) -> Option<Submission> {
        let _guard = self.write_lock.lock().await;
        let submission = Self::new_record(payload, status, sync_error, failure_kind);
        match self.prepend(status, submission.clone()).await {
            Ok(()) => Some(submission),
            Err(e) => {
                error!("Error saving {} submission: {e}", status.as_str());
                None
            }
        }
    }

    /// Stores a newly captured record in the pending partition.
    ///
    /// At the pending cap the oldest pending record is dropped.
    pub async fn add_pending(&self, payload: Payload) -> Option<Submission> {
        self.add(payload, SubmissionStatus::Pending, None, None).await
    }

    /// Stores a record whose server outcome is already known to be success.
    pub async fn add_synced(&self, payload: Payload) -> Option<Submission> {
        self.add(payload, SubmissionStatus::Synced, None, None).await
    }

    /// Stores a record whose server outcome is already known to be failure.
    pub async fn add_failed(
        &self,
        payload: Payload,
        error: impl Into<String>,
        kind: FailureKind,
    ) -> Option<Submission> {
        self.add(
            payload,
            SubmissionStatus::Failed,
            Some(error.into()),
            Some(kind),
        )
        .await
    }

    /// Server fields win over local ones, except the local bookkeeping.
    /// A server `id` is its own primary key and is kept as `server_id`.
    fn merge_server_fields(record: &mut Submission, server_fields: &Payload) {
        for (key, value) in server_fields {
            match key.as_str() {
                "registration_id" => match value.as_str() {
                    Some(id) if !id.trim().is_empty() => record.registration_id = id.to_string(),
                    _ => warn!(
                        "Server returned an unusable registration_id for {}, keeping {}",
                        record.id, record.registration_id
                    ),
                },
                "id" => {
                    record.payload.insert("server_id".to_string(), value.clone());
                }
                k if LOCAL_ONLY_FIELDS.contains(&k) => {}
                _ => {
                    record.payload.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Moves a pending record to synced with the server's fields merged in.
    ///
    /// Returns `false` when the id is not in pending, e.g. because another
    /// call already moved it. That is a no-op, not an error.
    pub async fn move_to_synced(&self, pending_id: &str, server_fields: &Payload) -> bool {
        let _guard = self.write_lock.lock().await;
        match self.try_move_to_synced(pending_id, server_fields).await {
            Ok(moved) => moved,
            Err(e) => {
                error!("Error moving submission {pending_id} to synced: {e}");
                false
            }
        }
    }

    async fn try_move_to_synced(
        &self,
        pending_id: &str,
        server_fields: &Payload,
    ) -> Result<bool, StorageError> {
        let mut pending = self.store.get_partition(SubmissionStatus::Pending).await?;
        let Some(position) = pending.iter().position(|s| s.id == pending_id) else {
            warn!("Submission not found in pending: {pending_id}");
            return Ok(false);
        };

        let mut record = pending.remove(position);
        Self::merge_server_fields(&mut record, server_fields);
        record.submission_status = SubmissionStatus::Synced;
        record.sync_error = None;
        record.failure_kind = None;
        record.updated_at = Utc::now();

        // Destination first: an interrupted move leaves a duplicate, never a loss.
        self.prepend(SubmissionStatus::Synced, record).await?;
        self.store
            .set_partition(SubmissionStatus::Pending, &pending)
            .await?;
        Ok(true)
    }

    /// Moves a pending (or, for server-side invalidation, a synced) record to
    /// failed with the given error annotation.
    pub async fn move_to_failed(
        &self,
        id: &str,
        error_message: &str,
        from: SubmissionStatus,
        kind: FailureKind,
    ) -> bool {
        if from == SubmissionStatus::Failed {
            warn!("Refusing to move {id} from failed to failed");
            return false;
        }
        let _guard = self.write_lock.lock().await;
        match self.try_move_to_failed(id, error_message, from, kind).await {
            Ok(moved) => moved,
            Err(e) => {
                error!("Error moving submission {id} to failed: {e}");
                false
            }
        }
    }

    async fn try_move_to_failed(
        &self,
        id: &str,
        error_message: &str,
        from: SubmissionStatus,
        kind: FailureKind,
    ) -> Result<bool, StorageError> {
        let mut source = self.store.get_partition(from).await?;
        let Some(position) = source.iter().position(|s| s.id == id) else {
            warn!("Submission not found in {}: {id}", from.as_str());
            return Ok(false);
        };

        let mut record = source.remove(position);
        record.submission_status = SubmissionStatus::Failed;
        record.sync_error = Some(error_message.to_string());
        record.failure_kind = Some(kind);
        record.updated_at = Utc::now();

        self.prepend(SubmissionStatus::Failed, record).await?;
        self.store.set_partition(from, &source).await?;
        Ok(true)
    }

    /// Puts a failed record back into pending under a fresh local id with its
    /// error cleared. Returns the requeued record.
    pub async fn requeue_failed(&self, failed_id: &str) -> Option<Submission> {
        let _guard = self.write_lock.lock().await;
        match self.try_requeue_failed(failed_id).await {
            Ok(requeued) => requeued,
            Err(e) => {
                error!("Error requeueing failed submission {failed_id}: {e}");
                None
            }
        }
    }

    async fn try_requeue_failed(&self, failed_id: &str) -> Result<Option<Submission>, StorageError> {
        let mut failed = self.store.get_partition(SubmissionStatus::Failed).await?;
        let Some(position) = failed.iter().position(|s| s.id == failed_id) else {
            warn!("Submission not found in failed: {failed_id}");
            return Ok(None);
        };

        let mut record = failed.remove(position);
        record.id = Uuid::new_v4().to_string();
        record.submission_status = SubmissionStatus::Pending;
        record.sync_error = None;
        record.failure_kind = None;
        record.updated_at = Utc::now();

        self.prepend(SubmissionStatus::Pending, record.clone())
            .await?;
        self.store
            .set_partition(SubmissionStatus::Failed, &failed)
            .await?;
        Ok(Some(record))
    }

    /// Applies payload edits to a failed record. A permanent failure becomes
    /// transient so the next retry resubmits it.
    pub async fn edit_failed(&self, failed_id: &str, updates: &Payload) -> bool {
        let _guard = self.write_lock.lock().await;
        let result: Result<bool, StorageError> = async {
            let mut failed = self.store.get_partition(SubmissionStatus::Failed).await?;
            let Some(record) = failed.iter_mut().find(|s| s.id == failed_id) else {
                warn!("Submission not found in failed: {failed_id}");
                return Ok(false);
            };
            for (key, value) in updates {
                match key.as_str() {
                    "registration_id" => {
                        if let Some(id) = value.as_str().filter(|id| !id.trim().is_empty()) {
                            record.registration_id = id.to_string();
                        }
                    }
                    k if LOCAL_ONLY_FIELDS.contains(&k) => {}
                    _ => {
                        record.payload.insert(key.clone(), value.clone());
                    }
                }
            }
            if record.failure_kind == Some(FailureKind::Permanent) {
                record.failure_kind = Some(FailureKind::Transient);
            }
            record.updated_at = Utc::now();
            self.store
                .set_partition(SubmissionStatus::Failed, &failed)
                .await?;
            Ok(true)
        }
        .await;

        result.unwrap_or_else(|e| {
            error!("Error editing failed submission {failed_id}: {e}");
            false
        })
    }

    async fn read_partition(&self, partition: SubmissionStatus) -> Vec<Submission> {
        self.store.get_partition(partition).await.unwrap_or_else(|e| {
            error!("Error reading {} submissions: {e}", partition.as_str());
            Vec::new()
        })
    }

    pub async fn get_pending(&self) -> Vec<Submission> {
        self.read_partition(SubmissionStatus::Pending).await
    }

    pub async fn get_synced(&self) -> Vec<Submission> {
        self.read_partition(SubmissionStatus::Synced).await
    }

    pub async fn get_failed(&self) -> Vec<Submission> {
        self.read_partition(SubmissionStatus::Failed).await
    }

    async fn read_all(&self) -> Result<[Vec<Submission>; 3], StorageError> {
        let _guard = self.write_lock.lock().await;
        Ok([
            self.store.get_partition(SubmissionStatus::Pending).await?,
            self.store.get_partition(SubmissionStatus::Synced).await?,
            self.store.get_partition(SubmissionStatus::Failed).await?,
        ])
    }

    pub async fn get_stats(&self) -> SubmissionStats {
        match self.read_all().await {
            Ok([pending, synced, failed]) => {
                SubmissionStats::new(pending.len(), synced.len(), failed.len())
            }
            Err(e) => {
                error!("Error getting stats: {e}");
                SubmissionStats::default()
            }
        }
    }

    /// Pending, then synced, then failed. Each keeps its own order.
    pub async fn get_all_submissions(&self) -> Vec<Submission> {
        match self.read_all().await {
            Ok([pending, synced, failed]) => {
                pending.into_iter().chain(synced).chain(failed).collect()
            }
            Err(e) => {
                error!("Error getting all submissions: {e}");
                Vec::new()
            }
        }
    }

    pub async fn find(&self, id: &str) -> Option<Submission> {
        self.get_all_submissions()
            .await
            .into_iter()
            .find(|s| s.id == id)
    }

    /// Case-insensitive match on farmer name, registration id, farmer id,
    /// LGA and ward; substring match on the contact number.
    pub async fn search(&self, query: &str) -> Vec<Submission> {
        let needle = query.to_lowercase();
        let matches = |value: Option<&str>| {
            value
                .map(|v| v.to_lowercase().contains(&needle))
                .unwrap_or(false)
        };
        self.get_all_submissions()
            .await
            .into_iter()
            .filter(|s| {
                matches(s.payload_str("farmer_name"))
                    || matches(Some(s.registration_id.as_str()))
                    || matches(s.payload_str("farmer_id"))
                    || matches(s.payload_str("lga"))
                    || matches(s.payload_str("ward"))
                    || s
                        .payload_str("contact_number")
                        .map(|c| c.contains(query))
                        .unwrap_or(false)
            })
            .collect()
    }

    pub async fn by_agent(&self, agent_id: &str) -> Vec<Submission> {
        self.get_all_submissions()
            .await
            .into_iter()
            .filter(|s| match s.payload.get("agent_id") {
                Some(JsonValue::String(id)) => id == agent_id,
                Some(JsonValue::Number(id)) => id.to_string() == agent_id,
                _ => false,
            })
            .collect()
    }

    /// Records created within `[start, end]`.
    pub async fn by_date_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Submission> {
        self.get_all_submissions()
            .await
            .into_iter()
            .filter(|s| s.created_at >= start && s.created_at <= end)
            .collect()
    }

    /// Evicts pending and failed records created before `now - max_age_days`.
    /// Synced records are kept. Returns how many records were evicted.
    pub async fn cleanup_old(&self, max_age_days: i64) -> usize {
        let _guard = self.write_lock.lock().await;
        let Some(cutoff) =
            Duration::try_days(max_age_days).and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            warn!("Cleanup age of {max_age_days} days is out of range, nothing evicted");
            return 0;
        };
        let mut evicted = 0;

        for partition in [SubmissionStatus::Pending, SubmissionStatus::Failed] {
            let result: Result<usize, StorageError> = async {
                let items = self.store.get_partition(partition).await?;
                let before = items.len();
                let recent: Vec<Submission> =
                    items.into_iter().filter(|s| s.created_at >= cutoff).collect();
                let removed = before - recent.len();
                if removed > 0 {
                    self.store.set_partition(partition, &recent).await?;
                }
                Ok(removed)
            }
            .await;

            match result {
                Ok(removed) => {
                    info!(
                        "Cleaned up {removed} old {} submissions",
                        partition.as_str()
                    );
                    evicted += removed;
                }
                Err(e) => error!("Error cleaning up {} submissions: {e}", partition.as_str()),
            }
        }
        evicted
    }

    /// Wipes every key this crate owns (logout/reset).
    pub async fn clear_all(&self) -> bool {
        let _guard = self.write_lock.lock().await;
        match self.store.clear_namespace().await {
            Ok(removed) => {
                info!("Cleared all submission data ({removed} keys)");
                true
            }
            Err(e) => {
                error!("Error clearing storage: {e}");
                false
            }
        }
    }

    pub async fn export_data(&self) -> String {
        let _guard = self.write_lock.lock().await;
        let exported = match self.store.export_namespace().await {
            Ok(exported) => exported,
            Err(e) => {
                error!("Error exporting data: {e}");
                return "{}".to_string();
            }
        };
        serde_json::to_string_pretty(&exported).unwrap_or_else(|e| {
            error!("Error serializing export: {e}");
            "{}".to_string()
        })
    }

    pub async fn import_data(&self, json: &str) -> bool {
        let data = match serde_json::from_str::<JsonValue>(json) {
            Ok(JsonValue::Object(data)) => data,
            Ok(_) => {
                error!("Import data must be a JSON object");
                return false;
            }
            Err(e) => {
                error!("Error parsing import data: {e}");
                return false;
            }
        };
        let _guard = self.write_lock.lock().await;
        match self.store.import_namespace(&data).await {
            Ok(written) => {
                info!("Imported {written} keys");
                true
            }
            Err(e) => {
                error!("Error importing data: {e}");
                false
            }
        }
    }

    pub async fn storage_info(&self) -> StorageInfo {
        let stats = self.get_stats().await;
        match self.store.usage().await {
            Ok((total_keys, app_keys, size_estimate)) => StorageInfo {
                total_keys,
                app_keys,
                size_estimate,
                stats,
            },
            Err(e) => {
                error!("Error getting storage info: {e}");
                StorageInfo::default()
            }
        }
    }

    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.store.last_sync().await.unwrap_or_else(|e| {
            error!("Error reading last sync: {e}");
            None
        })
    }

    pub async fn set_last_sync(&self, at: DateTime<Utc>) -> bool {
        match self.store.set_last_sync(at).await {
            Ok(()) => true,
            Err(e) => {
                error!("Error saving last sync: {e}");
                false
            }
        }
    }

    /// Allocates the next farmer ID for an agent in an LGA/ward, e.g.
    /// `DUT/CHA/07/001`.
    pub async fn next_farmer_id(&self, agent_serial: u32, lga: &str, ward: &str) -> Option<String> {
        let _guard = self.write_lock.lock().await;
        let agent = format!("agent_{agent_serial}");
        match self
            .store
            .increment_farmer_counter(&agent, &area_code(lga), &area_code(ward))
            .await
        {
            Ok(counter) => Some(format_farmer_id(lga, ward, agent_serial, counter)),
            Err(e) => {
                error!("Error generating farmer ID: {e}");
                None
            }
        }
    }

    pub async fn current_farmer_counter(&self, agent_serial: u32, lga: &str, ward: &str) -> u64 {
        let agent = format!("agent_{agent_serial}");
        self.store
            .farmer_counter(&agent, &area_code(lga), &area_code(ward))
            .await
            .unwrap_or_else(|e| {
                error!("Error reading farmer counter: {e}");
                0
            })
    }

    pub async fn reset_farmer_counter(&self, agent_serial: u32, lga: &str, ward: &str) -> bool {
        let _guard = self.write_lock.lock().await;
        let agent = format!("agent_{agent_serial}");
        match self
            .store
            .reset_farmer_counter(&agent, &area_code(lga), &area_code(ward))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!("Error resetting farmer counter: {e}");
                false
            }
        }
    }
}
