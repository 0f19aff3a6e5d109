//! Data model definitions for the submission queue.
//!
//! The primary record is [`Submission`]: one farmer/livestock registration
//! captured by one agent. Only a handful of fields are bookkeeping owned by
//! this crate; everything else is an opaque JSON payload that is carried to
//! the server untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Opaque domain payload (farmer identity, location, animal counts, ...).
pub type Payload = Map<String, JsonValue>;

/// Field names that only make sense on the device and never go over the wire.
pub const LOCAL_ONLY_FIELDS: [&str; 6] = [
    "id",
    "submission_status",
    "sync_error",
    "failure_kind",
    "created_at",
    "updated_at",
];

/// Lifecycle state of a submission. Always equal to the partition it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Synced,
    Failed,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Synced => "synced",
            SubmissionStatus::Failed => "failed",
        }
    }
}

/// Whether a failed submission may be resubmitted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Network trouble, timeouts, server errors. Retry may succeed.
    Transient,
    /// The server rejected the payload itself. Needs an edit before retry.
    Permanent,
}

/// A farmer/livestock registration in one of the three partitions.
///
/// On disk the payload is flattened next to the bookkeeping fields, so a
/// stored record looks like the object the agent filled in plus `id`,
/// `registration_id`, `submission_status`, timestamps and the optional error
/// annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Locally generated UUID. Stable for the life of the local record.
    pub id: String,

    /// Human-facing identifier. Client generated, replaced by the server's
    /// canonical value after a successful sync.
    pub registration_id: String,

    pub submission_status: SubmissionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(flatten)]
    pub payload: Payload,
}

impl Submission {
    /// Payload sent to the server: the domain fields plus `registration_id`,
    /// with every local bookkeeping field removed.
    pub fn wire_payload(&self) -> Payload {
        let mut wire = Self::strip_local_fields(self.payload.clone());
        wire.insert(
            "registration_id".to_string(),
            JsonValue::String(self.registration_id.clone()),
        );
        wire
    }

    pub fn strip_local_fields(mut payload: Payload) -> Payload {
        for field in LOCAL_ONLY_FIELDS {
            payload.remove(field);
        }
        payload
    }

    /// Reads a string field from the payload.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(JsonValue::as_str)
    }
}

/// Snapshot of a running sync, broadcast to progress subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub total: usize,
    pub processed: usize,
    pub synced: usize,
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_submission: Option<String>,
}

/// One per-item failure inside a [`SyncResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItemError {
    pub submission_id: String,
    pub registration_id: String,
    pub error: String,
}

impl SyncItemError {
    /// An error that is not attached to any particular submission.
    pub fn run_level(error: impl Into<String>) -> Self {
        Self {
            submission_id: String::new(),
            registration_id: String::new(),
            error: error.into(),
        }
    }

    pub fn for_submission(submission: &Submission, error: impl Into<String>) -> Self {
        Self {
            submission_id: submission.id.clone(),
            registration_id: submission.registration_id.clone(),
            error: error.into(),
        }
    }
}

/// Outcome of a sync, batch sync or retry call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub synced: usize,
    pub failed: usize,
    /// Permanently failed records left out of a retry.
    #[serde(default)]
    pub skipped: usize,
    pub errors: Vec<SyncItemError>,
}

/// Partition sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionStats {
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
    pub total: usize,
}

impl SubmissionStats {
    pub fn new(pending: usize, synced: usize, failed: usize) -> Self {
        Self {
            pending,
            synced,
            failed,
            total: pending + synced + failed,
        }
    }
}

/// Cheap summary for polling UIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub is_syncing: bool,
    pub is_online: bool,
}

/// Size estimate of everything this crate keeps in the key-value store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub total_keys: usize,
    pub app_keys: usize,
    pub size_estimate: usize,
    pub stats: SubmissionStats,
}
