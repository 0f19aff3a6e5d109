//! Error types shared by the store, the lifecycle manager and the sync engine.

use thiserror::Error;

use crate::local_db_model::FailureKind;

/// Failure of the underlying key-value persistence.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("LMDB error: {0}")]
    Lmdb(#[from] lmdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Value for key '{0}' is not valid UTF-8")]
    InvalidUtf8(String),

    #[error("Blocking storage task failed: {0}")]
    Task(String),

    #[error("Counter '{0}' cannot be incremented past its maximum")]
    CounterOverflow(String),
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageError::Task(err.to_string())
    }
}

/// Failure reported by a Remote API client that could not normalize it into
/// an `ApiResponse`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Reasons a submission (or a whole run) did not reach the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Sync already in progress")]
    ConcurrentSync,

    /// The record disappeared from its partition between the snapshot and the
    /// move. Only possible when the single-writer guarantee is broken.
    #[error("Failed to move to synced storage")]
    Anomaly { submission_id: String },

    #[error("{message}")]
    Rejected {
        message: String,
        status: Option<u16>,
    },

    #[error("{0}")]
    Network(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Unknown batch sync error")]
    UnaccountedInBatch,
}

impl SyncError {
    /// Whether resubmitting the same payload could succeed.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SyncError::Rejected {
                status: Some(status),
                ..
            } if is_permanent_status(*status) => FailureKind::Permanent,
            _ => FailureKind::Transient,
        }
    }
}

/// Only malformed (400) and unprocessable (422) payloads are terminal. Auth,
/// lookup and conflict statuses can clear up without editing the record.
pub fn is_permanent_status(status: u16) -> bool {
    matches!(status, 400 | 422)
}
