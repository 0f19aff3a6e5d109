//! Sync Engine.
//!
//! Drains the pending partition against the Remote API. One run at a time per
//! engine: the run flag is an `AtomicBool` taken with compare-and-swap and
//! released by a guard on every exit path. Inside a run submissions go out
//! strictly one after another, in the order of a pending snapshot taken once
//! at the start (most recent first). A failing item never stops the loop.
//!
//! [`SyncEngine::stop_sync`] cancels the run's token. The loop checks the
//! token before each item, so no new request is issued after a stop, while a
//! request already in flight completes and its outcome is still applied.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::connectivity::NetworkSignal;
use crate::error::SyncError;
use crate::lifecycle::{merge_server_payload, SubmissionManager};
use crate::local_db_model::{
    FailureKind, Payload, Submission, SubmissionStatus, SyncItemError, SyncProgress, SyncResult,
    SyncStatus,
};
use crate::remote_api::{
    ApiResponse, RemoteApi, RequestOptions, BATCH_SYNC_ENDPOINT, SUBMISSIONS_ENDPOINT,
};

pub type ProgressCallback = Arc<dyn Fn(&SyncProgress) + Send + Sync>;

#[derive(Default)]
struct ProgressRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, ProgressCallback)>>,
}

impl ProgressRegistry {
    fn add(&self, callback: ProgressCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, callback));
        id
    }

    fn remove(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|(listener_id, _)| *listener_id != id);
    }

    fn notify(&self, progress: &SyncProgress) {
        let listeners: Vec<ProgressCallback> = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in listeners {
            if catch_unwind(AssertUnwindSafe(|| callback(progress))).is_err() {
                error!("Error in progress callback, continuing with the remaining subscribers");
            }
        }
    }
}

/// Handle returned by [`SyncEngine::on_progress`].
pub struct ProgressSubscription {
    id: u64,
    registry: Weak<ProgressRegistry>,
}

impl ProgressSubscription {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

struct RunGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// What happened to a record captured through [`SyncEngine::capture_submission`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CaptureOutcome {
    /// Offline: stored in pending for a later sync.
    SavedOffline { submission: Submission },
    /// Accepted by the server immediately.
    Synced { submission: Submission },
    /// The server could not be reached or failed transiently; stored in pending.
    QueuedAfterError { submission: Submission, error: String },
    /// The server rejected the payload; stored in failed.
    Rejected { submission: Submission, error: String },
    /// Local persistence failed.
    NotSaved,
}

#[derive(Debug, Default, Deserialize)]
struct BatchSyncResponse {
    #[serde(default)]
    synced_count: Option<usize>,
    #[serde(default)]
    failed_count: Option<usize>,
    #[serde(default)]
    data: Vec<JsonValue>,
    #[serde(default)]
    errors: Vec<BatchItemError>,
}

#[derive(Debug, Deserialize)]
struct BatchItemError {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    client_ref: Option<String>,
}

enum BatchOutcome {
    Synced(Payload),
    Failed(String),
}

fn server_fields(data: Option<JsonValue>) -> Payload {
    match data {
        Some(JsonValue::Object(fields)) => fields,
        _ => Payload::new(),
    }
}

/// Finds the batch envelope in either the raw body or the unwrapped data.
fn parse_batch_response(response: &ApiResponse) -> BatchSyncResponse {
    for candidate in [response.raw.as_ref(), response.data.as_ref()]
        .into_iter()
        .flatten()
    {
        let looks_like_envelope = candidate.as_object().is_some_and(|body| {
            body.get("data").is_some_and(JsonValue::is_array)
                || body.contains_key("errors")
                || body.contains_key("synced_count")
        });
        if looks_like_envelope {
            match serde_json::from_value(candidate.clone()) {
                Ok(parsed) => return parsed,
                Err(e) => warn!("Unreadable batch sync response: {e}"),
            }
        }
    }
    match &response.data {
        Some(JsonValue::Array(items)) => BatchSyncResponse {
            data: items.clone(),
            ..Default::default()
        },
        _ => BatchSyncResponse::default(),
    }
}

pub struct SyncEngine {
    manager: Arc<SubmissionManager>,
    api: Arc<dyn RemoteApi>,
    network: NetworkSignal,
    config: SyncConfig,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    progress: Arc<ProgressRegistry>,
}

impl SyncEngine {
    pub fn new(
        manager: Arc<SubmissionManager>,
        api: Arc<dyn RemoteApi>,
        network: NetworkSignal,
        config: SyncConfig,
    ) -> Self {
        Self {
            manager,
            api,
            network,
            config,
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            progress: Arc::new(ProgressRegistry::default()),
        }
    }

    pub fn manager(&self) -> &Arc<SubmissionManager> {
        &self.manager
    }

    pub fn network(&self) -> &NetworkSignal {
        &self.network
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Registers a progress listener. Listeners run on the syncing task and
    /// a panicking listener is logged and skipped.
    pub fn on_progress<F>(&self, callback: F) -> ProgressSubscription
    where
        F: Fn(&SyncProgress) + Send + Sync + 'static,
    {
        let id = self.progress.add(Arc::new(callback));
        ProgressSubscription {
            id,
            registry: Arc::downgrade(&self.progress),
        }
    }

    fn notify(&self, progress: &SyncProgress) {
        self.progress.notify(progress);
    }

    fn try_begin_run(&self) -> Option<(RunGuard<'_>, CancellationToken)> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let token = CancellationToken::new();
        *self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token.clone();
        Some((
            RunGuard {
                running: &self.running,
            },
            token,
        ))
    }

    fn already_running() -> SyncResult {
        SyncResult {
            success: false,
            errors: vec![SyncItemError::run_level(SyncError::ConcurrentSync.to_string())],
            ..Default::default()
        }
    }

    /// Stops the active run after its current request. Returns whether a run
    /// was active.
    pub fn stop_sync(&self) -> bool {
        if !self.is_syncing() {
            return false;
        }
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cancel();
        info!("Sync stop requested");
        true
    }

    async fn submit_payload(&self, wire: Payload) -> Result<Payload, SyncError> {
        let request = self.api.request(
            SUBMISSIONS_ENDPOINT,
            RequestOptions::post(JsonValue::Object(wire)),
        );
        let response = match timeout(self.config.request_timeout(), request).await {
            Err(_) => return Err(SyncError::Timeout(self.config.request_timeout_secs)),
            Ok(Err(e)) => return Err(SyncError::Network(e.to_string())),
            Ok(Ok(response)) => response,
        };

        if response.success {
            return Ok(server_fields(response.data));
        }
        if response.is_network_error {
            return Err(SyncError::Network(
                response.error.unwrap_or_else(|| "Network error".to_string()),
            ));
        }
        Err(SyncError::Rejected {
            message: response
                .error
                .unwrap_or_else(|| "Server rejected submission".to_string()),
            status: response.status,
        })
    }

    /// Syncs every pending submission, one request at a time.
    ///
    /// `success` is `synced > 0 || failed == 0`: a run that made progress, or
    /// had nothing to fail on, is a success.
    pub async fn sync_pending_submissions(&self) -> SyncResult {
        let Some((guard, token)) = self.try_begin_run() else {
            warn!("Sync requested while another run is active");
            return Self::already_running();
        };

        let result = self.run_pending(&token).await;

        drop(guard);
        self.notify(&SyncProgress::default());
        result
    }

    async fn run_pending(&self, token: &CancellationToken) -> SyncResult {
        let mut result = SyncResult::default();
        let snapshot = self.manager.get_pending().await;
        if snapshot.is_empty() {
            result.success = true;
            return result;
        }

        info!("Syncing {} pending submissions", snapshot.len());
        let mut progress = SyncProgress {
            total: snapshot.len(),
            ..Default::default()
        };
        self.notify(&progress);

        for (index, submission) in snapshot.iter().enumerate() {
            if token.is_cancelled() {
                info!(
                    "Sync stopped, {} submissions left pending",
                    snapshot.len() - index
                );
                break;
            }

            progress.current_submission = Some(submission.registration_id.clone());
            self.notify(&progress);

            match self.submit_payload(submission.wire_payload()).await {
                Ok(fields) => {
                    if self.manager.move_to_synced(&submission.id, &fields).await {
                        result.synced += 1;
                        progress.synced += 1;
                    } else {
                        let anomaly = SyncError::Anomaly {
                            submission_id: submission.id.clone(),
                        };
                        error!(
                            "Submission {} ({}) vanished from pending after the server accepted it",
                            submission.id, submission.registration_id
                        );
                        result.failed += 1;
                        progress.failed += 1;
                        result
                            .errors
                            .push(SyncItemError::for_submission(submission, anomaly.to_string()));
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    warn!(
                        "Submission {} failed to sync: {message}",
                        submission.registration_id
                    );
                    if !self
                        .manager
                        .move_to_failed(
                            &submission.id,
                            &message,
                            SubmissionStatus::Pending,
                            err.failure_kind(),
                        )
                        .await
                    {
                        error!(
                            "Could not record failure for {}, it was no longer pending",
                            submission.id
                        );
                    }
                    result.failed += 1;
                    progress.failed += 1;
                    result
                        .errors
                        .push(SyncItemError::for_submission(submission, message));
                }
            }

            progress.processed += 1;
            self.notify(&progress);
        }

        if result.synced > 0 {
            self.manager.set_last_sync(Utc::now()).await;
        }
        self.manager.cleanup_old(self.config.retention_days).await;

        result.success = result.synced > 0 || result.failed == 0;
        info!(
            "Sync finished: {} synced, {} failed",
            result.synced, result.failed
        );
        result
    }

    /// Sends every pending submission in one request to the batch endpoint.
    ///
    /// Each payload carries its local id as `client_ref`. Results are matched
    /// by an echoed `client_ref` when the server returns one, and by position
    /// otherwise, which is only correct if the server keeps the submitted
    /// order. Anything left unmatched is marked failed.
    pub async fn sync_batch_submissions(&self) -> SyncResult {
        let Some((guard, _token)) = self.try_begin_run() else {
            warn!("Batch sync requested while another run is active");
            return Self::already_running();
        };

        let result = self.run_batch().await;

        drop(guard);
        self.notify(&SyncProgress::default());
        result
    }

    async fn run_batch(&self) -> SyncResult {
        let mut result = SyncResult::default();
        let snapshot = self.manager.get_pending().await;
        if snapshot.is_empty() {
            result.success = true;
            return result;
        }

        let total = snapshot.len();
        info!("Batch syncing {total} pending submissions");
        self.notify(&SyncProgress {
            total,
            ..Default::default()
        });

        let payloads: Vec<JsonValue> = snapshot
            .iter()
            .map(|submission| {
                let mut wire = submission.wire_payload();
                wire.insert("client_ref".to_string(), json!(submission.id));
                JsonValue::Object(wire)
            })
            .collect();

        let request = self.api.request(
            BATCH_SYNC_ENDPOINT,
            RequestOptions::post(json!({ "submissions": payloads })),
        );
        let failure = match timeout(self.config.request_timeout(), request).await {
            Err(_) => Some(SyncError::Timeout(self.config.request_timeout_secs).to_string()),
            Ok(Err(e)) => Some(e.to_string()),
            Ok(Ok(response)) if !response.success => Some(
                response
                    .error
                    .unwrap_or_else(|| "Batch sync failed".to_string()),
            ),
            Ok(Ok(response)) => {
                self.apply_batch_response(&snapshot, &parse_batch_response(&response), &mut result)
                    .await;
                None
            }
        };

        if let Some(message) = failure {
            warn!("Batch sync failed, {total} submissions stay pending: {message}");
            result.failed = total;
            result.errors.push(SyncItemError::run_level(message));
            return result;
        }

        if result.synced > 0 {
            self.manager.set_last_sync(Utc::now()).await;
        }
        result.success = result.synced > 0;
        info!(
            "Batch sync finished: {} synced, {} failed",
            result.synced, result.failed
        );
        result
    }

    async fn apply_batch_response(
        &self,
        snapshot: &[Submission],
        response: &BatchSyncResponse,
        result: &mut SyncResult,
    ) {
        let by_ref: HashMap<&str, usize> = snapshot
            .iter()
            .enumerate()
            .map(|(index, submission)| (submission.id.as_str(), index))
            .collect();
        let resolve_ref = |client_ref: Option<&str>| client_ref.and_then(|r| by_ref.get(r).copied());

        let mut outcomes: Vec<Option<BatchOutcome>> = snapshot.iter().map(|_| None).collect();

        for item_error in &response.errors {
            let index = resolve_ref(item_error.client_ref.as_deref())
                .or(item_error.index.filter(|i| *i < snapshot.len()));
            match index {
                Some(index) if outcomes[index].is_none() => {
                    let message = item_error
                        .error
                        .clone()
                        .unwrap_or_else(|| "Batch sync error".to_string());
                    outcomes[index] = Some(BatchOutcome::Failed(message));
                }
                Some(index) => warn!("Duplicate batch error for position {index}"),
                None => warn!("Batch error could not be matched to a submission: {item_error:?}"),
            }
        }

        let mut positional = Vec::new();
        for entry in &response.data {
            let fields = server_fields(Some(entry.clone()));
            match resolve_ref(entry.get("client_ref").and_then(JsonValue::as_str)) {
                Some(index) if outcomes[index].is_none() => {
                    outcomes[index] = Some(BatchOutcome::Synced(fields));
                }
                Some(index) => warn!("Batch result for position {index} conflicts with an error"),
                None => positional.push(fields),
            }
        }

        let open_slots: Vec<usize> = (0..snapshot.len())
            .filter(|index| outcomes[*index].is_none())
            .collect();
        if positional.len() > open_slots.len() {
            warn!(
                "Batch response has {} more results than open submissions",
                positional.len() - open_slots.len()
            );
        }
        for (index, fields) in open_slots.into_iter().zip(positional) {
            outcomes[index] = Some(BatchOutcome::Synced(fields));
        }

        for (submission, outcome) in snapshot.iter().zip(outcomes) {
            match outcome {
                Some(BatchOutcome::Synced(mut fields)) => {
                    fields.remove("client_ref");
                    if self.manager.move_to_synced(&submission.id, &fields).await {
                        result.synced += 1;
                    } else {
                        error!(
                            "Submission {} vanished from pending during batch sync",
                            submission.id
                        );
                        result.failed += 1;
                        result.errors.push(SyncItemError::for_submission(
                            submission,
                            "Failed to update local storage",
                        ));
                    }
                }
                Some(BatchOutcome::Failed(message)) => {
                    self.record_batch_failure(submission, &message, result).await;
                }
                None => {
                    let message = SyncError::UnaccountedInBatch.to_string();
                    self.record_batch_failure(submission, &message, result).await;
                }
            }
        }
        debug!("Batch outcomes applied to {} submissions", snapshot.len());

        if let (Some(synced), Some(failed)) = (response.synced_count, response.failed_count) {
            if synced != result.synced || failed != result.failed {
                warn!(
                    "Server reported {synced} synced / {failed} failed, applied {} / {}",
                    result.synced, result.failed
                );
            }
        }
    }

    async fn record_batch_failure(
        &self,
        submission: &Submission,
        message: &str,
        result: &mut SyncResult,
    ) {
        if !self
            .manager
            .move_to_failed(
                &submission.id,
                message,
                SubmissionStatus::Pending,
                FailureKind::Transient,
            )
            .await
        {
            error!(
                "Could not record batch failure for {}, it was no longer pending",
                submission.id
            );
        }
        result.failed += 1;
        result
            .errors
            .push(SyncItemError::for_submission(submission, message));
    }

    /// Moves retryable failed submissions back to pending and syncs.
    ///
    /// Permanent failures (payload rejected by the server) stay in failed
    /// until edited and are counted in `skipped`.
    pub async fn retry_failed_submissions(&self) -> SyncResult {
        let mut result = SyncResult::default();
        let failed = self.manager.get_failed().await;
        if failed.is_empty() {
            result.success = true;
            return result;
        }

        for submission in &failed {
            if submission.failure_kind == Some(FailureKind::Permanent) {
                debug!(
                    "Skipping retry of {}: rejected by the server, needs an edit",
                    submission.registration_id
                );
                result.skipped += 1;
                continue;
            }
            if self.manager.requeue_failed(&submission.id).await.is_none() {
                result.errors.push(SyncItemError::for_submission(
                    submission,
                    "Failed to retry: could not move back to pending",
                ));
            }
        }
        if result.skipped > 0 {
            warn!(
                "{} failed submissions need edits before they can be retried",
                result.skipped
            );
        }

        let sync = self.sync_pending_submissions().await;
        result.synced = sync.synced;
        result.failed = sync.failed;
        result.errors.extend(sync.errors);
        result.success = sync.success;
        result
    }

    pub async fn get_sync_status(&self) -> SyncStatus {
        let stats = self.manager.get_stats().await;
        SyncStatus {
            pending: stats.pending,
            synced: stats.synced,
            failed: stats.failed,
            last_sync: self.manager.last_sync().await,
            is_syncing: self.is_syncing(),
            is_online: self.network.is_online(),
        }
    }

    /// Syncs if online and something is pending. Without `force`, does
    /// nothing while a run is active; with `force` the call still goes
    /// through the single-run guard. Returns `None` when no sync was attempted.
    pub async fn auto_sync(&self, force: bool) -> Option<SyncResult> {
        if !self.network.is_online() {
            debug!("Auto-sync skipped: offline");
            return None;
        }
        if self.is_syncing() && !force {
            debug!("Auto-sync skipped: a run is already active");
            return None;
        }
        let stats = self.manager.get_stats().await;
        if stats.pending == 0 {
            return None;
        }
        info!("Auto-syncing {} pending submissions...", stats.pending);
        Some(self.sync_pending_submissions().await)
    }

    /// Stores a freshly captured record, sending it straight to the server
    /// when online.
    pub async fn capture_submission(&self, payload: Payload) -> CaptureOutcome {
        if !self.network.is_online() {
            return match self.manager.add_pending(payload).await {
                Some(submission) => CaptureOutcome::SavedOffline { submission },
                None => CaptureOutcome::NotSaved,
            };
        }

        let mut payload = payload;
        let has_registration_id = payload
            .get("registration_id")
            .and_then(JsonValue::as_str)
            .is_some_and(|id| !id.trim().is_empty());
        if !has_registration_id {
            payload.insert(
                "registration_id".to_string(),
                json!(crate::identifiers::generate_registration_id()),
            );
        }
        let wire = Submission::strip_local_fields(payload.clone());

        match self.submit_payload(wire).await {
            Ok(fields) => {
                merge_server_payload(&mut payload, &fields);
                match self.manager.add_synced(payload).await {
                    Some(submission) => {
                        self.manager.set_last_sync(Utc::now()).await;
                        CaptureOutcome::Synced { submission }
                    }
                    None => CaptureOutcome::NotSaved,
                }
            }
            Err(err) if err.failure_kind() == FailureKind::Permanent => {
                let error = err.to_string();
                match self
                    .manager
                    .add_failed(payload, error.clone(), FailureKind::Permanent)
                    .await
                {
                    Some(submission) => CaptureOutcome::Rejected { submission, error },
                    None => CaptureOutcome::NotSaved,
                }
            }
            Err(err) => {
                let error = err.to_string();
                warn!("Direct submit failed, queueing for later sync: {error}");
                match self.manager.add_pending(payload).await {
                    Some(submission) => CaptureOutcome::QueuedAfterError { submission, error },
                    None => CaptureOutcome::NotSaved,
                }
            }
        }
    }
}

/// Runs `auto_sync(false)` on every periodic tick and every offline→online
/// transition until `shutdown` fires.
pub fn spawn_auto_sync(engine: Arc<SyncEngine>, shutdown: CancellationToken) -> JoinHandle<()> {
    let mut online_rx = engine.network().subscribe();
    let mut ticker = tokio::time::interval(engine.config().auto_sync_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
        let mut was_online = *online_rx.borrow_and_update();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    engine.auto_sync(false).await;
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    if online && !was_online {
                        info!("Connectivity restored, triggering auto-sync");
                        engine.auto_sync(false).await;
                    }
                    was_online = online;
                }
            }
        }
        debug!("Auto-sync loop stopped");
    })
}
