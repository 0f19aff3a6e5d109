//! # Submission Sync Core
//!
//! Offline submission queue and synchronization engine for the livestock
//! registration app. Field agents capture farmer/livestock records without
//! connectivity; this crate keeps them durably on the device (LMDB) and
//! drains them to the registration server once the network is back.
//!
//! ## Features
//!
//! - **Three partitions**: every record lives in exactly one of `pending`,
//!   `synced` or `failed`, each capped with oldest-first eviction
//! - **Single sync run**: concurrent sync requests are rejected, never queued
//! - **Sequential and batch sync**, retry of retryable failures, progress events
//! - **Auto-sync** on a periodic tick and when connectivity comes back
//! - **FFI-ready**: C functions returning JSON [`AppResponse`] strings for
//!   the mobile UI
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::ffi::CString;
//! use submission_sync_core::{create_sync_core, add_pending_submission, sync_pending, free_c_string};
//!
//! let name = CString::new("registrations").unwrap();
//! let core = create_sync_core(name.as_ptr(), std::ptr::null());
//!
//! let record = CString::new(r#"{"farmer_name":"Amina Bello","lga":"Dutse"}"#).unwrap();
//! let response = add_pending_submission(core, record.as_ptr());
//! free_c_string(response as *mut _);
//!
//! let response = sync_pending(core);
//! free_c_string(response as *mut _);
//! ```
//!
//! ## FFI Functions
//!
//! - [`create_sync_core`] / [`close_sync_core`] - lifecycle of a core handle
//! - [`add_pending_submission`], [`capture_submission`] - store new records
//! - [`sync_pending`], [`sync_batch`], [`retry_failed`], [`auto_sync`], [`stop_sync`]
//! - [`set_online`], [`set_auth_token`], [`test_connection`]
//! - [`get_sync_status`], [`get_stats`], [`get_all_submissions`], [`get_submission`],
//!   [`search_submissions`]
//! - [`cleanup_old_submissions`], [`clear_all_submissions`], [`export_data`], [`import_data`]
//! - [`generate_farmer_id`], [`register_progress_callback`], [`free_c_string`]

pub mod app_response;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod identifiers;
pub mod kv_store;
pub mod lifecycle;
pub mod local_db_model;
pub mod local_db_state;
pub mod remote_api;
pub mod submission_store;
pub mod sync_engine;

pub use crate::app_response::AppResponse;
pub use crate::config::{SyncConfig, MAX_RETENTION_DAYS};
pub use crate::connectivity::NetworkSignal;
pub use crate::error::{ApiError, StorageError, SyncError};
pub use crate::kv_store::{KeyValueStore, MemoryStore};
pub use crate::lifecycle::{PartitionCaps, SubmissionManager};
pub use crate::local_db_model::{
    FailureKind, Payload, Submission, SubmissionStats, SubmissionStatus, SyncProgress, SyncResult,
    SyncStatus,
};
pub use crate::local_db_state::AppDbState;
pub use crate::remote_api::{ApiResponse, HttpApiClient, RemoteApi, RequestOptions};
pub use crate::submission_store::SubmissionStore;
pub use crate::sync_engine::{spawn_auto_sync, CaptureOutcome, ProgressSubscription, SyncEngine};

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use serde_json::Value as JsonValue;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

/// Everything one open database needs: the runtime the async engine runs
/// on, the engine itself and the handles the FFI functions poke at.
pub struct SyncCore {
    runtime: Runtime,
    engine: Arc<SyncEngine>,
    api: Arc<HttpApiClient>,
    db: Arc<AppDbState>,
    auto_sync_shutdown: CancellationToken,
    progress_subscription: Mutex<Option<ProgressSubscription>>,
}

/// C callback receiving a JSON-encoded [`SyncProgress`]. The string is only
/// valid for the duration of the call.
pub type ProgressCallbackFn = extern "C" fn(*const c_char);

impl SyncCore {
    /// Opens `<name>.lmdb`, wires the engine to an HTTP client and starts the
    /// auto-sync loop.
    pub fn open(name: &str, config: SyncConfig) -> Result<Self, AppResponse> {
        config.validate().map_err(AppResponse::ValidationError)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| AppResponse::DatabaseError(format!("Failed to start runtime: {e}")))?;

        let db = Arc::new(AppDbState::init_with_map_size(name, config.lmdb_map_size)?);
        let store = SubmissionStore::new(
            Arc::clone(&db) as Arc<dyn KeyValueStore>,
            config.key_prefix.clone(),
        );
        let manager = Arc::new(SubmissionManager::new(store, PartitionCaps::from(&config)));
        let api = Arc::new(
            HttpApiClient::new(config.api_base_url.clone(), config.request_timeout())
                .map_err(|e| AppResponse::BadRequest(e.to_string()))?,
        );
        let engine = Arc::new(SyncEngine::new(
            manager,
            Arc::clone(&api) as Arc<dyn RemoteApi>,
            NetworkSignal::default(),
            config,
        ));

        let auto_sync_shutdown = CancellationToken::new();
        {
            let _enter = runtime.enter();
            spawn_auto_sync(Arc::clone(&engine), auto_sync_shutdown.clone());
        }

        info!("Sync core ready at {}", db.path().display());
        Ok(Self {
            runtime,
            engine,
            api,
            db,
            auto_sync_shutdown,
            progress_subscription: Mutex::new(None),
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Stops the auto-sync loop and flushes LMDB.
    pub fn close(self) -> Result<(), StorageError> {
        self.auto_sync_shutdown.cancel();
        self.engine.stop_sync();
        let flushed = self.db.flush();
        self.runtime
            .shutdown_timeout(self.engine.config().request_timeout());
        flushed
    }
}

/// Creates a sync core for the database `db_name`.
///
/// # Parameters
///
/// * `db_name` - A null-terminated C string with the database path, without
///   the `.lmdb` suffix
/// * `config_json` - An optional null-terminated JSON [`SyncConfig`]; missing
///   fields take their defaults. Null reads the configuration from `SYNC_*`
///   environment variables instead.
///
/// # Returns
///
/// Returns a pointer to a new [`SyncCore`] on success, or a null pointer on
/// failure. Release the handle with [`close_sync_core`] exactly once.
///
/// # Safety
///
/// Both pointers must be null or point to null-terminated strings that stay
/// valid for the duration of the call. The returned handle must not be used
/// after it has been passed to [`close_sync_core`].
///
/// # Errors
///
/// Returns a null pointer if:
/// - `db_name` is null or not valid UTF-8
/// - `config_json` is not valid UTF-8, not a valid configuration, or fails
///   validation
/// - The database or the runtime cannot be created
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_sync_core(
    db_name: *const c_char,
    config_json: *const c_char,
) -> *mut SyncCore {
    let name = match ptr_to_str(db_name) {
        Some(name) => name,
        None => {
            warn!("Null or invalid db_name passed to create_sync_core");
            return std::ptr::null_mut();
        }
    };

    let config = if config_json.is_null() {
        SyncConfig::from_env()
    } else {
        let Some(json) = ptr_to_str(config_json) else {
            warn!("Invalid UTF-8 in config_json");
            return std::ptr::null_mut();
        };
        match SyncConfig::from_json(&json) {
            Ok(config) => config,
            Err(e) => {
                warn!("Invalid sync configuration: {e}");
                return std::ptr::null_mut();
            }
        }
    };

    match SyncCore::open(&name, config) {
        Ok(core) => Box::into_raw(Box::new(core)),
        Err(e) => {
            error!("Failed to create sync core: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Stores a new record in the pending partition. `json_ptr` is the payload
/// object; a `registration_id` is generated unless it carries one.
#[no_mangle]
pub extern "C" fn add_pending_submission(
    core: *mut SyncCore,
    json_ptr: *const c_char,
) -> *const c_char {
    with_core(core, |core| {
        let payload = match c_ptr_to_payload(json_ptr) {
            Ok(payload) => payload,
            Err(response) => return response,
        };
        match core
            .runtime
            .block_on(core.engine.manager().add_pending(payload))
        {
            Some(submission) => AppResponse::json(&submission),
            None => AppResponse::DatabaseError("Failed to save submission".to_string()),
        }
    })
}

/// Saves a freshly captured record, sending it straight away when online.
#[no_mangle]
pub extern "C" fn capture_submission(
    core: *mut SyncCore,
    json_ptr: *const c_char,
) -> *const c_char {
    with_core(core, |core| {
        let payload = match c_ptr_to_payload(json_ptr) {
            Ok(payload) => payload,
            Err(response) => return response,
        };
        match core
            .runtime
            .block_on(core.engine.capture_submission(payload))
        {
            CaptureOutcome::NotSaved => {
                AppResponse::DatabaseError("Failed to save submission".to_string())
            }
            outcome => AppResponse::json(&outcome),
        }
    })
}

#[no_mangle]
pub extern "C" fn sync_pending(core: *mut SyncCore) -> *const c_char {
    with_core(core, |core| {
        AppResponse::json(&core.runtime.block_on(core.engine.sync_pending_submissions()))
    })
}

#[no_mangle]
pub extern "C" fn sync_batch(core: *mut SyncCore) -> *const c_char {
    with_core(core, |core| {
        AppResponse::json(&core.runtime.block_on(core.engine.sync_batch_submissions()))
    })
}

#[no_mangle]
pub extern "C" fn retry_failed(core: *mut SyncCore) -> *const c_char {
    with_core(core, |core| {
        AppResponse::json(&core.runtime.block_on(core.engine.retry_failed_submissions()))
    })
}

/// `Ok("null")` when no sync was attempted (offline, nothing pending, busy).
#[no_mangle]
pub extern "C" fn auto_sync(core: *mut SyncCore, force: bool) -> *const c_char {
    with_core(core, |core| {
        AppResponse::json(&core.runtime.block_on(core.engine.auto_sync(force)))
    })
}

#[no_mangle]
pub extern "C" fn stop_sync(core: *mut SyncCore) -> *const c_char {
    with_core(core, |core| AppResponse::json(&core.engine.stop_sync()))
}

#[no_mangle]
pub extern "C" fn set_online(core: *mut SyncCore, online: bool) -> *const c_char {
    with_core(core, |core| {
        AppResponse::json(&core.engine.network().set_online(online))
    })
}

/// A null or empty token clears the current one.
#[no_mangle]
pub extern "C" fn set_auth_token(core: *mut SyncCore, token: *const c_char) -> *const c_char {
    with_core(core, |core| {
        let token = if token.is_null() {
            None
        } else {
            match c_ptr_to_string(token, "token") {
                Ok(token) => Some(token),
                Err(response) => return response,
            }
        };
        core.api.set_auth_token(token);
        AppResponse::success("Auth token updated")
    })
}

#[no_mangle]
pub extern "C" fn test_connection(core: *mut SyncCore) -> *const c_char {
    with_core(core, |core| {
        AppResponse::json(&core.runtime.block_on(core.api.test_connection()))
    })
}

#[no_mangle]
pub extern "C" fn get_sync_status(core: *mut SyncCore) -> *const c_char {
    with_core(core, |core| {
        AppResponse::json(&core.runtime.block_on(core.engine.get_sync_status()))
    })
}

#[no_mangle]
pub extern "C" fn get_stats(core: *mut SyncCore) -> *const c_char {
    with_core(core, |core| {
        AppResponse::json(&core.runtime.block_on(core.engine.manager().get_stats()))
    })
}

#[no_mangle]
pub extern "C" fn get_all_submissions(core: *mut SyncCore) -> *const c_char {
    with_core(core, |core| {
        AppResponse::json(
            &core
                .runtime
                .block_on(core.engine.manager().get_all_submissions()),
        )
    })
}

/// Looks a record up by its local id in any partition. `NotFound` when no
/// record carries that id.
#[no_mangle]
pub extern "C" fn get_submission(core: *mut SyncCore, id: *const c_char) -> *const c_char {
    with_core(core, |core| {
        let id = match c_ptr_to_string(id, "id") {
            Ok(id) => id,
            Err(response) => return response,
        };
        match core.runtime.block_on(core.engine.manager().find(&id)) {
            Some(submission) => AppResponse::json(&submission),
            None => AppResponse::NotFound(format!("No submission with id '{id}'")),
        }
    })
}

#[no_mangle]
pub extern "C" fn search_submissions(core: *mut SyncCore, query: *const c_char) -> *const c_char {
    with_core(core, |core| {
        let query = match c_ptr_to_string(query, "query") {
            Ok(query) => query,
            Err(response) => return response,
        };
        AppResponse::json(&core.runtime.block_on(core.engine.manager().search(&query)))
    })
}

/// Evicts pending and failed records older than `max_age_days`. Returns the
/// number removed. Ages outside `0..=MAX_RETENTION_DAYS` are rejected.
#[no_mangle]
pub extern "C" fn cleanup_old_submissions(core: *mut SyncCore, max_age_days: i64) -> *const c_char {
    with_core(core, |core| {
        if max_age_days < 0 {
            return AppResponse::BadRequest("max_age_days must not be negative".to_string());
        }
        if max_age_days > MAX_RETENTION_DAYS {
            return AppResponse::BadRequest(format!(
                "max_age_days must not exceed {MAX_RETENTION_DAYS}"
            ));
        }
        AppResponse::json(
            &core
                .runtime
                .block_on(core.engine.manager().cleanup_old(max_age_days)),
        )
    })
}

#[no_mangle]
pub extern "C" fn clear_all_submissions(core: *mut SyncCore) -> *const c_char {
    with_core(core, |core| {
        if core.runtime.block_on(core.engine.manager().clear_all()) {
            AppResponse::success("All submission data cleared")
        } else {
            AppResponse::DatabaseError("Failed to clear submission data".to_string())
        }
    })
}

#[no_mangle]
pub extern "C" fn export_data(core: *mut SyncCore) -> *const c_char {
    with_core(core, |core| {
        AppResponse::Ok(core.runtime.block_on(core.engine.manager().export_data()))
    })
}

#[no_mangle]
pub extern "C" fn import_data(core: *mut SyncCore, json_ptr: *const c_char) -> *const c_char {
    with_core(core, |core| {
        let json = match c_ptr_to_string(json_ptr, "JSON") {
            Ok(json) => json,
            Err(response) => return response,
        };
        if core.runtime.block_on(core.engine.manager().import_data(&json)) {
            AppResponse::success("Data imported")
        } else {
            AppResponse::BadRequest("Import data could not be applied".to_string())
        }
    })
}

/// Allocates the next farmer ID, e.g. `DUT/CHA/07/001`.
#[no_mangle]
pub extern "C" fn generate_farmer_id(
    core: *mut SyncCore,
    agent_serial: u32,
    lga: *const c_char,
    ward: *const c_char,
) -> *const c_char {
    with_core(core, |core| {
        let (lga, ward) = match (c_ptr_to_string(lga, "lga"), c_ptr_to_string(ward, "ward")) {
            (Ok(lga), Ok(ward)) => (lga, ward),
            (Err(response), _) | (_, Err(response)) => return response,
        };
        if lga.trim().is_empty() || ward.trim().is_empty() {
            return AppResponse::ValidationError("LGA and ward are required".to_string());
        }
        match core.runtime.block_on(
            core.engine
                .manager()
                .next_farmer_id(agent_serial, &lga, &ward),
        ) {
            Some(farmer_id) => AppResponse::Ok(farmer_id),
            None => AppResponse::DatabaseError("Failed to generate farmer ID".to_string()),
        }
    })
}

/// Installs the progress callback, replacing any previous one. `None`
/// (a null function pointer) removes it.
#[no_mangle]
pub extern "C" fn register_progress_callback(
    core: *mut SyncCore,
    callback: Option<ProgressCallbackFn>,
) -> *const c_char {
    with_core(core, |core| {
        let mut slot = core
            .progress_subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.take() {
            previous.unsubscribe();
        }
        let Some(callback) = callback else {
            return AppResponse::success("Progress callback removed");
        };
        *slot = Some(core.engine.on_progress(move |progress| {
            let json = match serde_json::to_string(progress) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Error serializing progress: {e}");
                    return;
                }
            };
            if let Ok(c_json) = CString::new(json) {
                callback(c_json.as_ptr());
            }
        }));
        AppResponse::success("Progress callback registered")
    })
}

/// Stops background work, flushes the database and frees the handle.
///
/// # Parameters
///
/// * `core` - Pointer returned by [`create_sync_core`]
///
/// # Returns
///
/// Returns a JSON-formatted C string: `Ok` when the core was closed,
/// `BadRequest` for a null pointer, or `DatabaseError` if the final flush
/// fails. The handle is freed in every non-null case. The returned string
/// must be freed with [`free_c_string`].
///
/// # Safety
///
/// `core` must be null or a handle from [`create_sync_core`] that has not
/// been closed yet. It is dangling once this function returns and must not
/// be passed to any other function of this library.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn close_sync_core(core: *mut SyncCore) -> *const c_char {
    if core.is_null() {
        let error = AppResponse::BadRequest("Null sync core pointer".to_string());
        return response_to_c_string(&error);
    }
    let core = unsafe { Box::from_raw(core) };
    match core.close() {
        Ok(()) => {
            info!("Sync core closed");
            response_to_c_string(&AppResponse::success("Sync core closed"))
        }
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Frees a string returned by any function of this library.
///
/// # Parameters
///
/// * `ptr` - A string returned by one of this library's functions, or null
///
/// # Returns
///
/// Nothing. A null pointer is ignored.
///
/// # Safety
///
/// `ptr` must come from this library and must be freed only once. Strings
/// allocated elsewhere, or already freed, must never be passed here.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn free_c_string(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(ptr));
    }
}

#[allow(clippy::not_unsafe_ptr_arg_deref)]
fn with_core<F>(core: *mut SyncCore, f: F) -> *const c_char
where
    F: FnOnce(&SyncCore) -> AppResponse,
{
    if core.is_null() {
        let error = AppResponse::BadRequest("Null sync core pointer".to_string());
        return response_to_c_string(&error);
    }
    let core = unsafe { &*core };
    response_to_c_string(&f(core))
}

fn ptr_to_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .ok()
        .map(str::to_string)
}

fn c_ptr_to_payload(ptr: *const c_char) -> Result<Payload, AppResponse> {
    let json = c_ptr_to_string(ptr, "JSON")?;
    match serde_json::from_str::<JsonValue>(&json)? {
        JsonValue::Object(payload) => Ok(payload),
        _ => Err(AppResponse::ValidationError(
            "Submission must be a JSON object".to_string(),
        )),
    }
}

/// Serializes a response into a newly allocated C string. Null if
/// serialization fails.
fn response_to_c_string(response: &AppResponse) -> *const c_char {
    let json = match serde_json::to_string(response) {
        Ok(j) => j,
        Err(e) => {
            warn!("Error serializing response: {e}");
            return std::ptr::null();
        }
    };

    match CString::new(json) {
        Ok(c_str) => c_str.into_raw(),
        Err(e) => {
            warn!("Error creating CString: {e}");
            std::ptr::null()
        }
    }
}

fn c_ptr_to_string(ptr: *const c_char, field_name: &str) -> Result<String, AppResponse> {
    if ptr.is_null() {
        return Err(AppResponse::BadRequest(format!("Null {field_name} pointer")));
    }

    match unsafe { CStr::from_ptr(ptr).to_str() } {
        Ok(s) => Ok(s.to_string()),
        Err(e) => Err(AppResponse::BadRequest(format!(
            "Invalid UTF-8 in {field_name}: {e}"
        ))),
    }
}
