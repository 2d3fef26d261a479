//! FFI bindings for mobile platforms (iOS/Android).
//!
//! One process-level tracker handle owns the SQLite store, a push-driven
//! position source fed by the platform location listener, and the run
//! controller. Lifecycle calls block on the handle's runtime; checkpoint
//! writers keep running on it between calls.
//!
//! Errors are logged and surfaced as `None`/`false`.

use std::sync::{Arc, Mutex, PoisonError};

use log::{info, warn};
use once_cell::sync::Lazy;

use crate::persistence::SqliteStore;
use crate::position::ManualPositionSource;
use crate::store::VehicleStore;
use crate::{init_logging, RecoveryManager, RunController, TrackerConfig, Vehicle};

struct Tracker {
    runtime: tokio::runtime::Runtime,
    store: Arc<SqliteStore>,
    positions: Arc<ManualPositionSource>,
    controller: Arc<RunController>,
    recovery: RecoveryManager,
}

/// Global tracker instance.
static TRACKER: Lazy<Mutex<Option<Arc<Tracker>>>> = Lazy::new(|| Mutex::new(None));

/// Run `f` against the tracker without holding the global lock.
fn with_tracker<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Tracker) -> R,
{
    let tracker = TRACKER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    match tracker {
        Some(tracker) => Some(f(&tracker)),
        None => {
            warn!("[RunTrackerFfi] Tracker not initialized");
            None
        }
    }
}

fn build_tracker(db_path: &str, config_json: &str) -> crate::Result<Tracker> {
    let config = if config_json.trim().is_empty() {
        TrackerConfig::default()
    } else {
        TrackerConfig::from_json(config_json)?
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("run-tracker")
        .enable_all()
        .build()
        .map_err(|e| crate::TrackerError::Internal {
            message: format!("failed to start runtime: {}", e),
        })?;

    let store = Arc::new(SqliteStore::new(db_path)?);
    let positions = Arc::new(ManualPositionSource::new(config.channel_capacity));
    let controller = Arc::new(RunController::new(
        store.clone(),
        store.clone(),
        positions.clone(),
        config,
    ));

    Ok(Tracker {
        runtime,
        store,
        positions,
        recovery: RecoveryManager::new(controller.clone()),
        controller,
    })
}

/// Initialize the tracker with a database path and optional JSON config.
/// Call once at app startup, then resume any courier shown as in delivery.
#[uniffi::export]
pub fn tracker_init(db_path: String, config_json: String) -> bool {
    init_logging();
    info!("[RunTrackerFfi] Initializing with db: {}", db_path);

    match build_tracker(&db_path, &config_json) {
        Ok(tracker) => {
            *TRACKER.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(tracker));
            info!("[RunTrackerFfi] Initialized successfully");
            true
        }
        Err(e) => {
            warn!("[RunTrackerFfi] Failed to initialize: {}", e);
            false
        }
    }
}

/// Make a vehicle known to the odometer. An existing reading is kept.
#[uniffi::export]
pub fn tracker_register_vehicle(vehicle_id: String, cumulative_distance_km: f64) -> bool {
    with_tracker(|t| {
        let result = match t.store.get_vehicle(&vehicle_id) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => t
                .store
                .put_vehicle(&Vehicle::new(&vehicle_id, cumulative_distance_km)),
            Err(e) => Err(e),
        };
        result
            .map_err(|e| warn!("[RunTrackerFfi] register_vehicle {}: {}", vehicle_id, e))
            .is_ok()
    })
    .unwrap_or(false)
}

/// Start a run. Returns the run id.
#[uniffi::export]
pub fn tracker_start_run(
    courier_id: String,
    vehicle_id: String,
    order_ids: Vec<String>,
    origin_unit_id: String,
) -> Option<String> {
    with_tracker(|t| {
        t.runtime
            .block_on(
                t.controller
                    .start(&courier_id, &vehicle_id, order_ids, &origin_unit_id),
            )
            .map_err(|e| warn!("[RunTrackerFfi] start_run {}: {}", courier_id, e))
            .ok()
    })
    .flatten()
}

/// Forward a platform location update. Returns true if it was accepted.
#[uniffi::export]
pub fn tracker_push_position(courier_id: String, latitude: f64, longitude: f64, timestamp_ms: i64) -> bool {
    with_tracker(|t| t.positions.push(&courier_id, latitude, longitude, timestamp_ms)).unwrap_or(false)
}

/// End the courier's run. Returns the distance in meters.
#[uniffi::export]
pub fn tracker_end_run(courier_id: String) -> Option<f64> {
    with_tracker(|t| {
        t.runtime
            .block_on(t.controller.end(&courier_id))
            .map_err(|e| warn!("[RunTrackerFfi] end_run {}: {}", courier_id, e))
            .ok()
    })
    .flatten()
}

/// Reattach the courier's persisted Active run. Returns its id, or None if
/// there was nothing to resume.
#[uniffi::export]
pub fn tracker_resume_run(courier_id: String) -> Option<String> {
    with_tracker(|t| {
        t.runtime
            .block_on(t.recovery.resume(&courier_id))
            .map_err(|e| warn!("[RunTrackerFfi] resume_run {}: {}", courier_id, e))
            .ok()
            .flatten()
    })
    .flatten()
}

#[uniffi::export]
pub fn tracker_is_tracking(courier_id: String) -> bool {
    with_tracker(|t| t.controller.is_tracking(&courier_id)).unwrap_or(false)
}
