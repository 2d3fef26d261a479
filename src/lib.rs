//! # Run Tracker
//!
//! Delivery-run tracking and telemetry for courier apps.
//!
//! This library provides:
//! - Run lifecycle (Active → Completed) with at most one active run per courier
//! - A per-run checkpoint pipeline fed by a position source
//! - Crash/relaunch recovery of runs left Active in storage
//! - Haversine distance over the checkpoint polyline
//! - Vehicle odometer reconciliation through an idempotent ledger
//!
//! ## Features
//!
//! - **`persistence`** - SQLite-backed run and vehicle stores (default)
//! - **`synthetic`** - Simulated position source for demos and soak tests
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use run_tracker::{ManualPositionSource, MemoryStore, RunController, TrackerConfig, Vehicle};
//!
//! # async fn demo() -> run_tracker::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! store.insert_vehicle(Vehicle::new("M1", 0.0));
//! let positions = Arc::new(ManualPositionSource::new(64));
//!
//! let controller = RunController::new(
//!     store.clone(),
//!     store.clone(),
//!     positions.clone(),
//!     TrackerConfig::default(),
//! );
//!
//! let run_id = controller
//!     .start("D1", "M1", vec!["O1".into()], "U1")
//!     .await?;
//! positions.push("D1", 51.5074, -0.1278, 0);
//! positions.push("D1", 51.5084, -0.1278, 5_000);
//!
//! let meters = controller.end("D1").await?;
//! println!("run {} covered {:.0} m", run_id, meters);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, TrackerError};

// Geographic utilities (haversine, polyline length)
pub mod geo_utils;
pub use geo_utils::{haversine_distance, polyline_length, run_distance};

// Backoff policy for checkpoint writes
pub mod retry;
pub use retry::RetryPolicy;

// Position source adapters and sampling policy
pub mod position;
pub use position::{
    ManualPositionSource, PositionSource, PositionSubscription, SamplingFilter, SamplingPolicy,
    SubscriptionGuard,
};

// Simulated GPS feed
#[cfg(feature = "synthetic")]
pub mod synthetic;
#[cfg(feature = "synthetic")]
pub use synthetic::{SyntheticPositionSource, SyntheticRoute};

// Run and vehicle store adapters
pub mod store;
pub use store::{MemoryStore, RunStore, VehicleStore};

// SQLite-backed stores
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteStore;

// Odometer reconciliation
pub mod odometer;
pub use odometer::{OdometerSync, OdometerUpdate};

// Single-writer checkpoint pipeline
mod writer;

// Run lifecycle orchestration
pub mod controller;
pub use controller::{RunController, TrackingStatus};

// Reattaching runs after interruption
pub mod recovery;
pub use recovery::{RecoveryManager, RecoveryReport};

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("RunTracker"),
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
pub(crate) fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// Opaque run identifier (UUID v4 string).
pub type RunId = String;

/// Current time as unix milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use run_tracker::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A single timestamped position sample recorded during an Active run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

impl Checkpoint {
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
        }
    }

    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Completed,
}

impl RunStatus {
    /// Stable storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Active => "active",
            RunStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(RunStatus::Active),
            "completed" => Some(RunStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One courier delivery trip.
///
/// `end_time` and `total_distance_meters` are set together, exactly once,
/// when the run moves to [`RunStatus::Completed`]. A completed run is immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub courier_id: String,
    pub vehicle_id: String,
    pub origin_unit_id: String,
    pub order_ids: Vec<String>,
    /// Unix timestamp in milliseconds
    pub start_time: i64,
    /// Unix timestamp in milliseconds, set at completion
    pub end_time: Option<i64>,
    /// Polyline length in meters, set at completion
    pub total_distance_meters: Option<f64>,
    pub status: RunStatus,
    /// Append-only, ordered by non-decreasing timestamp
    pub checkpoints: Vec<Checkpoint>,
}

impl Run {
    pub fn is_active(&self) -> bool {
        self.status == RunStatus::Active
    }

    /// Elapsed time of a completed run in milliseconds.
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time.map(|end| end - self.start_time)
    }

    /// Timestamp of the most recent checkpoint.
    pub fn last_checkpoint_time(&self) -> Option<i64> {
        self.checkpoints.last().map(|c| c.timestamp)
    }
}

/// Creation payload for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRun {
    pub courier_id: String,
    pub vehicle_id: String,
    pub origin_unit_id: String,
    pub order_ids: Vec<String>,
    pub start_time: i64,
}

impl NewRun {
    /// Materialize an Active run with a fresh id and no checkpoints.
    pub fn into_run(self) -> Run {
        Run {
            id: uuid::Uuid::new_v4().to_string(),
            courier_id: self.courier_id,
            vehicle_id: self.vehicle_id,
            origin_unit_id: self.origin_unit_id,
            order_ids: self.order_ids,
            start_time: self.start_time,
            end_time: None,
            total_distance_meters: None,
            status: RunStatus::Active,
            checkpoints: Vec::new(),
        }
    }
}

/// Vehicle with its cumulative odometer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: String,
    pub cumulative_distance_km: f64,
}

impl Vehicle {
    pub fn new(id: &str, cumulative_distance_km: f64) -> Self {
        Self {
            id: id.to_string(),
            cumulative_distance_km,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for run tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Sampling policy handed to the position source on subscribe.
    pub sampling: SamplingPolicy,

    /// Retry policy for individual checkpoint appends.
    pub checkpoint_retry: RetryPolicy,

    /// Buffered samples between position source and checkpoint writer.
    /// Default: 64
    pub channel_capacity: usize,

    /// How long End waits for buffered samples to be written before
    /// aborting the writer. Default: 5000 ms
    pub drain_timeout_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingPolicy::default(),
            checkpoint_retry: RetryPolicy::default(),
            channel_capacity: 64,
            drain_timeout_ms: 5_000,
        }
    }
}

impl TrackerConfig {
    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TrackerConfig =
            serde_json::from_str(json).map_err(|e| TrackerError::InvalidConfig {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(TrackerError::InvalidConfig {
                message: message.to_string(),
            })
        };
        if !self.sampling.min_distance_meters.is_finite() || self.sampling.min_distance_meters < 0.0
        {
            return invalid("sampling.min_distance_meters must be a non-negative number");
        }
        if self.channel_capacity == 0 {
            return invalid("channel_capacity must be at least 1");
        }
        if self.checkpoint_retry.max_attempts == 0 {
            return invalid("checkpoint_retry.max_attempts must be at least 1");
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
