//! Unified error handling for the run-tracker library.
//!
//! Lifecycle operations (start, end, resume) surface these values to the caller.
//! Checkpoint-level failures are absorbed by the writer task and only logged.

use thiserror::Error;

use crate::RunId;

/// Unified error type for run-tracker operations.
#[derive(Debug, Clone, Error)]
pub enum TrackerError {
    /// The position source could not be opened (no location authorization)
    #[error("Location permission denied: {message}")]
    PermissionDenied { message: String },

    /// Start or resume while a subscription (or persisted Active run) already exists
    #[error("Courier '{courier_id}' already has an active run{}", run_suffix(.run_id))]
    AlreadyActive {
        courier_id: String,
        run_id: Option<RunId>,
    },

    /// End called without a live subscription for the courier
    #[error("Courier '{courier_id}' has no live run subscription")]
    NoActiveRun { courier_id: String },

    /// Recovery found no Active run for a courier believed to be in delivery
    #[error("No active run found for courier '{courier_id}'")]
    RunNotFound { courier_id: String },

    /// Lookup by run id found nothing
    #[error("Run '{run_id}' does not exist")]
    UnknownRun { run_id: RunId },

    /// Write attempted against a run that is already Completed
    #[error("Run '{run_id}' is already completed")]
    RunAlreadyCompleted { run_id: RunId },

    /// More than one Active run persisted for the same courier
    #[error("Courier '{courier_id}' has {} active runs: {}", .run_ids.len(), .run_ids.join(", "))]
    DuplicateActiveRuns {
        courier_id: String,
        run_ids: Vec<RunId>,
    },

    /// Transient storage write failure
    #[error("Store write failed: {message}")]
    StoreWriteFailure { message: String },

    /// Storage read/query failure
    #[error("Store read failed: {message}")]
    StoreReadFailure { message: String },

    /// Odometer update targeted an unregistered vehicle
    #[error("Vehicle '{vehicle_id}' does not exist")]
    VehicleNotFound { vehicle_id: String },

    /// Sample rejected at ingestion
    #[error("Invalid checkpoint: {message}")]
    InvalidCheckpoint { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    InvalidConfig { message: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn run_suffix(run_id: &Option<RunId>) -> String {
    match run_id {
        Some(id) => format!(" ({})", id),
        None => String::new(),
    }
}

impl TrackerError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TrackerError::StoreWriteFailure { .. })
    }

    /// Whether the run can never accept another checkpoint.
    pub fn closes_run(&self) -> bool {
        matches!(
            self,
            TrackerError::RunAlreadyCompleted { .. } | TrackerError::UnknownRun { .. }
        )
    }

    /// Reclassify a failure inside a write operation as a write failure,
    /// keeping errors that describe the run itself.
    pub(crate) fn into_write_failure(self) -> Self {
        match self {
            TrackerError::StoreReadFailure { message } => TrackerError::write(message),
            e if e.closes_run() || e.is_transient() => e,
            other => TrackerError::write(other),
        }
    }

    pub(crate) fn write(message: impl std::fmt::Display) -> Self {
        TrackerError::StoreWriteFailure {
            message: message.to_string(),
        }
    }

    pub(crate) fn read(message: impl std::fmt::Display) -> Self {
        TrackerError::StoreReadFailure {
            message: message.to_string(),
        }
    }
}

/// Result type alias for run-tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Extension trait for converting Option to TrackerError.
pub trait OptionExt<T> {
    /// Convert Option to Result with an unknown-run error.
    fn ok_or_unknown_run(self, run_id: &str) -> Result<T>;

    /// Convert Option to Result with an unknown-vehicle error.
    fn ok_or_unknown_vehicle(self, vehicle_id: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_unknown_run(self, run_id: &str) -> Result<T> {
        self.ok_or_else(|| TrackerError::UnknownRun {
            run_id: run_id.to_string(),
        })
    }

    fn ok_or_unknown_vehicle(self, vehicle_id: &str) -> Result<T> {
        self.ok_or_else(|| TrackerError::VehicleNotFound {
            vehicle_id: vehicle_id.to_string(),
        })
    }
}
