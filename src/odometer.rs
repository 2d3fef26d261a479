//! Odometer reconciliation.
//!
//! Each completed run adds its distance to the vehicle's cumulative odometer
//! exactly once. The store performs the increment atomically and records the
//! delta in a ledger keyed by run id, so concurrent completions on the same
//! vehicle cannot lose an update and re-applying a run is a no-op.

use std::sync::Arc;

use log::{info, warn};

use crate::store::VehicleStore;
use crate::{Result, Run, TrackerError};

/// Outcome of an odometer application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OdometerUpdate {
    /// Delta added; carries the new odometer reading in km.
    Applied { cumulative_distance_km: f64 },
    /// This run had already been applied.
    AlreadyApplied,
}

/// Adds completed run distances to vehicle odometers.
#[derive(Clone)]
pub struct OdometerSync {
    vehicles: Arc<dyn VehicleStore>,
}

impl OdometerSync {
    pub fn new(vehicles: Arc<dyn VehicleStore>) -> Self {
        Self { vehicles }
    }

    /// Add `delta_meters / 1000` to the vehicle's odometer on behalf of `run_id`.
    pub fn apply(&self, vehicle_id: &str, run_id: &str, delta_meters: f64) -> Result<OdometerUpdate> {
        if !delta_meters.is_finite() || delta_meters < 0.0 {
            return Err(TrackerError::Internal {
                message: format!(
                    "refusing odometer delta {} m for run '{}'",
                    delta_meters, run_id
                ),
            });
        }

        let delta_km = delta_meters / 1000.0;
        match self.vehicles.add_distance(vehicle_id, run_id, delta_km)? {
            Some(total) => {
                info!(
                    "[OdometerSync] {} +{:.3} km from run {} (now {:.3} km)",
                    vehicle_id, delta_km, run_id, total
                );
                Ok(OdometerUpdate::Applied {
                    cumulative_distance_km: total,
                })
            }
            None => {
                warn!(
                    "[OdometerSync] Run {} already applied to {}, skipping",
                    run_id, vehicle_id
                );
                Ok(OdometerUpdate::AlreadyApplied)
            }
        }
    }

    /// Apply a completed run. Safe to call again after a failed End.
    pub fn apply_run(&self, run: &Run) -> Result<OdometerUpdate> {
        let distance = run
            .total_distance_meters
            .filter(|_| !run.is_active())
            .ok_or_else(|| TrackerError::Internal {
                message: format!("run '{}' is not completed", run.id),
            })?;
        self.apply(&run.vehicle_id, &run.id, distance)
    }
}
