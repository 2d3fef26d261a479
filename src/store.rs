//! # Store Adapters
//!
//! Boundaries to the persisted run records and vehicle odometers.
//!
//! Implementations must keep calls short: they are invoked from async tasks.
//! [`MemoryStore`] implements both traits in-process; the SQLite-backed
//! store lives in [`crate::persistence`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{
    Checkpoint, NewRun, OptionExt, Result, Run, RunId, RunStatus, TrackerError, Vehicle,
};

/// Persisted run records.
pub trait RunStore: Send + Sync {
    /// Persist a new Active run with no checkpoints.
    ///
    /// Fails with [`TrackerError::AlreadyActive`] if the courier already has
    /// an Active run.
    fn create_run(&self, new_run: NewRun) -> Result<Run>;

    /// Load a run with its checkpoints.
    fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// All Active runs for a courier. More than one means the
    /// single-active-run invariant was broken by earlier data.
    fn find_active_runs(&self, courier_id: &str) -> Result<Vec<Run>>;

    /// All Active runs across couriers (cold-start sweep).
    fn list_active_runs(&self) -> Result<Vec<Run>>;

    /// Append one checkpoint to an Active run.
    ///
    /// Fails with [`TrackerError::RunAlreadyCompleted`] once the run is
    /// completed.
    fn append_checkpoint(&self, run_id: &str, checkpoint: &Checkpoint) -> Result<()>;

    /// Move an Active run to Completed, setting end time and distance together.
    fn complete_run(&self, run_id: &str, end_time: i64, total_distance_meters: f64) -> Result<Run>;
}

/// Vehicle odometer records.
pub trait VehicleStore: Send + Sync {
    fn get_vehicle(&self, vehicle_id: &str) -> Result<Option<Vehicle>>;

    /// Register or overwrite a vehicle.
    fn put_vehicle(&self, vehicle: &Vehicle) -> Result<()>;

    /// Atomically add `delta_km` to the vehicle's odometer, recording the
    /// delta in a ledger keyed by `run_id`.
    ///
    /// Returns the new odometer reading, or `None` when this run was already
    /// applied (the call is then a no-op).
    fn add_distance(&self, vehicle_id: &str, run_id: &str, delta_km: f64) -> Result<Option<f64>>;

    /// Sum of ledger deltas applied to a vehicle.
    fn ledger_total_km(&self, vehicle_id: &str) -> Result<f64>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryState {
    runs: HashMap<RunId, Run>,
    vehicles: HashMap<String, Vehicle>,
    /// run_id -> (vehicle_id, delta_km)
    ledger: BTreeMap<RunId, (String, f64)>,
}

/// In-process run and vehicle store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a run record as-is, bypassing invariant checks.
    ///
    /// Used to seed records written by older app versions.
    pub fn import_run(&self, run: Run) {
        self.state().runs.insert(run.id.clone(), run);
    }

    pub fn insert_vehicle(&self, vehicle: Vehicle) {
        self.state().vehicles.insert(vehicle.id.clone(), vehicle);
    }

    pub fn run_count(&self) -> usize {
        self.state().runs.len()
    }
}

impl RunStore for MemoryStore {
    fn create_run(&self, new_run: NewRun) -> Result<Run> {
        let mut state = self.state();
        if let Some(existing) = state
            .runs
            .values()
            .find(|r| r.courier_id == new_run.courier_id && r.is_active())
        {
            return Err(TrackerError::AlreadyActive {
                courier_id: new_run.courier_id,
                run_id: Some(existing.id.clone()),
            });
        }

        let run = new_run.into_run();
        state.runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.state().runs.get(run_id).cloned())
    }

    fn find_active_runs(&self, courier_id: &str) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .state()
            .runs
            .values()
            .filter(|r| r.courier_id == courier_id && r.is_active())
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    fn list_active_runs(&self) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .state()
            .runs
            .values()
            .filter(|r| r.is_active())
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    fn append_checkpoint(&self, run_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        let mut state = self.state();
        let run = state.runs.get_mut(run_id).ok_or_unknown_run(run_id)?;
        if run.status == RunStatus::Completed {
            return Err(TrackerError::RunAlreadyCompleted {
                run_id: run_id.to_string(),
            });
        }
        run.checkpoints.push(*checkpoint);
        Ok(())
    }

    fn complete_run(&self, run_id: &str, end_time: i64, total_distance_meters: f64) -> Result<Run> {
        let mut state = self.state();
        let run = state.runs.get_mut(run_id).ok_or_unknown_run(run_id)?;
        if run.status == RunStatus::Completed {
            return Err(TrackerError::RunAlreadyCompleted {
                run_id: run_id.to_string(),
            });
        }
        run.status = RunStatus::Completed;
        run.end_time = Some(end_time);
        run.total_distance_meters = Some(total_distance_meters);
        Ok(run.clone())
    }
}

impl VehicleStore for MemoryStore {
    fn get_vehicle(&self, vehicle_id: &str) -> Result<Option<Vehicle>> {
        Ok(self.state().vehicles.get(vehicle_id).cloned())
    }

    fn put_vehicle(&self, vehicle: &Vehicle) -> Result<()> {
        self.insert_vehicle(vehicle.clone());
        Ok(())
    }

    fn add_distance(&self, vehicle_id: &str, run_id: &str, delta_km: f64) -> Result<Option<f64>> {
        let mut state = self.state();
        if state.ledger.contains_key(run_id) {
            return Ok(None);
        }

        let vehicle = state
            .vehicles
            .get_mut(vehicle_id)
            .ok_or_unknown_vehicle(vehicle_id)?;
        vehicle.cumulative_distance_km += delta_km;
        let total = vehicle.cumulative_distance_km;

        state
            .ledger
            .insert(run_id.to_string(), (vehicle_id.to_string(), delta_km));
        Ok(Some(total))
    }

    fn ledger_total_km(&self, vehicle_id: &str) -> Result<f64> {
        Ok(self
            .state()
            .ledger
            .values()
            .filter(|(v, _)| v == vehicle_id)
            .map(|(_, km)| km)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_run(courier: &str) -> NewRun {
        NewRun {
            courier_id: courier.to_string(),
            vehicle_id: "M1".to_string(),
            origin_unit_id: "U1".to_string(),
            order_ids: vec!["O1".to_string()],
            start_time: 1_000,
        }
    }

    #[test]
    fn test_create_rejects_second_active_run() {
        let store = MemoryStore::new();
        let first = store.create_run(new_run("D1")).unwrap();

        match store.create_run(new_run("D1")) {
            Err(TrackerError::AlreadyActive { run_id, .. }) => assert_eq!(run_id, Some(first.id)),
            other => panic!("expected AlreadyActive, got {:?}", other),
        }
        // Other couriers are unaffected
        assert!(store.create_run(new_run("D2")).is_ok());
    }

    #[test]
    fn test_completed_run_is_immutable() {
        let store = MemoryStore::new();
        let run = store.create_run(new_run("D1")).unwrap();
        store
            .append_checkpoint(&run.id, &Checkpoint::new(1.0, 1.0, 2_000))
            .unwrap();

        let done = store.complete_run(&run.id, 3_000, 12.5).unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.total_distance_meters, Some(12.5));
        assert_eq!(done.duration_ms(), Some(2_000));

        assert!(matches!(
            store.append_checkpoint(&run.id, &Checkpoint::new(1.0, 1.0, 4_000)),
            Err(TrackerError::RunAlreadyCompleted { .. })
        ));
        assert!(matches!(
            store.complete_run(&run.id, 5_000, 99.0),
            Err(TrackerError::RunAlreadyCompleted { .. })
        ));
        assert_eq!(store.get_run(&run.id).unwrap().unwrap().checkpoints.len(), 1);

        // Courier may start again once the previous run is completed
        assert!(store.create_run(new_run("D1")).is_ok());
    }

    #[test]
    fn test_unknown_run() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.append_checkpoint("nope", &Checkpoint::new(0.0, 0.0, 0)),
            Err(TrackerError::UnknownRun { .. })
        ));
        assert!(store.get_run("nope").unwrap().is_none());
    }

    #[test]
    fn test_add_distance_is_idempotent_per_run() {
        let store = MemoryStore::new();
        store.insert_vehicle(Vehicle::new("M1", 100.0));

        assert_eq!(store.add_distance("M1", "r1", 0.5).unwrap(), Some(100.5));
        assert_eq!(store.add_distance("M1", "r1", 0.5).unwrap(), None);
        assert_eq!(store.add_distance("M1", "r2", 1.5).unwrap(), Some(102.0));

        assert_eq!(store.get_vehicle("M1").unwrap().unwrap().cumulative_distance_km, 102.0);
        assert_eq!(store.ledger_total_km("M1").unwrap(), 2.0);
    }

    #[test]
    fn test_add_distance_unknown_vehicle() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.add_distance("M9", "r1", 1.0),
            Err(TrackerError::VehicleNotFound { .. })
        ));
        // Failed application is not recorded
        store.insert_vehicle(Vehicle::new("M9", 0.0));
        assert_eq!(store.add_distance("M9", "r1", 1.0).unwrap(), Some(1.0));
    }
}
