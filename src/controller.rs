//! # Run Controller
//!
//! Orchestrates delivery runs for any number of couriers.
//!
//! ## Architecture
//!
//! The controller keeps a registry of couriers with a live run. Each live run
//! owns:
//! - the position subscription guard (released on End, on every path)
//! - one checkpoint writer task that owns the sample receiver
//!
//! Samples flow `PositionSource -> channel -> writer -> RunStore` without
//! touching the registry, so couriers are tracked independently. The registry
//! enforces at most one live subscription per courier; the store enforces at
//! most one Active run record per courier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::geo_utils::run_distance;
use crate::odometer::OdometerSync;
use crate::position::{PositionSource, PositionSubscription, SubscriptionGuard};
use crate::store::{RunStore, VehicleStore};
use crate::writer::{CheckpointWriter, WriterExit, WriterStats};
use crate::{now_ms, NewRun, OptionExt, Result, Run, RunId, TrackerConfig, TrackerError};

/// Snapshot of a courier's live run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStatus {
    pub courier_id: String,
    pub run_id: RunId,
    pub vehicle_id: String,
    /// Checkpoints persisted by this process since start/resume
    pub checkpoints_appended: u32,
    /// Samples rejected at ingestion (invalid or out of order)
    pub samples_rejected: u32,
    /// Checkpoints dropped after exhausting retries
    pub writes_failed: u32,
    /// False once the writer has stopped; the run needs ending or resuming
    pub capturing: bool,
}

pub(crate) struct LiveRun {
    run_id: RunId,
    vehicle_id: String,
    guard: SubscriptionGuard,
    writer: JoinHandle<WriterExit>,
    stats: Arc<WriterStats>,
}

impl LiveRun {
    fn is_capturing(&self) -> bool {
        !self.stats.closed() && !self.writer.is_finished()
    }
}

enum Slot {
    /// Start or resume in progress
    Pending,
    Live(LiveRun),
}

type Slots = Mutex<HashMap<String, Slot>>;

/// Holds a courier's registry slot while a start or resume is in progress.
/// Dropping it without [`commit`](Self::commit) frees the slot.
pub(crate) struct Reservation<'a> {
    slots: &'a Slots,
    courier_id: String,
    committed: bool,
}

impl Reservation<'_> {
    pub(crate) fn commit(mut self, live: LiveRun) {
        lock(self.slots).insert(self.courier_id.clone(), Slot::Live(live));
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut slots = lock(self.slots);
        if matches!(slots.get(&self.courier_id), Some(Slot::Pending)) {
            slots.remove(&self.courier_id);
        }
    }
}

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<String, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the live runs of this process.
pub struct RunController {
    runs: Arc<dyn RunStore>,
    positions: Arc<dyn PositionSource>,
    odometer: OdometerSync,
    config: TrackerConfig,
    slots: Slots,
}

impl RunController {
    pub fn new(
        runs: Arc<dyn RunStore>,
        vehicles: Arc<dyn VehicleStore>,
        positions: Arc<dyn PositionSource>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            runs,
            positions,
            odometer: OdometerSync::new(vehicles),
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn odometer(&self) -> &OdometerSync {
        &self.odometer
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open a run for a courier departing with a set of orders.
    ///
    /// Opens the position subscription, persists an Active run with no
    /// checkpoints, and starts the run's checkpoint writer. Returns the new
    /// run id immediately; sampling continues until [`end`](Self::end).
    ///
    /// Fails with [`TrackerError::AlreadyActive`] if this controller already
    /// tracks the courier, or a persisted Active run exists for them (resume
    /// that one instead). Fails with [`TrackerError::PermissionDenied`] if the
    /// position source cannot be opened; no run is created in that case.
    pub async fn start(
        &self,
        courier_id: &str,
        vehicle_id: &str,
        order_ids: Vec<String>,
        origin_unit_id: &str,
    ) -> Result<RunId> {
        let reservation = self.reserve(courier_id)?;

        if let Some(existing) = self.runs.find_active_runs(courier_id)?.into_iter().next() {
            warn!(
                "[RunController] Courier {} already has persisted active run {}",
                courier_id, existing.id
            );
            return Err(TrackerError::AlreadyActive {
                courier_id: courier_id.to_string(),
                run_id: Some(existing.id),
            });
        }

        let subscription = self.positions.subscribe(courier_id, &self.config.sampling)?;

        // Subscription is dropped (released) if creation fails
        let run = self.runs.create_run(NewRun {
            courier_id: courier_id.to_string(),
            vehicle_id: vehicle_id.to_string(),
            origin_unit_id: origin_unit_id.to_string(),
            order_ids,
            start_time: now_ms(),
        })?;

        info!(
            "[RunController] Started run {} for courier {} (vehicle {}, {} orders)",
            run.id,
            courier_id,
            vehicle_id,
            run.order_ids.len()
        );

        let run_id = run.id.clone();
        reservation.commit(self.spawn_live(&run, subscription));
        Ok(run_id)
    }

    /// Finish the courier's live run.
    ///
    /// Releases the subscription, waits for buffered samples to be written,
    /// computes the polyline distance, marks the run Completed and adds the
    /// distance to the vehicle's odometer. Returns the distance in meters.
    ///
    /// Fails with [`TrackerError::NoActiveRun`] if this controller holds no
    /// live subscription for the courier; call
    /// [`RecoveryManager::resume`](crate::RecoveryManager::resume) first.
    pub async fn end(&self, courier_id: &str) -> Result<f64> {
        let Some(live) = self.take_live(courier_id) else {
            self.log_orphaned_run(courier_id);
            return Err(TrackerError::NoActiveRun {
                courier_id: courier_id.to_string(),
            });
        };

        let run_id = self.stop(live).await;

        let run = self.runs.get_run(&run_id)?.ok_or_unknown_run(&run_id)?;
        if !run.is_active() {
            return Err(TrackerError::RunAlreadyCompleted { run_id });
        }

        let distance = run_distance(&run.checkpoints);
        let completed = self.runs.complete_run(&run_id, now_ms(), distance)?;
        info!(
            "[RunController] Completed run {} for courier {}: {:.1} m over {} checkpoints",
            run_id,
            courier_id,
            distance,
            completed.checkpoints.len()
        );

        self.odometer.apply(&completed.vehicle_id, &run_id, distance)?;
        Ok(distance)
    }

    /// Release the courier's live subscription without completing the run.
    ///
    /// The run stays Active in the store and can be picked up again with
    /// [`RecoveryManager::resume`](crate::RecoveryManager::resume).
    pub async fn detach(&self, courier_id: &str) -> Result<RunId> {
        let live = self
            .take_live(courier_id)
            .ok_or_else(|| TrackerError::NoActiveRun {
                courier_id: courier_id.to_string(),
            })?;
        let run_id = self.stop(live).await;
        info!("[RunController] Detached courier {} from run {}", courier_id, run_id);
        Ok(run_id)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Whether this controller holds a live subscription for the courier
    /// and its checkpoint writer is still running.
    pub fn is_tracking(&self, courier_id: &str) -> bool {
        matches!(lock(&self.slots).get(courier_id), Some(Slot::Live(live)) if live.is_capturing())
    }

    pub fn status(&self, courier_id: &str) -> Option<TrackingStatus> {
        match lock(&self.slots).get(courier_id) {
            Some(Slot::Live(live)) => Some(TrackingStatus {
                courier_id: courier_id.to_string(),
                run_id: live.run_id.clone(),
                vehicle_id: live.vehicle_id.clone(),
                checkpoints_appended: live.stats.appended(),
                samples_rejected: live.stats.rejected(),
                writes_failed: live.stats.failed(),
                capturing: live.is_capturing(),
            }),
            _ => None,
        }
    }

    /// Couriers with a capturing live run, sorted.
    pub fn active_couriers(&self) -> Vec<String> {
        let mut couriers: Vec<String> = lock(&self.slots)
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live(live) if live.is_capturing()))
            .map(|(courier, _)| courier.clone())
            .collect();
        couriers.sort();
        couriers
    }

    // ========================================================================
    // Internals shared with recovery
    // ========================================================================

    pub(crate) fn runs(&self) -> &Arc<dyn RunStore> {
        &self.runs
    }

    pub(crate) fn positions(&self) -> &Arc<dyn PositionSource> {
        &self.positions
    }

    /// Claim the courier's registry slot. A slot whose writer has stopped
    /// is discarded.
    pub(crate) fn reserve(&self, courier_id: &str) -> Result<Reservation<'_>> {
        let mut slots = lock(&self.slots);
        if matches!(slots.get(courier_id), Some(Slot::Live(live)) if !live.is_capturing()) {
            if let Some(Slot::Live(stale)) = slots.remove(courier_id) {
                warn!(
                    "[RunController] Discarding stopped writer for courier {} (run {})",
                    courier_id, stale.run_id
                );
            }
        }
        if let Some(slot) = slots.get(courier_id) {
            let run_id = match slot {
                Slot::Live(live) => Some(live.run_id.clone()),
                Slot::Pending => None,
            };
            return Err(TrackerError::AlreadyActive {
                courier_id: courier_id.to_string(),
                run_id,
            });
        }
        slots.insert(courier_id.to_string(), Slot::Pending);

        Ok(Reservation {
            slots: &self.slots,
            courier_id: courier_id.to_string(),
            committed: false,
        })
    }

    /// Start the checkpoint writer for a run and bundle it with its guard.
    pub(crate) fn spawn_live(&self, run: &Run, subscription: PositionSubscription) -> LiveRun {
        let (samples, guard) = subscription.into_parts();
        let stats = Arc::new(WriterStats::default());

        let writer = CheckpointWriter {
            run_id: run.id.clone(),
            store: Arc::clone(&self.runs),
            retry: self.config.checkpoint_retry.clone(),
            stats: Arc::clone(&stats),
            last_timestamp: run.last_checkpoint_time(),
        };

        LiveRun {
            run_id: run.id.clone(),
            vehicle_id: run.vehicle_id.clone(),
            guard,
            writer: tokio::spawn(writer.run(samples)),
            stats,
        }
    }

    fn take_live(&self, courier_id: &str) -> Option<LiveRun> {
        let mut slots = lock(&self.slots);
        match slots.get(courier_id) {
            Some(Slot::Live(_)) => match slots.remove(courier_id) {
                Some(Slot::Live(live)) => Some(live),
                _ => None,
            },
            _ => None,
        }
    }

    /// Release the subscription, then let the writer drain what was already
    /// buffered. The writer is aborted if it does not finish in time.
    async fn stop(&self, live: LiveRun) -> RunId {
        let LiveRun {
            run_id,
            guard,
            mut writer,
            ..
        } = live;

        guard.release();

        let timeout = Duration::from_millis(self.config.drain_timeout_ms);
        let drained = tokio::time::timeout(timeout, &mut writer).await;
        match drained {
            Ok(Ok(WriterExit::StreamClosed)) => {
                debug!("[RunController] Writer for run {} drained", run_id)
            }
            Ok(Ok(WriterExit::RunClosed(e))) => {
                warn!("[RunController] Writer for run {} stopped early: {}", run_id, e)
            }
            Ok(Err(e)) => warn!("[RunController] Writer for run {} failed: {}", run_id, e),
            Err(_) => {
                warn!(
                    "[RunController] Writer for run {} did not drain within {:?}, aborting",
                    run_id, timeout
                );
                writer.abort();
                // An append already in flight finishes before the run is read
                if let Err(e) = writer.await {
                    debug!("[RunController] Writer for run {} stopped: {}", run_id, e);
                }
            }
        }
        run_id
    }

    fn log_orphaned_run(&self, courier_id: &str) {
        if let Ok(runs) = self.runs.find_active_runs(courier_id) {
            if let Some(run) = runs.first() {
                warn!(
                    "[RunController] Courier {} has persisted active run {} without a live subscription; resume it first",
                    courier_id, run.id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{ManualPositionSource, SamplingPolicy};
    use crate::store::MemoryStore;
    use crate::{RunStatus, Vehicle};

    struct Fixture {
        store: Arc<MemoryStore>,
        positions: Arc<ManualPositionSource>,
        controller: RunController,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.insert_vehicle(Vehicle::new("M1", 0.0));
        let positions = Arc::new(ManualPositionSource::new(64));
        let controller = RunController::new(
            store.clone(),
            store.clone(),
            positions.clone(),
            TrackerConfig::default(),
        );
        Fixture {
            store,
            positions,
            controller,
        }
    }

    fn orders() -> Vec<String> {
        vec!["O1".to_string(), "O2".to_string()]
    }

    #[tokio::test]
    async fn test_start_creates_active_run() {
        let f = fixture();
        let run_id = f.controller.start("D1", "M1", orders(), "U1").await.unwrap();

        let run = f.store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Active);
        assert_eq!(run.order_ids, orders());
        assert!(run.checkpoints.is_empty());
        assert!(f.controller.is_tracking("D1"));
        assert!(f.positions.is_subscribed("D1"));
    }

    #[tokio::test]
    async fn test_start_then_end_without_samples() {
        let f = fixture();
        let run_id = f.controller.start("D1", "M1", orders(), "U1").await.unwrap();
        let distance = f.controller.end("D1").await.unwrap();

        assert_eq!(distance, 0.0);
        let run = f.store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.total_distance_meters, Some(0.0));
        assert!(run.end_time.is_some());
        assert!(!f.controller.is_tracking("D1"));
        assert!(!f.positions.is_subscribed("D1"));
    }

    #[tokio::test]
    async fn test_second_start_fails_already_active() {
        let f = fixture();
        let run_id = f.controller.start("D1", "M1", orders(), "U1").await.unwrap();

        match f.controller.start("D1", "M1", orders(), "U1").await {
            Err(TrackerError::AlreadyActive { run_id: held, .. }) => {
                assert_eq!(held, Some(run_id))
            }
            other => panic!("expected AlreadyActive, got {:?}", other),
        }
        assert_eq!(f.store.run_count(), 1);
    }

    #[tokio::test]
    async fn test_end_without_run_fails() {
        let f = fixture();
        assert!(matches!(
            f.controller.end("D1").await,
            Err(TrackerError::NoActiveRun { .. })
        ));
    }

    #[tokio::test]
    async fn test_permission_denied_creates_nothing() {
        let f = fixture();
        f.positions.revoke_permission();

        assert!(matches!(
            f.controller.start("D1", "M1", orders(), "U1").await,
            Err(TrackerError::PermissionDenied { .. })
        ));
        assert_eq!(f.store.run_count(), 0);
        assert!(!f.controller.is_tracking("D1"));

        // Slot was freed: a retry after granting permission works
        f.positions.grant_permission();
        assert!(f.controller.start("D1", "M1", orders(), "U1").await.is_ok());
    }

    #[tokio::test]
    async fn test_end_drains_buffered_samples() {
        let f = fixture();
        f.controller.start("D1", "M1", orders(), "U1").await.unwrap();

        assert!(f.positions.push("D1", 45.0, 7.0, 0));
        assert!(f.positions.push("D1", 45.001, 7.0, 5_000));
        assert!(f.positions.push("D1", 45.002, 7.0, 10_000));

        let distance = f.controller.end("D1").await.unwrap();
        assert!((distance - 222.39).abs() < 0.1, "distance was {}", distance);

        let vehicle = f.store.get_vehicle("M1").unwrap().unwrap();
        assert!((vehicle.cumulative_distance_km - distance / 1000.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_couriers_are_tracked_independently() {
        let f = fixture();
        f.store.insert_vehicle(Vehicle::new("M2", 0.0));
        f.controller.start("D1", "M1", orders(), "U1").await.unwrap();
        f.controller.start("D2", "M2", vec![], "U1").await.unwrap();
        assert_eq!(f.controller.active_couriers(), vec!["D1", "D2"]);

        f.positions.push("D2", 10.0, 10.0, 0);
        f.positions.push("D2", 10.01, 10.0, 60_000);

        assert_eq!(f.controller.end("D1").await.unwrap(), 0.0);
        assert!(f.controller.end("D2").await.unwrap() > 1_000.0);
        assert!(f.controller.active_couriers().is_empty());
    }

    #[tokio::test]
    async fn test_detach_leaves_run_active() {
        let f = fixture();
        let run_id = f.controller.start("D1", "M1", orders(), "U1").await.unwrap();
        f.positions.push("D1", 45.0, 7.0, 0);

        assert_eq!(f.controller.detach("D1").await.unwrap(), run_id);
        assert!(!f.controller.is_tracking("D1"));

        let run = f.store.get_run(&run_id).unwrap().unwrap();
        assert!(run.is_active());
        assert_eq!(run.checkpoints.len(), 1);

        // A fresh start is refused while the persisted run is Active
        assert!(matches!(
            f.controller.start("D1", "M1", orders(), "U1").await,
            Err(TrackerError::AlreadyActive { run_id: Some(_), .. })
        ));
        assert!(matches!(
            f.controller.end("D1").await,
            Err(TrackerError::NoActiveRun { .. })
        ));
    }

    #[tokio::test]
    async fn test_status_reports_writer_counters() {
        let f = fixture();
        let config = TrackerConfig {
            sampling: SamplingPolicy {
                min_distance_meters: 0.0,
                min_interval_ms: 0,
            },
            ..TrackerConfig::default()
        };
        let controller =
            RunController::new(f.store.clone(), f.store.clone(), f.positions.clone(), config);
        controller.start("D1", "M1", orders(), "U1").await.unwrap();

        f.positions.push("D1", 45.0, 7.0, 1_000);
        f.positions.push("D1", 95.0, 7.0, 2_000); // latitude out of range

        // Let the writer catch up
        for _ in 0..100 {
            let status = controller.status("D1").unwrap();
            if status.checkpoints_appended + status.samples_rejected == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let status = controller.status("D1").unwrap();
        assert_eq!(status.checkpoints_appended, 1);
        assert_eq!(status.samples_rejected, 1);
        assert_eq!(status.vehicle_id, "M1");
        assert!(controller.status("D9").is_none());
    }

    #[tokio::test]
    async fn test_unknown_vehicle_fails_after_completion() {
        let f = fixture();
        let run_id = f.controller.start("D1", "M7", orders(), "U1").await.unwrap();

        assert!(matches!(
            f.controller.end("D1").await,
            Err(TrackerError::VehicleNotFound { .. })
        ));
        // The run itself is finalized and the subscription is gone
        let run = f.store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(!f.positions.is_subscribed("D1"));

        // Odometer can be repaired once the vehicle exists
        f.store.insert_vehicle(Vehicle::new("M7", 5.0));
        assert!(f.controller.odometer().apply_run(&run).is_ok());
    }

    #[tokio::test]
    async fn test_status_shows_stopped_writer() {
        let f = fixture();
        let run_id = f.controller.start("D1", "M1", orders(), "U1").await.unwrap();
        assert!(f.controller.status("D1").unwrap().capturing);

        // Run completed behind the controller's back: the writer's next append fails
        f.store.complete_run(&run_id, now_ms(), 0.0).unwrap();
        f.positions.push("D1", 45.0, 7.0, 1_000);
        for _ in 0..200 {
            if !f.controller.is_tracking("D1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(!f.controller.is_tracking("D1"));
        assert!(f.controller.active_couriers().is_empty());
        let status = f.controller.status("D1").unwrap();
        assert!(!status.capturing);
        assert_eq!(status.run_id, run_id);

        // A fresh start replaces the stopped slot
        let next = f.controller.start("D1", "M1", orders(), "U1").await.unwrap();
        assert_ne!(next, run_id);
        assert!(f.controller.is_tracking("D1"));
    }

    /// Appends that block the calling thread for a while.
    struct SlowStore {
        inner: Arc<MemoryStore>,
        delay: Duration,
        appending: std::sync::atomic::AtomicBool,
    }

    impl RunStore for SlowStore {
        fn create_run(&self, new_run: NewRun) -> Result<Run> {
            self.inner.create_run(new_run)
        }

        fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
            self.inner.get_run(run_id)
        }

        fn find_active_runs(&self, courier_id: &str) -> Result<Vec<Run>> {
            self.inner.find_active_runs(courier_id)
        }

        fn list_active_runs(&self) -> Result<Vec<Run>> {
            self.inner.list_active_runs()
        }

        fn append_checkpoint(&self, run_id: &str, checkpoint: &crate::Checkpoint) -> Result<()> {
            self.appending
                .store(true, std::sync::atomic::Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.inner.append_checkpoint(run_id, checkpoint)
        }

        fn complete_run(&self, run_id: &str, end_time: i64, total_distance_meters: f64) -> Result<Run> {
            self.inner.complete_run(run_id, end_time, total_distance_meters)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drain_timeout_waits_for_inflight_append() {
        let f = fixture();
        let slow = Arc::new(SlowStore {
            inner: f.store.clone(),
            delay: Duration::from_millis(150),
            appending: std::sync::atomic::AtomicBool::new(false),
        });
        let config = TrackerConfig {
            drain_timeout_ms: 10,
            ..TrackerConfig::default()
        };
        let controller =
            RunController::new(slow.clone(), f.store.clone(), f.positions.clone(), config);
        let run_id = controller.start("D1", "M1", orders(), "U1").await.unwrap();

        f.positions.push("D1", 45.0, 7.0, 1_000);
        for _ in 0..200 {
            if slow.appending.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // The drain times out mid-append; the completed run still matches its checkpoints
        let distance = controller.end("D1").await.unwrap();
        let run = f.store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.checkpoints.len(), 1);
        assert_eq!(run.total_distance_meters, Some(distance));
        assert_eq!(distance, run_distance(&run.checkpoints));
    }
}
