//! # Recovery
//!
//! Reattaches live subscriptions to runs left Active in the store after the
//! process was killed, crashed or relaunched. A resumed run behaves exactly
//! as if [`RunController::start`] had opened it, except that no new record is
//! created and checkpoint ordering continues from the last persisted sample.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::controller::RunController;
use crate::{Result, RunId, TrackerError};

/// Outcome of a cold-start sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// (courier_id, run_id) pairs now tracked again
    pub resumed: Vec<(String, RunId)>,
    /// (courier_id, reason) pairs that could not be resumed
    pub failed: Vec<(String, String)>,
}

/// Finds persisted Active runs and hands them back to a [`RunController`].
#[derive(Clone)]
pub struct RecoveryManager {
    controller: Arc<RunController>,
}

impl RecoveryManager {
    pub fn new(controller: Arc<RunController>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<RunController> {
        &self.controller
    }

    /// Reattach the courier's persisted Active run, if any.
    ///
    /// Returns `Ok(None)` when the courier has no Active run. Fails with
    /// [`TrackerError::AlreadyActive`] if the controller already tracks the
    /// courier, and with [`TrackerError::DuplicateActiveRuns`] if the store
    /// holds more than one Active run for them; duplicates are never merged
    /// or picked from.
    pub async fn resume(&self, courier_id: &str) -> Result<Option<RunId>> {
        let reservation = self.controller.reserve(courier_id)?;

        let mut runs = self.controller.runs().find_active_runs(courier_id)?;
        let run = match runs.len() {
            0 => {
                debug!("[Recovery] No active run for courier {}", courier_id);
                return Ok(None);
            }
            1 => runs.remove(0),
            _ => {
                let run_ids: Vec<RunId> = runs.into_iter().map(|r| r.id).collect();
                error!(
                    "[Recovery] Courier {} has {} active runs: {:?}",
                    courier_id,
                    run_ids.len(),
                    run_ids
                );
                return Err(TrackerError::DuplicateActiveRuns {
                    courier_id: courier_id.to_string(),
                    run_ids,
                });
            }
        };

        let subscription = self
            .controller
            .positions()
            .subscribe(courier_id, &self.controller.config().sampling)?;

        info!(
            "[Recovery] Resumed run {} for courier {} ({} checkpoints already stored)",
            run.id,
            courier_id,
            run.checkpoints.len()
        );

        let run_id = run.id.clone();
        reservation.commit(self.controller.spawn_live(&run, subscription));
        Ok(Some(run_id))
    }

    /// Resume for a courier the caller believes is in delivery.
    ///
    /// Fails with [`TrackerError::RunNotFound`] when no Active run exists.
    pub async fn resume_in_delivery(&self, courier_id: &str) -> Result<RunId> {
        self.resume(courier_id)
            .await?
            .ok_or_else(|| TrackerError::RunNotFound {
                courier_id: courier_id.to_string(),
            })
    }

    /// Resume every courier with a persisted Active run.
    ///
    /// Couriers already tracked by the controller are skipped. Failures are
    /// collected per courier and do not stop the sweep.
    pub async fn resume_all(&self) -> Result<RecoveryReport> {
        let active = self.controller.runs().list_active_runs()?;

        let couriers: BTreeSet<String> = active.into_iter().map(|r| r.courier_id).collect();

        let mut report = RecoveryReport::default();
        for courier_id in &couriers {
            if self.controller.is_tracking(courier_id) {
                continue;
            }
            match self.resume(courier_id).await {
                Ok(Some(run_id)) => report.resumed.push((courier_id.clone(), run_id)),
                Ok(None) => {}
                Err(e) => {
                    warn!("[Recovery] Could not resume courier {}: {}", courier_id, e);
                    report.failed.push((courier_id.clone(), e.to_string()));
                }
            }
        }

        info!(
            "[Recovery] Sweep finished: {} resumed, {} failed",
            report.resumed.len(),
            report.failed.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::ManualPositionSource;
    use crate::store::{MemoryStore, RunStore};
    use crate::{Checkpoint, NewRun, RunStatus, TrackerConfig, Vehicle};

    struct Fixture {
        store: Arc<MemoryStore>,
        positions: Arc<ManualPositionSource>,
        recovery: RecoveryManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.insert_vehicle(Vehicle::new("M1", 0.0));
        let positions = Arc::new(ManualPositionSource::new(64));
        let controller = Arc::new(RunController::new(
            store.clone(),
            store.clone(),
            positions.clone(),
            TrackerConfig::default(),
        ));
        Fixture {
            store,
            positions,
            recovery: RecoveryManager::new(controller),
        }
    }

    fn persisted_run(store: &MemoryStore, courier: &str) -> RunId {
        store
            .create_run(NewRun {
                courier_id: courier.to_string(),
                vehicle_id: "M1".to_string(),
                origin_unit_id: "U1".to_string(),
                order_ids: vec!["O1".to_string()],
                start_time: 0,
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_resume_without_active_run_returns_none() {
        let f = fixture();
        assert_eq!(f.recovery.resume("D1").await.unwrap(), None);
        assert!(!f.recovery.controller().is_tracking("D1"));
        assert!(!f.positions.is_subscribed("D1"));
    }

    #[tokio::test]
    async fn test_resume_then_end() {
        let f = fixture();
        let run_id = persisted_run(&f.store, "D1");
        f.store
            .append_checkpoint(&run_id, &Checkpoint::new(45.0, 7.0, 1_000))
            .unwrap();

        assert_eq!(f.recovery.resume("D1").await.unwrap(), Some(run_id.clone()));
        assert!(f.recovery.controller().is_tracking("D1"));

        f.positions.push("D1", 45.001, 7.0, 6_000);
        let distance = f.recovery.controller().end("D1").await.unwrap();
        assert!((distance - 111.19).abs() < 0.1);

        let run = f.store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.checkpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_resume_twice_fails_already_active() {
        let f = fixture();
        let run_id = persisted_run(&f.store, "D1");
        f.recovery.resume("D1").await.unwrap();

        match f.recovery.resume("D1").await {
            Err(TrackerError::AlreadyActive { run_id: held, .. }) => {
                assert_eq!(held, Some(run_id))
            }
            other => panic!("expected AlreadyActive, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_active_runs_fail_loudly() {
        let f = fixture();
        let first = persisted_run(&f.store, "D1");
        let mut duplicate = f.store.get_run(&first).unwrap().unwrap();
        duplicate.id = "legacy-duplicate".to_string();
        f.store.import_run(duplicate);

        match f.recovery.resume("D1").await {
            Err(TrackerError::DuplicateActiveRuns { run_ids, .. }) => {
                assert_eq!(run_ids.len(), 2);
                assert!(run_ids.contains(&first));
            }
            other => panic!("expected DuplicateActiveRuns, got {:?}", other),
        }
        assert!(!f.recovery.controller().is_tracking("D1"));
        assert!(!f.positions.is_subscribed("D1"));
    }

    #[tokio::test]
    async fn test_resume_in_delivery_without_run() {
        let f = fixture();
        assert!(matches!(
            f.recovery.resume_in_delivery("D1").await,
            Err(TrackerError::RunNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_resume_permission_denied_frees_slot() {
        let f = fixture();
        persisted_run(&f.store, "D1");
        f.positions.revoke_permission();

        assert!(matches!(
            f.recovery.resume("D1").await,
            Err(TrackerError::PermissionDenied { .. })
        ));
        f.positions.grant_permission();
        assert!(f.recovery.resume("D1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_resume_all_reports_per_courier() {
        let f = fixture();
        let d1 = persisted_run(&f.store, "D1");
        let d2 = persisted_run(&f.store, "D2");
        let mut dup = f.store.get_run(&d2).unwrap().unwrap();
        dup.id = "d2-dup".to_string();
        f.store.import_run(dup);

        let report = f.recovery.resume_all().await.unwrap();
        assert_eq!(report.resumed, vec![("D1".to_string(), d1)]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "D2");

        // Second sweep skips couriers already tracked
        let again = f.recovery.resume_all().await.unwrap();
        assert!(again.resumed.is_empty());
        assert_eq!(again.failed.len(), 1);
    }
}
