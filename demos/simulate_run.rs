//! Simulate a courier trip against a SQLite store.
//!
//! ```sh
//! RUST_LOG=info cargo run --example simulate_run --features synthetic -- runs.db
//! ```
//!
//! The courier rides north-east at 8 m/s. Halfway through, the controller is
//! dropped to mimic an app kill, and a fresh controller resumes the run from
//! the last stored checkpoint before ending it.

use std::sync::Arc;
use std::time::Duration;

use run_tracker::{
    GpsPoint, RecoveryManager, RunController, RunStore, SamplingPolicy, SqliteStore,
    SyntheticPositionSource, SyntheticRoute, TrackerConfig, Vehicle, VehicleStore,
};

fn controller(store: &Arc<SqliteStore>, positions: &Arc<SyntheticPositionSource>) -> Arc<RunController> {
    let config = TrackerConfig {
        sampling: SamplingPolicy {
            min_distance_meters: 5.0,
            min_interval_ms: 1_000,
        },
        ..TrackerConfig::default()
    };
    Arc::new(RunController::new(
        store.clone(),
        store.clone(),
        positions.clone(),
        config,
    ))
}

fn route_from(origin: GpsPoint) -> SyntheticRoute {
    SyntheticRoute {
        step_ms: 250,
        tick: Duration::from_millis(250),
        ..SyntheticRoute::new(origin, 45.0, 8.0)
    }
}

#[tokio::main]
async fn main() -> run_tracker::Result<()> {
    env_logger::init();

    let db_path = std::env::args().nth(1).unwrap_or_else(|| ":memory:".to_string());
    let store = Arc::new(SqliteStore::new(&db_path)?);
    if store.get_vehicle("M1")?.is_none() {
        store.put_vehicle(&Vehicle::new("M1", 0.0))?;
    }

    let positions = Arc::new(SyntheticPositionSource::new(
        route_from(GpsPoint::new(38.7223, -9.1393)),
        64,
    ));

    let first = controller(&store, &positions);
    let run_id = first
        .start("D1", "M1", vec!["O1".into(), "O2".into()], "U1")
        .await?;
    println!("started run {}", run_id);

    tokio::time::sleep(Duration::from_secs(3)).await;
    drop(first);
    println!("controller dropped; run left active in {}", store.path());

    // Pick the trip up where the stored track ends
    if let Some(last) = store.get_run(&run_id)?.and_then(|r| r.checkpoints.last().copied()) {
        positions.set_route("D1", route_from(last.point()));
    }

    let recovery = RecoveryManager::new(controller(&store, &positions));
    let resumed = recovery.resume_in_delivery("D1").await?;
    println!("resumed run {}", resumed);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let meters = recovery.controller().end("D1").await?;

    let run = store.get_run(&run_id)?;
    let checkpoints = run.map(|r| r.checkpoints.len()).unwrap_or(0);
    let odometer = store
        .get_vehicle("M1")?
        .map(|v| v.cumulative_distance_km)
        .unwrap_or(0.0);
    println!(
        "run {} completed: {:.1} m over {} checkpoints, M1 odometer {:.3} km",
        run_id, meters, checkpoints, odometer
    );
    Ok(())
}
