//! # SQLite Store
//!
//! Durable run and vehicle records.
//!
//! ## Tables
//!
//! - `runs`: one row per run, status `active` or `completed`
//! - `checkpoints`: append-only samples keyed by `(run_id, seq)`
//! - `vehicles`: cumulative odometer per vehicle
//! - `odometer_ledger`: one row per applied run, making odometer updates
//!   idempotent and auditable
//!
//! Checkpoints are written one row per sample so an interrupted run keeps
//! everything captured up to the interruption.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult};

use crate::store::{RunStore, VehicleStore};
use crate::{
    now_ms, Checkpoint, NewRun, OptionExt, Result, Run, RunId, RunStatus, TrackerError, Vehicle,
};

/// SQLite-backed [`RunStore`] and [`VehicleStore`].
pub struct SqliteStore {
    db: Mutex<Connection>,
    db_path: String,
}

impl SqliteStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) the database at the given path.
    pub fn new(db_path: &str) -> Result<Self> {
        Self::with_busy_timeout(db_path, Duration::from_secs(5))
    }

    /// Open with a custom wait for locks held by other connections.
    pub fn with_busy_timeout(db_path: &str, busy_timeout: Duration) -> Result<Self> {
        let db = Connection::open(db_path).map_err(TrackerError::read)?;
        db.busy_timeout(busy_timeout).map_err(TrackerError::read)?;
        Self::init_schema(&db).map_err(TrackerError::write)?;

        info!("[SqliteStore] Opened {}", db_path);
        Ok(Self {
            db: Mutex::new(db),
            db_path: db_path.to_string(),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Initialize the database schema.
    fn init_schema(conn: &Connection) -> SqlResult<()> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- One row per delivery run
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                courier_id TEXT NOT NULL,
                vehicle_id TEXT NOT NULL,
                origin_unit_id TEXT NOT NULL,
                order_ids TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                total_distance_meters REAL,
                status TEXT NOT NULL CHECK (status IN ('active', 'completed')),
                CHECK ((status = 'completed') = (total_distance_meters IS NOT NULL))
            );

            CREATE INDEX IF NOT EXISTS idx_runs_courier_status ON runs(courier_id, status);

            -- Append-only position samples
            CREATE TABLE IF NOT EXISTS checkpoints (
                run_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                PRIMARY KEY (run_id, seq),
                FOREIGN KEY (run_id) REFERENCES runs(id)
            );

            -- Vehicle odometers
            CREATE TABLE IF NOT EXISTS vehicles (
                id TEXT PRIMARY KEY,
                cumulative_distance_km REAL NOT NULL DEFAULT 0
            );

            -- Applied odometer deltas, one per completed run
            CREATE TABLE IF NOT EXISTS odometer_ledger (
                run_id TEXT PRIMARY KEY,
                vehicle_id TEXT NOT NULL,
                delta_km REAL NOT NULL,
                applied_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ledger_vehicle ON odometer_ledger(vehicle_id);
            "#,
        )?;

        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Loading
    // ========================================================================

    fn load_run(conn: &Connection, run_id: &str) -> Result<Option<Run>> {
        let row = conn
            .query_row(
                "SELECT id, courier_id, vehicle_id, origin_unit_id, order_ids,
                        start_time, end_time, total_distance_meters, status
                 FROM runs WHERE id = ?",
                params![run_id],
                |row| {
                    Ok((
                        Run {
                            id: row.get(0)?,
                            courier_id: row.get(1)?,
                            vehicle_id: row.get(2)?,
                            origin_unit_id: row.get(3)?,
                            order_ids: Vec::new(),
                            start_time: row.get(5)?,
                            end_time: row.get(6)?,
                            total_distance_meters: row.get(7)?,
                            status: RunStatus::Active,
                            checkpoints: Vec::new(),
                        },
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()
            .map_err(TrackerError::read)?;

        let Some((mut run, order_ids, status)) = row else {
            return Ok(None);
        };

        run.order_ids = serde_json::from_str(&order_ids).map_err(|e| TrackerError::Internal {
            message: format!("run '{}' has malformed order ids: {}", run.id, e),
        })?;
        run.status = RunStatus::parse(&status).ok_or_else(|| TrackerError::Internal {
            message: format!("run '{}' has unknown status '{}'", run.id, status),
        })?;
        run.checkpoints = Self::load_checkpoints(conn, &run.id)?;

        Ok(Some(run))
    }

    fn load_checkpoints(conn: &Connection, run_id: &str) -> Result<Vec<Checkpoint>> {
        let mut stmt = conn
            .prepare(
                "SELECT latitude, longitude, timestamp FROM checkpoints
                 WHERE run_id = ? ORDER BY seq",
            )
            .map_err(TrackerError::read)?;

        let checkpoints = stmt
            .query_map(params![run_id], |row| {
                Ok(Checkpoint::new(row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(TrackerError::read)?
            .collect::<SqlResult<Vec<_>>>()
            .map_err(TrackerError::read)?;
        Ok(checkpoints)
    }

    fn load_runs_where(conn: &Connection, sql: &str, courier_id: Option<&str>) -> Result<Vec<Run>> {
        let mut stmt = conn.prepare(sql).map_err(TrackerError::read)?;
        let ids: Vec<RunId> = stmt
            .query_map(params_from_iter(courier_id), |row| row.get(0))
            .map_err(TrackerError::read)?
            .collect::<SqlResult<Vec<_>>>()
            .map_err(TrackerError::read)?;

        let mut runs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(run) = Self::load_run(conn, &id)? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    /// Status of a run, or `UnknownRun`.
    fn run_status(conn: &Connection, run_id: &str) -> Result<RunStatus> {
        let status: Option<String> = conn
            .query_row("SELECT status FROM runs WHERE id = ?", params![run_id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(TrackerError::read)?;
        let status = status.ok_or_unknown_run(run_id)?;
        RunStatus::parse(&status).ok_or_else(|| TrackerError::Internal {
            message: format!("run '{}' has unknown status '{}'", run_id, status),
        })
    }

    fn try_append_checkpoint(&self, run_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(TrackerError::write)?;

        Self::ensure_active(&tx, run_id)?;
        tx.execute(
            "INSERT INTO checkpoints (run_id, seq, latitude, longitude, timestamp)
             SELECT ?1, COALESCE(MAX(seq), -1) + 1, ?2, ?3, ?4
             FROM checkpoints WHERE run_id = ?1",
            params![
                run_id,
                checkpoint.latitude,
                checkpoint.longitude,
                checkpoint.timestamp
            ],
        )
        .map_err(TrackerError::write)?;

        tx.commit().map_err(TrackerError::write)
    }

    fn ensure_active(conn: &Connection, run_id: &str) -> Result<()> {
        match Self::run_status(conn, run_id)? {
            RunStatus::Active => Ok(()),
            RunStatus::Completed => Err(TrackerError::RunAlreadyCompleted {
                run_id: run_id.to_string(),
            }),
        }
    }
}

impl RunStore for SqliteStore {
    fn create_run(&self, new_run: NewRun) -> Result<Run> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(TrackerError::write)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM runs WHERE courier_id = ? AND status = 'active' LIMIT 1",
                params![new_run.courier_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(TrackerError::read)?;
        if let Some(run_id) = existing {
            return Err(TrackerError::AlreadyActive {
                courier_id: new_run.courier_id,
                run_id: Some(run_id),
            });
        }

        let run = new_run.into_run();
        let order_ids = serde_json::to_string(&run.order_ids).map_err(|e| TrackerError::Internal {
            message: e.to_string(),
        })?;
        tx.execute(
            "INSERT INTO runs (id, courier_id, vehicle_id, origin_unit_id, order_ids, start_time, status)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                run.id,
                run.courier_id,
                run.vehicle_id,
                run.origin_unit_id,
                order_ids,
                run.start_time,
                run.status.as_str()
            ],
        )
        .map_err(TrackerError::write)?;
        tx.commit().map_err(TrackerError::write)?;

        debug!("[SqliteStore] Created run {} for {}", run.id, run.courier_id);
        Ok(run)
    }

    fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        Self::load_run(&self.conn(), run_id)
    }

    fn find_active_runs(&self, courier_id: &str) -> Result<Vec<Run>> {
        Self::load_runs_where(
            &self.conn(),
            "SELECT id FROM runs WHERE courier_id = ? AND status = 'active'
             ORDER BY start_time, id",
            Some(courier_id),
        )
    }

    fn list_active_runs(&self) -> Result<Vec<Run>> {
        Self::load_runs_where(
            &self.conn(),
            "SELECT id FROM runs WHERE status = 'active' ORDER BY start_time, id",
            None,
        )
    }

    fn append_checkpoint(&self, run_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        // Lock contention in any step is a write failure
        self.try_append_checkpoint(run_id, checkpoint)
            .map_err(TrackerError::into_write_failure)
    }

    fn complete_run(&self, run_id: &str, end_time: i64, total_distance_meters: f64) -> Result<Run> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(TrackerError::write)?;

        Self::ensure_active(&tx, run_id)?;
        tx.execute(
            "UPDATE runs SET status = 'completed', end_time = ?, total_distance_meters = ?
             WHERE id = ? AND status = 'active'",
            params![end_time, total_distance_meters, run_id],
        )
        .map_err(TrackerError::write)?;
        tx.commit().map_err(TrackerError::write)?;

        Self::load_run(&conn, run_id)?.ok_or_unknown_run(run_id)
    }
}

impl VehicleStore for SqliteStore {
    fn get_vehicle(&self, vehicle_id: &str) -> Result<Option<Vehicle>> {
        self.conn()
            .query_row(
                "SELECT id, cumulative_distance_km FROM vehicles WHERE id = ?",
                params![vehicle_id],
                |row| {
                    Ok(Vehicle {
                        id: row.get(0)?,
                        cumulative_distance_km: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(TrackerError::read)
    }

    fn put_vehicle(&self, vehicle: &Vehicle) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO vehicles (id, cumulative_distance_km) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET cumulative_distance_km = ?2",
                params![vehicle.id, vehicle.cumulative_distance_km],
            )
            .map_err(TrackerError::write)?;
        Ok(())
    }

    fn add_distance(&self, vehicle_id: &str, run_id: &str, delta_km: f64) -> Result<Option<f64>> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(TrackerError::write)?;

        let recorded = tx
            .execute(
                "INSERT OR IGNORE INTO odometer_ledger (run_id, vehicle_id, delta_km, applied_at)
                 VALUES (?, ?, ?, ?)",
                params![run_id, vehicle_id, delta_km, now_ms()],
            )
            .map_err(TrackerError::write)?;
        if recorded == 0 {
            return Ok(None);
        }

        // Increment in place; never read-then-write
        let updated = tx
            .execute(
                "UPDATE vehicles SET cumulative_distance_km = cumulative_distance_km + ?
                 WHERE id = ?",
                params![delta_km, vehicle_id],
            )
            .map_err(TrackerError::write)?;
        if updated == 0 {
            return Err(TrackerError::VehicleNotFound {
                vehicle_id: vehicle_id.to_string(),
            });
        }

        let total: f64 = tx
            .query_row(
                "SELECT cumulative_distance_km FROM vehicles WHERE id = ?",
                params![vehicle_id],
                |row| row.get(0),
            )
            .map_err(TrackerError::read)?;
        tx.commit().map_err(TrackerError::write)?;

        Ok(Some(total))
    }

    fn ledger_total_km(&self, vehicle_id: &str) -> Result<f64> {
        self.conn()
            .query_row(
                "SELECT COALESCE(SUM(delta_km), 0.0) FROM odometer_ledger WHERE vehicle_id = ?",
                params![vehicle_id],
                |row| row.get(0),
            )
            .map_err(TrackerError::read)
    }
}

// ============================================================================
// Tests
// ============================================================================
