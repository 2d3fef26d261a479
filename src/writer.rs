//! Single-writer checkpoint pipeline.
//!
//! One task per live run owns the sample receiver and performs every append
//! for that run, so appends for a run never interleave.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::retry::RetryPolicy;
use crate::store::RunStore;
use crate::{Checkpoint, Result, RunId, TrackerError};

/// Counters for one run's writer.
#[derive(Debug, Default)]
pub(crate) struct WriterStats {
    appended: AtomicU32,
    rejected: AtomicU32,
    failed: AtomicU32,
    closed: AtomicBool,
}

impl WriterStats {
    pub(crate) fn appended(&self) -> u32 {
        self.appended.load(Ordering::Relaxed)
    }

    pub(crate) fn rejected(&self) -> u32 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub(crate) fn failed(&self) -> u32 {
        self.failed.load(Ordering::Relaxed)
    }

    /// The run stopped accepting checkpoints.
    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// Why a writer stopped.
#[derive(Debug, Clone)]
pub(crate) enum WriterExit {
    /// The sample stream closed (subscription released).
    StreamClosed,
    /// The run can no longer accept checkpoints.
    RunClosed(TrackerError),
}

pub(crate) struct CheckpointWriter {
    pub run_id: RunId,
    pub store: Arc<dyn RunStore>,
    pub retry: RetryPolicy,
    pub stats: Arc<WriterStats>,
    /// Timestamp of the last persisted checkpoint (resume seeds this)
    pub last_timestamp: Option<i64>,
}

impl CheckpointWriter {
    /// Consume samples until the stream closes or the run stops accepting
    /// writes.
    pub(crate) async fn run(mut self, mut samples: mpsc::Receiver<Checkpoint>) -> WriterExit {
        debug!("[CheckpointWriter] Started for run {}", self.run_id);

        while let Some(sample) = samples.recv().await {
            if let Err(reason) = self.validate(&sample) {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("[CheckpointWriter] Run {}: {}", self.run_id, reason);
                continue;
            }

            match self.append_with_retry(&sample).await {
                Ok(()) => {
                    self.last_timestamp = Some(sample.timestamp);
                    self.stats.appended.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.closes_run() => {
                    warn!(
                        "[CheckpointWriter] Run {} no longer accepts checkpoints: {}",
                        self.run_id, e
                    );
                    self.stats.closed.store(true, Ordering::Relaxed);
                    return WriterExit::RunClosed(e);
                }
                Err(e) => {
                    // One lost checkpoint only degrades distance accuracy
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "[CheckpointWriter] Run {}: dropping checkpoint at {}: {}",
                        self.run_id, sample.timestamp, e
                    );
                }
            }
        }

        info!(
            "[CheckpointWriter] Run {} stream closed ({} appended, {} rejected, {} failed)",
            self.run_id,
            self.stats.appended(),
            self.stats.rejected(),
            self.stats.failed()
        );
        WriterExit::StreamClosed
    }

    fn validate(&self, sample: &Checkpoint) -> std::result::Result<(), TrackerError> {
        if !sample.point().is_valid() {
            return Err(TrackerError::InvalidCheckpoint {
                message: format!(
                    "coordinates out of range ({}, {})",
                    sample.latitude, sample.longitude
                ),
            });
        }
        if let Some(last) = self.last_timestamp {
            if sample.timestamp < last {
                return Err(TrackerError::InvalidCheckpoint {
                    message: format!(
                        "timestamp {} precedes last checkpoint {}",
                        sample.timestamp, last
                    ),
                });
            }
        }
        Ok(())
    }

    async fn append_with_retry(&self, sample: &Checkpoint) -> Result<()> {
        let attempts = self.retry.max_attempts.max(1);
        let mut retry = 0;
        loop {
            match self.store.append_checkpoint(&self.run_id, sample) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && retry + 1 < attempts => {
                    let delay = self.retry.delay_for(retry);
                    warn!(
                        "[CheckpointWriter] Run {}: append failed ({}), retrying in {:?}",
                        self.run_id, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
