//! # Position Sources
//!
//! A position source turns platform location updates into a stream of
//! [`Checkpoint`]s for one courier. Each subscription is a channel receiver
//! plus a [`SubscriptionGuard`]; the receiver is handed to the run's writer
//! task, the guard stays with the controller and releases the platform
//! listener when dropped.
//!
//! Sampling policy (minimum displacement and minimum interval) is enforced
//! here, by the source, not by the consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::geo_utils::haversine_distance;
use crate::{Checkpoint, Result, TrackerError};

/// Minimum displacement and minimum elapsed time between accepted samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingPolicy {
    /// Default: 10.0 meters
    pub min_distance_meters: f64,
    /// Default: 5000 ms
    pub min_interval_ms: u64,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            min_distance_meters: 10.0,
            min_interval_ms: 5_000,
        }
    }
}

/// Stateful gate applying a [`SamplingPolicy`] to a sample stream.
///
/// The first sample is always accepted. Later samples must be both far
/// enough from and late enough after the last accepted one.
#[derive(Debug, Clone)]
pub struct SamplingFilter {
    policy: SamplingPolicy,
    last: Option<Checkpoint>,
}

impl SamplingFilter {
    pub fn new(policy: SamplingPolicy) -> Self {
        Self { policy, last: None }
    }

    /// Check a sample without recording it.
    pub fn accepts(&self, sample: &Checkpoint) -> bool {
        match &self.last {
            None => true,
            Some(last) => {
                let elapsed = sample.timestamp.saturating_sub(last.timestamp);
                elapsed >= self.policy.min_interval_ms as i64
                    && haversine_distance(last, sample) >= self.policy.min_distance_meters
            }
        }
    }

    /// Record a sample as the new reference point.
    pub fn record(&mut self, sample: Checkpoint) {
        self.last = Some(sample);
    }

    /// Accept-and-record in one step.
    pub fn offer(&mut self, sample: Checkpoint) -> bool {
        if self.accepts(&sample) {
            self.record(sample);
            true
        } else {
            false
        }
    }
}

/// Releases a live position listener when dropped.
pub struct SubscriptionGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionGuard {
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A guard with nothing to release (sources whose stream ends on its own).
    pub fn noop() -> Self {
        Self { release: None }
    }

    /// Release now rather than at end of scope.
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("live", &self.release.is_some())
            .finish()
    }
}

/// An open position subscription.
#[derive(Debug)]
pub struct PositionSubscription {
    pub samples: mpsc::Receiver<Checkpoint>,
    pub guard: SubscriptionGuard,
}

impl PositionSubscription {
    pub fn new(samples: mpsc::Receiver<Checkpoint>, guard: SubscriptionGuard) -> Self {
        Self { samples, guard }
    }

    pub fn into_parts(self) -> (mpsc::Receiver<Checkpoint>, SubscriptionGuard) {
        (self.samples, self.guard)
    }
}

/// An authorized source of position samples.
pub trait PositionSource: Send + Sync {
    /// Open a subscription for one courier under the given sampling policy.
    ///
    /// Fails with [`TrackerError::PermissionDenied`] when location access is
    /// not granted.
    fn subscribe(&self, courier_id: &str, policy: &SamplingPolicy) -> Result<PositionSubscription>;
}

// ============================================================================
// Manual (push-driven) source
// ============================================================================

struct Feed {
    id: u64,
    sender: mpsc::Sender<Checkpoint>,
    filter: SamplingFilter,
}

type FeedMap = Arc<Mutex<HashMap<String, Feed>>>;

/// Push-driven position source.
///
/// Platform code (or a test) calls [`push`](Self::push) with each location
/// update; the sample is filtered and forwarded to the courier's live
/// subscription, if any.
pub struct ManualPositionSource {
    feeds: FeedMap,
    next_id: AtomicU64,
    permitted: AtomicBool,
    capacity: usize,
}

impl ManualPositionSource {
    /// Create a source whose subscriptions buffer up to `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            feeds: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            permitted: AtomicBool::new(true),
            capacity: capacity.max(1),
        }
    }

    pub fn grant_permission(&self) {
        self.permitted.store(true, Ordering::SeqCst);
    }

    /// Revoke location permission. Existing subscriptions keep running;
    /// new subscriptions fail.
    pub fn revoke_permission(&self) {
        self.permitted.store(false, Ordering::SeqCst);
    }

    pub fn has_permission(&self) -> bool {
        self.permitted.load(Ordering::SeqCst)
    }

    /// Whether a live subscription exists for the courier.
    pub fn is_subscribed(&self, courier_id: &str) -> bool {
        self.feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(courier_id)
    }

    /// Offer a location update for a courier.
    ///
    /// Returns `true` if the sample passed the sampling policy and was
    /// delivered to a live subscription.
    pub fn push(&self, courier_id: &str, latitude: f64, longitude: f64, timestamp: i64) -> bool {
        let sample = Checkpoint::new(latitude, longitude, timestamp);
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(feed) = feeds.get_mut(courier_id) else {
            debug!("[ManualPositionSource] No subscription for {}, sample ignored", courier_id);
            return false;
        };

        if !feed.filter.accepts(&sample) {
            return false;
        }

        match feed.sender.try_send(sample) {
            Ok(()) => {
                feed.filter.record(sample);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "[ManualPositionSource] Buffer full for {}, sample at {} dropped",
                    courier_id, timestamp
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                feeds.remove(courier_id);
                false
            }
        }
    }
}

impl PositionSource for ManualPositionSource {
    fn subscribe(&self, courier_id: &str, policy: &SamplingPolicy) -> Result<PositionSubscription> {
        if !self.has_permission() {
            return Err(TrackerError::PermissionDenied {
                message: format!("location access not granted for courier '{}'", courier_id),
            });
        }

        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let replaced = self
            .feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                courier_id.to_string(),
                Feed {
                    id,
                    sender,
                    filter: SamplingFilter::new(policy.clone()),
                },
            );
        if replaced.is_some() {
            warn!("[ManualPositionSource] Replaced existing subscription for {}", courier_id);
        }
        info!("[ManualPositionSource] Subscribed {} (#{})", courier_id, id);

        let feeds = Arc::clone(&self.feeds);
        let courier = courier_id.to_string();
        let guard = SubscriptionGuard::new(move || {
            let mut feeds = feeds.lock().unwrap_or_else(PoisonError::into_inner);
            // A newer subscription may have replaced this one
            if feeds.get(&courier).map(|f| f.id) == Some(id) {
                feeds.remove(&courier);
                info!("[ManualPositionSource] Released {} (#{})", courier, id);
            }
        });

        Ok(PositionSubscription::new(receiver, guard))
    }
}
