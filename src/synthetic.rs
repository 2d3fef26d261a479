//! Simulated GPS feed.
//!
//! Emits positions along a straight bearing at constant speed, one step per
//! tick, through the same sampling filter a real source applies. Used by the
//! demo and for soak-testing the checkpoint pipeline without a device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot};

use crate::geo_utils::destination_point;
use crate::position::{
    PositionSource, PositionSubscription, SamplingFilter, SamplingPolicy, SubscriptionGuard,
};
use crate::{now_ms, Checkpoint, GpsPoint, Result, TrackerError};

/// A straight-line trip.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticRoute {
    pub origin: GpsPoint,
    /// Degrees clockwise from north
    pub bearing_degrees: f64,
    pub speed_mps: f64,
    /// Simulated time between consecutive positions
    pub step_ms: u64,
    /// Wall-clock time between consecutive positions
    pub tick: Duration,
    /// Number of positions to generate; `None` runs until released
    pub steps: Option<u32>,
}

impl SyntheticRoute {
    pub fn new(origin: GpsPoint, bearing_degrees: f64, speed_mps: f64) -> Self {
        Self {
            origin,
            bearing_degrees,
            speed_mps,
            step_ms: 1_000,
            tick: Duration::from_millis(1_000),
            steps: None,
        }
    }

    /// Position and timestamp of step `i`.
    pub fn sample(&self, start_time: i64, i: u32) -> Checkpoint {
        let elapsed_ms = self.step_ms * u64::from(i);
        let traveled = self.speed_mps * elapsed_ms as f64 / 1000.0;
        let point = destination_point(&self.origin, self.bearing_degrees, traveled);
        Checkpoint::new(point.latitude, point.longitude, start_time + elapsed_ms as i64)
    }
}

/// [`PositionSource`] backed by [`SyntheticRoute`]s.
///
/// Couriers without a route of their own follow the default route.
/// Subscribing requires a running tokio runtime.
pub struct SyntheticPositionSource {
    default_route: SyntheticRoute,
    routes: Mutex<HashMap<String, SyntheticRoute>>,
    permitted: AtomicBool,
    capacity: usize,
}

impl SyntheticPositionSource {
    pub fn new(default_route: SyntheticRoute, capacity: usize) -> Self {
        Self {
            default_route,
            routes: Mutex::new(HashMap::new()),
            permitted: AtomicBool::new(true),
            capacity: capacity.max(1),
        }
    }

    pub fn set_route(&self, courier_id: &str, route: SyntheticRoute) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(courier_id.to_string(), route);
    }

    pub fn set_permission(&self, granted: bool) {
        self.permitted.store(granted, Ordering::SeqCst);
    }

    fn route_for(&self, courier_id: &str) -> SyntheticRoute {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(courier_id)
            .cloned()
            .unwrap_or_else(|| self.default_route.clone())
    }
}

impl PositionSource for SyntheticPositionSource {
    fn subscribe(&self, courier_id: &str, policy: &SamplingPolicy) -> Result<PositionSubscription> {
        if !self.permitted.load(Ordering::SeqCst) {
            return Err(TrackerError::PermissionDenied {
                message: format!("simulated location disabled for courier '{}'", courier_id),
            });
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| TrackerError::Internal {
            message: format!("synthetic source needs a tokio runtime: {}", e),
        })?;

        let route = self.route_for(courier_id);
        let (sender, receiver) = mpsc::channel(self.capacity);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        info!(
            "[SyntheticPositionSource] Subscribed {} (bearing {:.0}°, {:.1} m/s)",
            courier_id, route.bearing_degrees, route.speed_mps
        );
        runtime.spawn(feed(
            courier_id.to_string(),
            route,
            SamplingFilter::new(policy.clone()),
            sender,
            stop_rx,
        ));

        // Dropping the sender wakes the feed task
        let guard = SubscriptionGuard::new(move || drop(stop_tx));
        Ok(PositionSubscription::new(receiver, guard))
    }
}

async fn feed(
    courier_id: String,
    route: SyntheticRoute,
    mut filter: SamplingFilter,
    sender: mpsc::Sender<Checkpoint>,
    mut stop: oneshot::Receiver<()>,
) {
    let start_time = now_ms();
    let mut ticker = tokio::time::interval(route.tick);
    let mut step = 0u32;

    loop {
        if route.steps.is_some_and(|limit| step >= limit) {
            debug!("[SyntheticPositionSource] Route for {} finished", courier_id);
            break;
        }

        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }

        let sample = route.sample(start_time, step);
        step += 1;
        if filter.offer(sample) && sender.send(sample).await.is_err() {
            break;
        }
    }

    info!(
        "[SyntheticPositionSource] Feed for {} stopped after {} steps",
        courier_id, step
    );
}
