//! Geographic utilities.
//!
//! Spherical-Earth math only; no ellipsoid correction. At intra-city delivery
//! scales the error is well below GPS noise.

use crate::{Checkpoint, GpsPoint};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Anything carrying a latitude/longitude pair in degrees.
pub trait LatLng {
    fn lat(&self) -> f64;
    fn lng(&self) -> f64;
}

impl LatLng for GpsPoint {
    fn lat(&self) -> f64 {
        self.latitude
    }

    fn lng(&self) -> f64 {
        self.longitude
    }
}

impl LatLng for Checkpoint {
    fn lat(&self) -> f64 {
        self.latitude
    }

    fn lng(&self) -> f64 {
        self.longitude
    }
}

/// Great-circle distance between two points in meters (haversine formula).
///
/// # Example
/// ```
/// use run_tracker::{haversine_distance, GpsPoint};
///
/// let a = GpsPoint::new(0.0, 0.0);
/// let b = GpsPoint::new(0.001, 0.0);
/// assert!((haversine_distance(&a, &b) - 111.19).abs() < 0.01);
/// ```
pub fn haversine_distance<P: LatLng + ?Sized>(p1: &P, p2: &P) -> f64 {
    let lat1 = p1.lat().to_radians();
    let lat2 = p2.lat().to_radians();
    let dlat = (p2.lat() - p1.lat()).to_radians();
    let dlng = (p2.lng() - p1.lng()).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    // Clamp guards against a > 1 from rounding on antipodal pairs
    let c = 2.0 * a.sqrt().min(1.0).asin();

    EARTH_RADIUS_METERS * c
}

/// Total length of a polyline: the sum of haversine distances between
/// consecutive points. Zero for fewer than two points.
pub fn polyline_length<P: LatLng>(points: &[P]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Distance traveled over a run's checkpoint sequence, in meters.
pub fn run_distance(checkpoints: &[Checkpoint]) -> f64 {
    polyline_length(checkpoints)
}

/// Convert a distance in meters to degrees of latitude.
pub fn meters_to_degrees(meters: f64) -> f64 {
    (meters / EARTH_RADIUS_METERS).to_degrees()
}

/// Point reached by traveling `distance` meters from `origin` on an initial
/// `bearing` (degrees clockwise from north).
pub fn destination_point(origin: &GpsPoint, bearing: f64, distance: f64) -> GpsPoint {
    let delta = distance / EARTH_RADIUS_METERS;
    let theta = bearing.to_radians();
    let lat1 = origin.latitude.to_radians();
    let lng1 = origin.longitude.to_radians();

    let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * theta.cos()).asin();
    let lng2 = lng1
        + (theta.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());

    // Normalize longitude to [-180, 180)
    let lng2 = (lng2.to_degrees() + 540.0) % 360.0 - 180.0;
    GpsPoint::new(lat2.to_degrees(), lng2)
}
