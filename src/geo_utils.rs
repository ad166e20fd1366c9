//! # Geographic Utilities
//!
//! Great-circle computations shared by the detectors.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`initial_bearing`] | Forward azimuth from one point towards another |
//! | [`point_to_segment_distance`] | Distance from a point to the nearest point of a great-circle segment |
//! | [`polyline_length`] | Total length of a route or track in meters |
//! | [`compute_bounds`] | Bounding box of a set of points |
//! | [`meters_to_degrees`] | Convert meters to approximate degrees at a latitude |
//!
//! ## Example
//!
//! ```rust
//! use tourist_anomaly::{GpsPoint, geo_utils};
//!
//! let start = GpsPoint::new(12.9716, 77.5946);
//! let end = GpsPoint::new(12.9756, 77.5986);
//! let off_route = GpsPoint::new(12.9740, 77.5950);
//!
//! let lateral = geo_utils::point_to_segment_distance(&off_route, &start, &end);
//! let to_start = geo_utils::haversine_distance(&off_route, &start);
//! assert!(lateral < to_start);
//! ```
//!
//! ## Algorithm Notes
//!
//! ### Point-to-segment distance
//!
//! The segment is treated as the great-circle arc between its endpoints. The
//! cross-track distance gives the lateral offset from the full great circle and
//! the along-track distance tells where the perpendicular foot lands. When the
//! foot falls before the start or past the end of the arc, the nearest endpoint
//! is used instead.
//!
//! Reference: [Movable Type, "Cross-track distance"](https://www.movable-type.co.uk/scripts/latlong.html)
//!
//! ### Coordinate System
//!
//! All functions expect WGS84 coordinates (latitude/longitude in degrees).

use geo::{Distance, Haversine, Point};

use crate::{Bounds, GpsPoint};

/// Mean earth radius used by `geo::Haversine`, so cross-track values agree with
/// [`haversine_distance`].
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

// =============================================================================
// Distance Functions
// =============================================================================

/// Calculate the great-circle distance between two GPS points using the Haversine formula.
///
/// # Example
///
/// ```rust
/// use tourist_anomaly::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0);
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Initial bearing (forward azimuth) from `from` towards `to`, in radians
/// measured clockwise from north.
pub fn initial_bearing(from: &GpsPoint, to: &GpsPoint) -> f64 {
    let phi1 = from.latitude.to_radians();
    let phi2 = to.latitude.to_radians();
    let delta_lambda = (to.longitude - from.longitude).to_radians();

    let y = delta_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * delta_lambda.cos();
    y.atan2(x)
}

/// Distance in meters from `point` to the closest point of the great-circle
/// segment `start`-`end`.
///
/// Degenerate segments (coincident endpoints) fall back to plain point distance.
///
/// # Example
///
/// ```rust
/// use tourist_anomaly::{GpsPoint, geo_utils};
///
/// let a = GpsPoint::new(0.0, 0.0);
/// let b = GpsPoint::new(0.0, 1.0);
///
/// // Directly "above" the middle of the segment: lateral distance only
/// let p = GpsPoint::new(0.001, 0.5);
/// let d = geo_utils::point_to_segment_distance(&p, &a, &b);
/// assert!((d - 111.2).abs() < 1.0);
/// ```
pub fn point_to_segment_distance(point: &GpsPoint, start: &GpsPoint, end: &GpsPoint) -> f64 {
    let segment_length = haversine_distance(start, end);
    let to_start = haversine_distance(start, point);

    if segment_length <= f64::EPSILON || to_start <= f64::EPSILON {
        return to_start;
    }

    let angle = initial_bearing(start, point) - initial_bearing(start, end);

    // Perpendicular foot lies behind the start of the segment
    if angle.cos() < 0.0 {
        return to_start;
    }

    let angular_to_start = to_start / EARTH_RADIUS_METERS;
    let cross_track = (angular_to_start.sin() * angle.sin()).clamp(-1.0, 1.0).asin();
    let along_track = (angular_to_start.cos() / cross_track.cos())
        .clamp(-1.0, 1.0)
        .acos()
        * EARTH_RADIUS_METERS;

    if along_track > segment_length {
        return haversine_distance(point, end);
    }

    cross_track.abs() * EARTH_RADIUS_METERS
}

/// Calculate the total length of a polyline in meters.
///
/// Empty or single-point inputs return 0.0.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Convert meters to approximate degrees at a given latitude.
///
/// Uses the longitude scale (the smaller one), so the result is a conservative
/// (larger) square buffer suitable for bounding box queries.
#[inline]
pub fn meters_to_degrees(meters: f64, latitude: f64) -> f64 {
    let lat_rad = latitude.to_radians();
    let meters_per_degree = 111_320.0 * lat_rad.cos().max(0.1);
    meters / meters_per_degree
}

// =============================================================================
// Bounding Box Functions
// =============================================================================

/// Compute the bounding box of a set of points.
///
/// For empty input, returns a bounds with MIN/MAX values that contains nothing.
pub fn compute_bounds(points: &[GpsPoint]) -> Bounds {
    let mut min_lat = f64::MAX;
    let mut max_lat = f64::MIN;
    let mut min_lng = f64::MAX;
    let mut max_lng = f64::MIN;

    for p in points {
        min_lat = min_lat.min(p.latitude);
        max_lat = max_lat.max(p.latitude);
        min_lng = min_lng.min(p.longitude);
        max_lng = max_lng.max(p.longitude);
    }

    Bounds { min_lat, max_lat, min_lng, max_lng }
}

// =============================================================================
// Unit Tests
// =============================================================================
