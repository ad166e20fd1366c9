//! Route deviation detection.
//!
//! The planned route is a polyline of waypoints. A fix deviates when its
//! great-circle distance to the nearest segment exceeds the configured
//! threshold. Segments are kept in an R-tree so long routes only measure the
//! handful of segments near the fix.

use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::geo_utils::{
    compute_bounds, haversine_distance, meters_to_degrees, point_to_segment_distance,
    polyline_length,
};
use crate::{AnomalyEvent, AnomalyKind, GpsFix, GpsPoint};

/// Configuration for route deviation detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Ordered waypoints of the planned route.
    /// Default: the five-waypoint demo route in central Bangalore
    pub planned_route: Vec<GpsPoint>,

    /// Distance from the route beyond which a fix is anomalous (strictly greater).
    /// Default: 200.0 meters
    pub deviation_threshold_meters: f64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            planned_route: vec![
                GpsPoint::new(12.9716, 77.5946),
                GpsPoint::new(12.9726, 77.5956),
                GpsPoint::new(12.9736, 77.5966),
                GpsPoint::new(12.9746, 77.5976),
                GpsPoint::new(12.9756, 77.5986),
            ],
            deviation_threshold_meters: 200.0,
        }
    }
}

/// One leg of the planned route (used for spatial indexing).
#[derive(Debug, Clone)]
struct RouteSegment {
    start: GpsPoint,
    end: GpsPoint,
}

impl RTreeObject for RouteSegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        let bounds = compute_bounds(&[self.start, self.end]);
        AABB::from_corners([bounds.min_lng, bounds.min_lat], [bounds.max_lng, bounds.max_lat])
    }
}

/// Immutable planned route with a segment index.
#[derive(Debug, Clone)]
pub struct PlannedRoute {
    waypoints: Vec<GpsPoint>,
    segments: RTree<RouteSegment>,
}

impl PlannedRoute {
    /// Build a route from waypoints. Invalid waypoints are dropped.
    pub fn new(waypoints: &[GpsPoint]) -> Self {
        let waypoints: Vec<GpsPoint> = waypoints.iter().copied().filter(|p| p.is_valid()).collect();
        let segments: Vec<RouteSegment> = waypoints
            .windows(2)
            .map(|w| RouteSegment { start: w[0], end: w[1] })
            .collect();

        Self { waypoints, segments: RTree::bulk_load(segments) }
    }

    pub fn waypoints(&self) -> &[GpsPoint] {
        &self.waypoints
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn length_meters(&self) -> f64 {
        polyline_length(&self.waypoints)
    }

    /// Minimum distance in meters from `point` to the route, or `None` for an
    /// empty route.
    ///
    /// `search_radius` only narrows which segments are measured first; the
    /// result is exact regardless of its value.
    pub fn distance_to(&self, point: &GpsPoint, search_radius: f64) -> Option<f64> {
        match self.waypoints.as_slice() {
            [] => None,
            [only] => Some(haversine_distance(point, only)),
            _ => {
                let buffer = meters_to_degrees(search_radius.max(0.0), point.latitude);
                let search = AABB::from_corners(
                    [point.longitude - buffer, point.latitude - buffer],
                    [point.longitude + buffer, point.latitude + buffer],
                );

                let nearby = self
                    .segments
                    .locate_in_envelope_intersecting(&search)
                    .map(|s| point_to_segment_distance(point, &s.start, &s.end))
                    .fold(f64::INFINITY, f64::min);

                if nearby <= search_radius {
                    return Some(nearby);
                }

                // Nothing within the radius; measure everything for the exact figure
                Some(
                    self.segments
                        .iter()
                        .map(|s| point_to_segment_distance(point, &s.start, &s.end))
                        .fold(f64::INFINITY, f64::min),
                )
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteDeviationDetector {
    route: PlannedRoute,
    threshold_meters: f64,
}

impl RouteDeviationDetector {
    pub fn new(config: &RouteConfig) -> Self {
        let route = PlannedRoute::new(&config.planned_route);
        log::info!(
            "[route] planned route: {} waypoints, {:.0}m, threshold {:.0}m",
            route.waypoints().len(),
            route.length_meters(),
            config.deviation_threshold_meters
        );
        Self { route, threshold_meters: config.deviation_threshold_meters }
    }

    pub fn route(&self) -> &PlannedRoute {
        &self.route
    }

    pub fn threshold_meters(&self) -> f64 {
        self.threshold_meters
    }

    pub fn distance_from_route(&self, point: &GpsPoint) -> Option<f64> {
        self.route.distance_to(point, self.threshold_meters)
    }

    /// Flag `fix` if it lies strictly farther than the threshold from the route.
    /// An empty route never triggers.
    pub fn evaluate(&self, fix: &GpsFix) -> Option<AnomalyEvent> {
        let distance = self.distance_from_route(&fix.location)?;
        if distance <= self.threshold_meters {
            return None;
        }

        Some(AnomalyEvent::for_fix(
            fix,
            AnomalyKind::RouteDeviation,
            format!("Deviated {:.0}m from planned route", distance),
            distance / self.threshold_meters,
        ))
    }
}
