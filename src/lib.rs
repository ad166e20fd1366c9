//! # Tourist Anomaly
//!
//! Real-time anomaly detection for streams of tourist GPS fixes.
//!
//! Every fix is checked by three detectors before it is appended to the
//! tourist's history:
//! - **Route deviation**: lateral distance from the planned route
//! - **Stop**: dwelling in one place for too long
//! - **Pattern**: an isolation forest over movement features, retrained on
//!   accumulated history
//!
//! ## Features
//!
//! - **`parallel`** - Evaluate batches per tourist with rayon and retrain on the rayon pool
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use tourist_anomaly::{AnomalyEngine, AnomalyKind, EngineConfig, GpsFix, GpsPoint};
//!
//! let engine = AnomalyEngine::new(EngineConfig::default()).unwrap();
//! let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
//!
//! // On the planned route
//! let verdict = engine
//!     .evaluate_fix(GpsFix::new(1, GpsPoint::new(12.9716, 77.5946), t0))
//!     .unwrap();
//! assert!(verdict.is_normal());
//!
//! // ~512m away from it
//! let later = t0 + chrono::Duration::minutes(5);
//! let verdict = engine
//!     .evaluate_fix(GpsFix::new(1, GpsPoint::new(12.9800, 77.6000), later))
//!     .unwrap();
//! assert_eq!(verdict.anomalies[0].kind, AnomalyKind::RouteDeviation);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod error;
pub use error::{ConfigError, InputError, TrainingError};

pub mod geo_utils;

pub mod history;
pub use history::{HistoryStore, TouristTrack, TrackHistory};

pub mod route;
pub use route::{PlannedRoute, RouteConfig, RouteDeviationDetector};

pub mod stop;
pub use stop::{DwellAssessment, DwellWindow, StopConfig, StopDetector};

pub mod features;
pub use features::FeatureVector;

pub mod isolation_forest;
pub use isolation_forest::OutlierModel;

pub mod pattern;
pub use pattern::{ModelHandle, PatternConfig, PatternDetector};

pub mod stats;
pub use stats::{StatsEngine, StatsSnapshot};

pub mod engine;
pub use engine::{AnomalyEngine, EngineConfig, FixVerdict, Status};

pub mod wire;
pub use wire::{
    AnomalyDetail, BatchEntry, CheckResponse, FixRequest, HealthReport, HistoryEntry,
    HistoryResponse, Location,
};

// ============================================================================
// Core Types
// ============================================================================

/// Identifier of a tracked tourist.
pub type TouristId = i64;

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use tourist_anomaly::GpsPoint;
/// let point = GpsPoint::new(12.9716, 77.5946); // Bangalore
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

/// A single position report from a tourist's device. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct GpsFix {
    pub tourist_id: TouristId,
    pub location: GpsPoint,
    pub timestamp: DateTime<Utc>,
    /// Panic-button flag raised by the device. Counted in stats, does not
    /// change detection output.
    pub emergency: bool,
}

impl GpsFix {
    pub fn new(tourist_id: TouristId, location: GpsPoint, timestamp: DateTime<Utc>) -> Self {
        Self { tourist_id, location, timestamp, emergency: false }
    }

    pub fn with_emergency(mut self, emergency: bool) -> Self {
        self.emergency = emergency;
        self
    }

    /// Reject coordinates outside the WGS84 range (or NaN).
    pub fn validate(&self) -> Result<(), InputError> {
        let lat = self.location.latitude;
        let lon = self.location.longitude;
        if !(lat.is_finite() && (-90.0..=90.0).contains(&lat)) {
            return Err(InputError::LatitudeOutOfRange(lat));
        }
        if !(lon.is_finite() && (-180.0..=180.0).contains(&lon)) {
            return Err(InputError::LongitudeOutOfRange(lon));
        }
        Ok(())
    }
}

/// The closed set of anomaly types, in reporting priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    RouteDeviation,
    StoppedTooLong,
    MlPatternAnomaly,
}

impl AnomalyKind {
    /// All kinds, highest priority first.
    pub const ALL: [AnomalyKind; 3] = [
        AnomalyKind::RouteDeviation,
        AnomalyKind::StoppedTooLong,
        AnomalyKind::MlPatternAnomaly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::RouteDeviation => "route_deviation",
            AnomalyKind::StoppedTooLong => "stopped_too_long",
            AnomalyKind::MlPatternAnomaly => "ml_pattern_anomaly",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detector finding for one fix. Produced, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyEvent {
    pub tourist_id: TouristId,
    pub timestamp: DateTime<Utc>,
    pub location: GpsPoint,
    pub kind: AnomalyKind,
    pub reason: String,
    /// Detector value relative to its threshold (1.0 = exactly at threshold).
    pub confidence: f64,
}

impl AnomalyEvent {
    pub(crate) fn for_fix(fix: &GpsFix, kind: AnomalyKind, reason: String, confidence: f64) -> Self {
        Self {
            tourist_id: fix.tourist_id,
            timestamp: fix.timestamp,
            location: fix.location,
            kind,
            reason,
            confidence,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
    }

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(12.9716, 77.5946).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_fix_validate_reports_offending_axis() {
        let bad_lat = GpsFix::new(1, GpsPoint::new(-90.5, 0.0), t0());
        assert_eq!(bad_lat.validate(), Err(InputError::LatitudeOutOfRange(-90.5)));

        let bad_lon = GpsFix::new(1, GpsPoint::new(0.0, 180.5), t0());
        assert_eq!(bad_lon.validate(), Err(InputError::LongitudeOutOfRange(180.5)));

        let edge = GpsFix::new(1, GpsPoint::new(90.0, -180.0), t0());
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn test_anomaly_kind_order_and_names() {
        let mut kinds = vec![
            AnomalyKind::MlPatternAnomaly,
            AnomalyKind::RouteDeviation,
            AnomalyKind::StoppedTooLong,
        ];
        kinds.sort();
        assert_eq!(kinds, AnomalyKind::ALL.to_vec());
        assert_eq!(
            serde_json::to_string(&AnomalyKind::StoppedTooLong).unwrap(),
            "\"stopped_too_long\""
        );
        assert_eq!(AnomalyKind::MlPatternAnomaly.to_string(), "ml_pattern_anomaly");
    }
}
