//! Movement features for the pattern model.
//!
//! One vector per fix that has a predecessor:
//! `[distance_from_prev_m, time_delta_s, speed_mps, lat, lon]`.

use std::fmt;

use crate::geo_utils::haversine_distance;
use crate::GpsFix;

/// Number of columns in a [`FeatureVector`].
pub const FEATURE_COUNT: usize = 5;

pub const FEATURE_NAMES: [&str; FEATURE_COUNT] =
    ["distance_from_prev_m", "time_delta_s", "speed_mps", "lat", "lon"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector(pub [f64; FEATURE_COUNT]);

impl FeatureVector {
    /// Features of `current` relative to the fix immediately before it.
    pub fn between(previous: &GpsFix, current: &GpsFix) -> Self {
        let distance = haversine_distance(&previous.location, &current.location);
        let time_delta = (current.timestamp - previous.timestamp).num_milliseconds() as f64 / 1000.0;
        // Ordering guarantees time_delta > 0 for stored tracks; guard anyway so a
        // zero gap cannot produce inf/NaN
        let speed = if time_delta > 0.0 { distance / time_delta } else { 0.0 };

        Self([
            distance,
            time_delta,
            speed,
            current.location.latitude,
            current.location.longitude,
        ])
    }

    pub fn values(&self) -> &[f64; FEATURE_COUNT] {
        &self.0
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

impl fmt::Display for FeatureVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in FEATURE_NAMES.iter().zip(self.0.iter()).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:.4}", name, value)?;
        }
        Ok(())
    }
}

/// Feature vectors for every consecutive pair of fixes of the same tourist.
///
/// `fixes` must be grouped by tourist and time-ordered within each group, as
/// produced by [`HistoryStore::all_fixes`](crate::HistoryStore::all_fixes).
pub fn extract_training_set(fixes: &[GpsFix]) -> Vec<FeatureVector> {
    fixes
        .windows(2)
        .filter(|w| w[0].tourist_id == w[1].tourist_id)
        .map(|w| FeatureVector::between(&w[0], &w[1]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GpsPoint;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_features_between_fixes() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        let a = GpsFix::new(1, GpsPoint::new(0.0, 0.0), t0);
        let b = GpsFix::new(1, GpsPoint::new(0.001, 0.0), t0 + Duration::seconds(100));

        let f = FeatureVector::between(&a, &b);
        let [distance, dt, speed, lat, lon] = *f.values();
        assert!((distance - 111.19).abs() < 0.1);
        assert_eq!(dt, 100.0);
        assert!((speed - distance / 100.0).abs() < 1e-12);
        assert_eq!(lat, 0.001);
        assert_eq!(lon, 0.0);
        assert!(f.is_finite());
        assert!(f.to_string().starts_with("distance_from_prev_m=111.19"));
        assert!(f.to_string().ends_with("lon=0.0000"));
    }

    #[test]
    fn test_training_set_skips_tourist_boundaries() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        let fixes: Vec<GpsFix> = [(1, 0), (1, 1), (1, 2), (2, 0), (2, 1)]
            .iter()
            .map(|&(id, m)| GpsFix::new(id, GpsPoint::new(12.97, 77.59), t0 + Duration::minutes(m)))
            .collect();

        // Two pairs for tourist 1, one for tourist 2
        assert_eq!(extract_training_set(&fixes).len(), 3);
    }

    #[test]
    fn test_training_set_of_single_fix_is_empty() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        let fixes = vec![GpsFix::new(1, GpsPoint::new(12.97, 77.59), t0)];
        assert!(extract_training_set(&fixes).is_empty());
    }
}
