//! Dwell-time detection.
//!
//! A tourist is dwelling while each new fix lands within a small radius of the
//! fixes before it. The dwell window starts at the earliest fix of that trailing
//! run; once it has lasted `stop_threshold_minutes` the window is reported,
//! exactly once, and stays quiet until the tourist moves away.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo_utils::haversine_distance;
use crate::history::TouristTrack;
use crate::{AnomalyEvent, AnomalyKind, GpsFix};

/// Configuration for stop detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    /// Dwell duration that counts as stopped too long.
    /// Default: 5 minutes
    pub stop_threshold_minutes: f64,

    /// Fixes within this distance of the current fix belong to the same dwell.
    /// Default: 10 meters (typical consumer GPS noise)
    pub proximity_radius_meters: f64,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            stop_threshold_minutes: 5.0,
            proximity_radius_meters: 10.0,
        }
    }
}

/// Per-tourist dwell state as of the most recent stored fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwellWindow {
    Moving,
    Dwelling {
        /// Timestamp of the earliest fix in the window
        since: DateTime<Utc>,
        /// Whether this window already produced an anomaly
        reported: bool,
    },
}

/// Outcome of evaluating one fix: an optional anomaly plus the dwell state to
/// store alongside the fix once it is appended.
#[derive(Debug, Clone, PartialEq)]
pub struct DwellAssessment {
    pub event: Option<AnomalyEvent>,
    pub window: DwellWindow,
}

#[derive(Debug, Clone)]
pub struct StopDetector {
    config: StopConfig,
}

impl StopDetector {
    pub fn new(config: StopConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StopConfig {
        &self.config
    }

    /// Evaluate `fix` against the tourist's stored history (which must not yet
    /// contain `fix`).
    pub fn evaluate(&self, track: &TouristTrack, fix: &GpsFix) -> DwellAssessment {
        let Some(since) = self.dwell_start(track, fix) else {
            return DwellAssessment { event: None, window: DwellWindow::Moving };
        };

        // Same window only if it still starts at the same fix; a run that lost
        // its earliest fixes after a drift is a new, unreported window
        let already_reported = matches!(
            track.dwell(),
            DwellWindow::Dwelling { since: stored, reported: true } if stored == since
        );

        let elapsed_minutes = (fix.timestamp - since).num_milliseconds() as f64 / 60_000.0;
        let threshold = self.config.stop_threshold_minutes;

        if already_reported || elapsed_minutes < threshold {
            return DwellAssessment {
                event: None,
                window: DwellWindow::Dwelling { since, reported: already_reported },
            };
        }

        log::debug!(
            "[stop] tourist {} dwelling {:.1} min since {}",
            fix.tourist_id,
            elapsed_minutes,
            since
        );

        let event = AnomalyEvent::for_fix(
            fix,
            AnomalyKind::StoppedTooLong,
            format!("Stopped for {:.1} minutes", elapsed_minutes),
            elapsed_minutes / threshold,
        );

        DwellAssessment {
            event: Some(event),
            window: DwellWindow::Dwelling { since, reported: true },
        }
    }

    /// Timestamp of the earliest fix in the longest trailing run of stored
    /// fixes within the proximity radius of `fix`.
    fn dwell_start(&self, track: &TouristTrack, fix: &GpsFix) -> Option<DateTime<Utc>> {
        track
            .fixes()
            .iter()
            .rev()
            .take_while(|prev| {
                haversine_distance(&prev.location, &fix.location) <= self.config.proximity_radius_meters
            })
            .last()
            .map(|earliest| earliest.timestamp)
    }
}
