//! JSON request and response shapes for the service boundary.
//!
//! The transport itself lives outside this crate. These types pin down the
//! field names a thin HTTP layer exchanges with clients:
//!
//! | Call | Request | Response |
//! |------|---------|----------|
//! | check | [`FixRequest`] | [`CheckResponse`] |
//! | batch | `[FixRequest]` | `[BatchEntry]` |
//! | history | tourist id | [`HistoryResponse`] |
//! | stats | - | [`StatsSnapshot`](crate::StatsSnapshot) |
//! | health | - | [`HealthReport`] |
//!
//! ```
//! use tourist_anomaly::{AnomalyEngine, EngineConfig, FixRequest};
//!
//! let engine = AnomalyEngine::new(EngineConfig::default()).unwrap();
//! let request: FixRequest = serde_json::from_str(
//!     r#"{"tourist_id": 1, "lat": 12.98, "lon": 77.60, "timestamp": "2024-01-15T10:35:00"}"#,
//! ).unwrap();
//!
//! let response = engine.check_anomaly(&request).unwrap();
//! let json = serde_json::to_value(&response).unwrap();
//! assert_eq!(json["status"], "anomaly");
//! assert_eq!(json["anomalies"][0]["type"], "route_deviation");
//! ```

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{AnomalyEngine, FixVerdict, Status};
use crate::{AnomalyEvent, AnomalyKind, GpsFix, GpsPoint, InputError, TouristId};

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse a client timestamp. Values without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, InputError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| InputError::InvalidTimestamp(raw.to_string()))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixRequest {
    pub tourist_id: TouristId,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: String,
    #[serde(default)]
    pub emergency: bool,
}

impl FixRequest {
    pub fn to_fix(&self) -> Result<GpsFix, InputError> {
        let timestamp = parse_timestamp(&self.timestamp)?;
        let fix = GpsFix::new(self.tourist_id, GpsPoint::new(self.lat, self.lon), timestamp)
            .with_emergency(self.emergency);
        fix.validate()?;
        Ok(fix)
    }
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl From<GpsPoint> for Location {
    fn from(point: GpsPoint) -> Self {
        Self { lat: point.latitude, lon: point.longitude }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyDetail {
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub reason: String,
    pub confidence: f64,
}

impl From<&AnomalyEvent> for AnomalyDetail {
    fn from(event: &AnomalyEvent) -> Self {
        Self {
            kind: event.kind,
            reason: event.reason.clone(),
            confidence: round2(event.confidence),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub status: Status,
    pub tourist_id: TouristId,
    pub timestamp: DateTime<Utc>,
    pub location: Location,
    pub anomalies: Vec<AnomalyDetail>,
    /// Reason of the highest-priority anomaly; absent for normal fixes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&FixVerdict> for CheckResponse {
    fn from(verdict: &FixVerdict) -> Self {
        Self {
            status: verdict.status(),
            tourist_id: verdict.fix.tourist_id,
            timestamp: verdict.fix.timestamp,
            location: verdict.fix.location.into(),
            anomalies: verdict.anomalies.iter().map(AnomalyDetail::from).collect(),
            reason: verdict.reason().map(str::to_string),
        }
    }
}

/// One element of a batch response: the check result, or why the fix was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchEntry {
    Checked(CheckResponse),
    Rejected {
        /// Always `"error"`.
        status: String,
        tourist_id: TouristId,
        error: String,
    },
}

impl BatchEntry {
    fn rejected(tourist_id: TouristId, error: &InputError) -> Self {
        BatchEntry::Rejected {
            status: "error".to_string(),
            tourist_id,
            error: error.to_string(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, BatchEntry::Rejected { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub lat: f64,
    pub lon: f64,
    pub timestamp: DateTime<Utc>,
    pub emergency: bool,
}

impl From<&GpsFix> for HistoryEntry {
    fn from(fix: &GpsFix) -> Self {
        Self {
            lat: fix.location.latitude,
            lon: fix.location.longitude,
            timestamp: fix.timestamp,
            emergency: fix.emergency,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub tourist_id: TouristId,
    pub history: Vec<HistoryEntry>,
    pub total_points: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub service: String,
    pub version: String,
    pub model_trained: bool,
    /// 0 until the first model is installed.
    pub model_version: u64,
    pub tourists_tracked: usize,
}

// =============================================================================
// Engine entry points
// =============================================================================

impl AnomalyEngine {
    /// Parse, evaluate and render one fix.
    pub fn check_anomaly(&self, request: &FixRequest) -> Result<CheckResponse, InputError> {
        let fix = request.to_fix()?;
        let verdict = self.evaluate_fix(fix)?;
        Ok(CheckResponse::from(&verdict))
    }

    /// Check a batch. The response has one entry per request, in request order;
    /// a bad request yields a rejected entry without affecting the others.
    pub fn analyze_batch(&self, requests: &[FixRequest]) -> Vec<BatchEntry> {
        let mut entries: Vec<Option<BatchEntry>> = vec![None; requests.len()];
        let mut positions = Vec::with_capacity(requests.len());
        let mut fixes = Vec::with_capacity(requests.len());

        for (idx, request) in requests.iter().enumerate() {
            match request.to_fix() {
                Ok(fix) => {
                    positions.push(idx);
                    fixes.push(fix);
                }
                Err(e) => entries[idx] = Some(BatchEntry::rejected(request.tourist_id, &e)),
            }
        }

        for (idx, result) in positions.into_iter().zip(self.evaluate_batch(fixes)) {
            entries[idx] = Some(match result {
                Ok(verdict) => BatchEntry::Checked(CheckResponse::from(&verdict)),
                Err(e) => BatchEntry::rejected(requests[idx].tourist_id, &e),
            });
        }

        entries.into_iter().flatten().collect()
    }

    /// Stored fixes of a tourist, oldest first. Unknown ids give an empty list.
    pub fn history_response(&self, tourist_id: TouristId) -> HistoryResponse {
        let history: Vec<HistoryEntry> =
            self.tourist_history(tourist_id).iter().map(HistoryEntry::from).collect();
        HistoryResponse { tourist_id, total_points: history.len(), history }
    }
}
