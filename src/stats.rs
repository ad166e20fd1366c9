//! Running counters over evaluated fixes.
//!
//! All counters share one mutex, so a [`StatsSnapshot`] never observes half of
//! an update.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{AnomalyEvent, AnomalyKind, TouristId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_fixes: u64,
    pub total_anomalies: u64,
    pub anomalies_by_type: BTreeMap<AnomalyKind, u64>,
    pub anomalies_by_tourist: BTreeMap<TouristId, u64>,
    pub tourists_tracked: u64,
    /// Fixes that produced at least one anomaly.
    pub anomalous_fixes: u64,
    pub emergency_fixes: u64,
    /// `anomalous_fixes / total_fixes` as a percentage, two decimals.
    pub anomaly_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    total_fixes: u64,
    total_anomalies: u64,
    anomalous_fixes: u64,
    emergency_fixes: u64,
    by_type: BTreeMap<AnomalyKind, u64>,
    anomalies_by_tourist: HashMap<TouristId, u64>,
    fixes_by_tourist: HashMap<TouristId, u64>,
}

impl Counters {
    fn add_anomaly(&mut self, event: &AnomalyEvent) {
        self.total_anomalies += 1;
        *self.by_type.entry(event.kind).or_default() += 1;
        *self.anomalies_by_tourist.entry(event.tourist_id).or_default() += 1;
    }
}

#[derive(Debug, Default)]
pub struct StatsEngine {
    counters: Mutex<Counters>,
}

impl StatsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one anomaly.
    pub fn on_anomaly(&self, event: &AnomalyEvent) {
        self.counters.lock().add_anomaly(event);
    }

    /// Count one stored fix together with everything it produced, as a single update.
    pub fn record_fix(&self, tourist_id: TouristId, emergency: bool, anomalies: &[AnomalyEvent]) {
        let mut counters = self.counters.lock();
        counters.total_fixes += 1;
        *counters.fixes_by_tourist.entry(tourist_id).or_default() += 1;
        if emergency {
            counters.emergency_fixes += 1;
        }
        if !anomalies.is_empty() {
            counters.anomalous_fixes += 1;
        }
        for event in anomalies {
            counters.add_anomaly(event);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self.counters.lock();

        let mut anomalies_by_type: BTreeMap<AnomalyKind, u64> =
            AnomalyKind::ALL.iter().map(|kind| (*kind, 0)).collect();
        anomalies_by_type.extend(counters.by_type.iter().map(|(k, v)| (*k, *v)));

        let rate = counters.anomalous_fixes as f64 / counters.total_fixes.max(1) as f64 * 100.0;

        StatsSnapshot {
            total_fixes: counters.total_fixes,
            total_anomalies: counters.total_anomalies,
            anomalies_by_type,
            anomalies_by_tourist: counters.anomalies_by_tourist.iter().map(|(k, v)| (*k, *v)).collect(),
            tourists_tracked: counters.fixes_by_tourist.len() as u64,
            anomalous_fixes: counters.anomalous_fixes,
            emergency_fixes: counters.emergency_fixes,
            anomaly_rate: (rate * 100.0).round() / 100.0,
        }
    }
}
