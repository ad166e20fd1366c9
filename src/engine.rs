//! The detection engine: one owned context per process.
//!
//! For each fix the engine locks the tourist's track, runs the detectors in
//! priority order against the history as it stood *before* the fix, then
//! appends the fix and releases the lock. Stats and the retrain trigger are
//! updated afterwards, outside the track lock.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::history::HistoryStore;
use crate::pattern::{PatternConfig, PatternDetector};
use crate::route::{RouteConfig, RouteDeviationDetector};
use crate::stats::{StatsEngine, StatsSnapshot};
use crate::stop::{StopConfig, StopDetector};
use crate::wire::HealthReport;
use crate::{AnomalyEvent, ConfigError, GpsFix, InputError, TouristId, TrainingError, TrackHistory};

/// Static configuration, fixed for the lifetime of an engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub route: RouteConfig,
    pub stop: StopConfig,
    pub pattern: PatternConfig,
}

impl EngineConfig {
    /// Parse a JSON config; missing fields take their defaults.
    ///
    /// ```
    /// use tourist_anomaly::EngineConfig;
    ///
    /// let config = EngineConfig::from_json(r#"{"stop": {"stop_threshold_minutes": 10}}"#).unwrap();
    /// assert_eq!(config.stop.stop_threshold_minutes, 10.0);
    /// assert_eq!(config.route.deviation_threshold_meters, 200.0);
    /// ```
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.route.deviation_threshold_meters > 0.0) {
            return Err(ConfigError::invalid("deviation_threshold_meters must be positive"));
        }
        if !(self.stop.stop_threshold_minutes > 0.0) {
            return Err(ConfigError::invalid("stop_threshold_minutes must be positive"));
        }
        if !(self.stop.proximity_radius_meters >= 0.0) {
            return Err(ConfigError::invalid("proximity_radius_meters must not be negative"));
        }
        let p = &self.pattern;
        if !(p.contamination > 0.0 && p.contamination <= 0.5) {
            return Err(ConfigError::invalid("contamination must be in (0, 0.5]"));
        }
        if p.retrain_interval == 0 {
            return Err(ConfigError::invalid("retrain_interval must be at least 1"));
        }
        if p.min_training_samples < 2 {
            return Err(ConfigError::invalid("min_training_samples must be at least 2"));
        }
        if p.num_trees == 0 || p.sample_size < 2 {
            return Err(ConfigError::invalid("forest needs at least one tree and a sample size of 2"));
        }
        Ok(())
    }
}

/// Overall classification of a fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Normal,
    Anomaly,
}

/// Result of evaluating one fix.
#[derive(Debug, Clone, PartialEq)]
pub struct FixVerdict {
    pub fix: GpsFix,
    /// Triggered anomalies in priority order: route deviation, stop, pattern.
    pub anomalies: Vec<AnomalyEvent>,
}

impl FixVerdict {
    pub fn status(&self) -> Status {
        if self.anomalies.is_empty() {
            Status::Normal
        } else {
            Status::Anomaly
        }
    }

    pub fn is_normal(&self) -> bool {
        self.anomalies.is_empty()
    }

    /// Reason of the highest-priority anomaly.
    pub fn reason(&self) -> Option<&str> {
        self.anomalies.first().map(|a| a.reason.as_str())
    }
}

/// Process-scoped detection context.
#[derive(Debug)]
pub struct AnomalyEngine {
    config: EngineConfig,
    history: Arc<HistoryStore>,
    route: RouteDeviationDetector,
    stop: StopDetector,
    pattern: Arc<PatternDetector>,
    stats: StatsEngine,
}

impl AnomalyEngine {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            "[engine] starting: stop {}min/{}m, deviation {}m, retrain every {} fixes",
            config.stop.stop_threshold_minutes,
            config.stop.proximity_radius_meters,
            config.route.deviation_threshold_meters,
            config.pattern.retrain_interval
        );

        Ok(Self {
            route: RouteDeviationDetector::new(&config.route),
            stop: StopDetector::new(config.stop.clone()),
            pattern: Arc::new(PatternDetector::new(config.pattern.clone())),
            history: Arc::new(HistoryStore::new()),
            stats: StatsEngine::new(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn history_store(&self) -> &HistoryStore {
        &self.history
    }

    pub fn pattern_detector(&self) -> &PatternDetector {
        &self.pattern
    }

    /// Run every detector on `fix`, then store it.
    ///
    /// A rejected fix is neither stored, scored nor counted.
    pub fn evaluate_fix(&self, fix: GpsFix) -> Result<FixVerdict, InputError> {
        fix.validate()?;
        let track = self.history.track(fix.tourist_id);

        let anomalies = {
            let mut track = track.lock();
            track.check_append(&fix)?;

            let mut anomalies = Vec::with_capacity(3);
            anomalies.extend(self.route.evaluate(&fix));
            let dwell = self.stop.evaluate(&track, &fix);
            anomalies.extend(dwell.event);
            anomalies.extend(self.pattern.evaluate(&track, &fix));

            track.push(fix.clone())?;
            track.set_dwell(dwell.window);
            anomalies
        };

        if fix.emergency {
            warn!(
                "[engine] emergency flag from tourist {} at ({:.5}, {:.5})",
                fix.tourist_id, fix.location.latitude, fix.location.longitude
            );
        }
        debug!(
            "[engine] tourist {} at {}: {} anomalies",
            fix.tourist_id,
            fix.timestamp,
            anomalies.len()
        );

        self.stats.record_fix(fix.tourist_id, fix.emergency, &anomalies);
        if self.pattern.note_appended(1) {
            self.schedule_retrain();
        }

        Ok(FixVerdict { fix, anomalies })
    }

    /// Evaluate a batch. Fixes of one tourist are processed in input order;
    /// different tourists may run in parallel. Results line up with the input.
    pub fn evaluate_batch(&self, fixes: Vec<GpsFix>) -> Vec<Result<FixVerdict, InputError>> {
        let total = fixes.len();

        // Bucket by tourist, keeping each fix's input position
        let mut order: Vec<TouristId> = Vec::new();
        let mut buckets: std::collections::HashMap<TouristId, Vec<(usize, GpsFix)>> =
            std::collections::HashMap::new();
        for (idx, fix) in fixes.into_iter().enumerate() {
            let bucket = buckets.entry(fix.tourist_id).or_insert_with(|| {
                order.push(fix.tourist_id);
                Vec::new()
            });
            bucket.push((idx, fix));
        }
        let groups: Vec<Vec<(usize, GpsFix)>> =
            order.iter().filter_map(|id| buckets.remove(id)).collect();

        let run_group = |group: Vec<(usize, GpsFix)>| {
            group
                .into_iter()
                .map(|(idx, fix)| (idx, self.evaluate_fix(fix)))
                .collect::<Vec<_>>()
        };

        #[cfg(feature = "parallel")]
        let evaluated: Vec<(usize, Result<FixVerdict, InputError>)> = {
            use rayon::prelude::*;
            groups.into_par_iter().flat_map_iter(run_group).collect()
        };

        #[cfg(not(feature = "parallel"))]
        let evaluated: Vec<(usize, Result<FixVerdict, InputError>)> =
            groups.into_iter().flat_map(run_group).collect();

        let mut slots: Vec<Option<Result<FixVerdict, InputError>>> = (0..total).map(|_| None).collect();
        for (idx, result) in evaluated {
            slots[idx] = Some(result);
        }
        slots.into_iter().flatten().collect()
    }

    /// Retrain the pattern model now, on the calling thread.
    ///
    /// Returns the version of the new model.
    pub fn retrain_now(&self) -> Result<u64, TrainingError> {
        let fixes = self.history.all_fixes();
        self.pattern.train(&fixes)
    }

    /// Start a background retrain unless one is already running. Never blocks
    /// the calling fix on the fit.
    fn schedule_retrain(&self) {
        let Some(ticket) = self.pattern.try_begin_retrain() else {
            debug!("[engine] retrain already in flight");
            return;
        };

        let history = Arc::clone(&self.history);
        let job = move || {
            let fixes = history.all_fixes();
            match ticket.run(&fixes) {
                Ok(version) => debug!("[engine] background retrain produced model v{}", version),
                Err(e) => debug!("[engine] background retrain skipped: {}", e),
            }
        };

        #[cfg(feature = "parallel")]
        rayon::spawn(job);

        #[cfg(not(feature = "parallel"))]
        {
            let spawned = std::thread::Builder::new()
                .name("anomaly-retrain".to_string())
                .spawn(job);
            if let Err(e) = spawned {
                // The ticket went down with the closure, so the slot is free again
                warn!("[engine] could not start retrain thread: {}", e);
            }
        }
    }

    /// Load historical fixes without scoring or counting them, then train on
    /// the result. Returns how many fixes were stored.
    ///
    /// Fixes violating the ordering or range rules are skipped.
    pub fn preload(&self, fixes: impl IntoIterator<Item = GpsFix>) -> usize {
        let mut stored = 0;
        let mut skipped = 0;
        for fix in fixes {
            match self.history.append(fix) {
                Ok(()) => stored += 1,
                Err(e) => {
                    skipped += 1;
                    debug!("[engine] preload skipped fix: {}", e);
                }
            }
        }
        info!(
            "[engine] preloaded {} fixes ({} skipped), {} stored in total",
            stored,
            skipped,
            self.history.total_fixes()
        );

        if let Err(e) = self.retrain_now() {
            info!("[engine] no model after preload: {}", e);
        }
        stored
    }

    /// Past fixes of a tourist, oldest first. Empty for unknown ids.
    pub fn tourist_history(&self, tourist_id: TouristId) -> TrackHistory {
        self.history.history(tourist_id)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn health(&self) -> HealthReport {
        let model_version = self.pattern.model().version();
        HealthReport {
            status: "healthy".to_string(),
            service: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            model_trained: model_version > 0,
            model_version,
            tourists_tracked: self.history.tourist_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AnomalyKind, GpsPoint};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
    }

    fn engine() -> AnomalyEngine {
        AnomalyEngine::new(EngineConfig::default()).unwrap()
    }

    fn fix(tourist_id: TouristId, lat: f64, lon: f64, minutes: i64) -> GpsFix {
        GpsFix::new(tourist_id, GpsPoint::new(lat, lon), t0() + Duration::minutes(minutes))
    }

    /// Walk the planned route, one fix per minute with ~31m steps.
    fn walk(tourist_id: TouristId, steps: usize, start_minute: i64) -> Vec<GpsFix> {
        (0..steps)
            .map(|i| {
                let t = (i % 20) as f64 / 20.0;
                fix(
                    tourist_id,
                    12.9716 + t * 0.004,
                    77.5946 + t * 0.004,
                    start_minute + i as i64,
                )
            })
            .collect()
    }

    #[test]
    fn test_on_route_fix_is_normal() {
        let verdict = engine().evaluate_fix(fix(1, 12.9716, 77.5946, 0)).unwrap();
        assert_eq!(verdict.status(), Status::Normal);
        assert!(verdict.anomalies.is_empty());
        assert_eq!(verdict.reason(), None);
    }

    #[test]
    fn test_far_fix_deviates() {
        let engine = engine();
        engine.evaluate_fix(fix(1, 12.9716, 77.5946, 0)).unwrap();
        let verdict = engine.evaluate_fix(fix(1, 12.9800, 77.6000, 5)).unwrap();

        assert_eq!(verdict.status(), Status::Anomaly);
        assert_eq!(verdict.anomalies.len(), 1);
        assert_eq!(verdict.anomalies[0].kind, AnomalyKind::RouteDeviation);
        assert!((verdict.anomalies[0].confidence - 2.56).abs() < 0.02);
        assert_eq!(verdict.reason(), Some(verdict.anomalies[0].reason.as_str()));
    }

    #[test]
    fn test_stop_fires_on_sixth_fix_only() {
        let engine = engine();
        let statuses: Vec<Status> = (0..6)
            .map(|m| engine.evaluate_fix(fix(2, 12.9736, 77.5966, m)).unwrap().status())
            .collect();
        assert_eq!(statuses[..5], [Status::Normal; 5]);
        assert_eq!(statuses[5], Status::Anomaly);

        let next = engine.evaluate_fix(fix(2, 12.9736, 77.5966, 6)).unwrap();
        assert!(next.is_normal());
        assert_eq!(engine.stats().anomalies_by_type[&AnomalyKind::StoppedTooLong], 1);
    }

    #[test]
    fn test_priority_order_route_before_stop() {
        let engine = engine();
        // Dwelling off-route: both rules fire on the sixth fix
        let mut last = None;
        for m in 0..6 {
            last = Some(engine.evaluate_fix(fix(3, 12.9900, 77.6100, m)).unwrap());
        }
        let verdict = last.unwrap();
        let kinds: Vec<AnomalyKind> = verdict.anomalies.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AnomalyKind::RouteDeviation, AnomalyKind::StoppedTooLong]);
        assert!(verdict.reason().unwrap().starts_with("Deviated"));
    }

    #[test]
    fn test_rejected_fix_is_not_stored_or_counted() {
        let engine = engine();
        engine.evaluate_fix(fix(1, 12.9716, 77.5946, 5)).unwrap();

        let stale = engine.evaluate_fix(fix(1, 12.9800, 77.6000, 5));
        assert!(matches!(stale, Err(InputError::OutOfOrder { .. })));

        let invalid = engine.evaluate_fix(fix(1, 123.0, 77.6, 6));
        assert_eq!(invalid, Err(InputError::LatitudeOutOfRange(123.0)));

        assert_eq!(engine.tourist_history(1).len(), 1);
        let stats = engine.stats();
        assert_eq!(stats.total_fixes, 1);
        assert_eq!(stats.total_anomalies, 0);
    }

    #[test]
    fn test_fix_is_not_scored_against_itself() {
        let engine = engine();
        // A single fix has no predecessor, so neither stop nor pattern can fire
        let verdict = engine.evaluate_fix(fix(4, 12.9736, 77.5966, 0)).unwrap();
        assert!(verdict.is_normal());
        assert_eq!(engine.tourist_history(4).len(), 1);
    }

    #[test]
    fn test_stats_totals_match_reported_anomalies() {
        let engine = engine();
        let mut reported = 0;
        let mut fixes = walk(1, 30, 0);
        fixes.extend((0..8).map(|m| fix(2, 12.9900, 77.6100, m)));
        for f in fixes {
            reported += engine.evaluate_fix(f).unwrap().anomalies.len() as u64;
        }

        let stats = engine.stats();
        assert_eq!(stats.total_fixes, 38);
        assert_eq!(stats.total_anomalies, reported);
        assert_eq!(stats.anomalies_by_type.values().sum::<u64>(), reported);
        assert_eq!(stats.tourists_tracked, 2);
    }

    #[test]
    fn test_emergency_is_counted_but_does_not_force_anomaly() {
        let engine = engine();
        let verdict = engine
            .evaluate_fix(fix(1, 12.9716, 77.5946, 0).with_emergency(true))
            .unwrap();
        assert!(verdict.is_normal());
        assert_eq!(engine.stats().emergency_fixes, 1);
    }

    #[test]
    fn test_batch_preserves_input_order_and_reports_rejections() {
        let engine = engine();
        let batch = vec![
            fix(1, 12.9716, 77.5946, 0),
            fix(2, 12.9800, 77.6000, 0),
            fix(1, 12.9726, 77.5956, 1),
            fix(2, 12.9800, 77.6000, 0), // duplicate timestamp
            fix(1, 95.0, 77.5956, 2),    // bad latitude
        ];

        let results = engine.evaluate_batch(batch);
        assert_eq!(results.len(), 5);
        assert_eq!(results[0].as_ref().unwrap().fix.tourist_id, 1);
        assert_eq!(results[1].as_ref().unwrap().status(), Status::Anomaly);
        assert_eq!(results[2].as_ref().unwrap().fix.timestamp, t0() + Duration::minutes(1));
        assert!(matches!(results[3], Err(InputError::OutOfOrder { tourist_id: 2, .. })));
        assert!(matches!(results[4], Err(InputError::LatitudeOutOfRange(_))));
    }

    #[test]
    fn test_batch_stop_detection_follows_per_tourist_order() {
        let engine = engine();
        let mut batch = Vec::new();
        // Interleave two dwelling tourists
        for m in 0..6 {
            batch.push(fix(10, 12.9736, 77.5966, m));
            batch.push(fix(11, 12.9746, 77.5976, m));
        }
        let results = engine.evaluate_batch(batch);
        let flagged: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.as_ref().unwrap().status() == Status::Anomaly)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(flagged, vec![10, 11]);
    }

    #[test]
    fn test_concurrent_tourists_do_not_interfere() {
        let engine = engine();
        std::thread::scope(|scope| {
            for tourist in 0..8 {
                let engine = &engine;
                scope.spawn(move || {
                    for f in walk(tourist, 60, 0) {
                        engine.evaluate_fix(f).unwrap();
                    }
                });
            }
        });

        for tourist in 0..8 {
            let history = engine.tourist_history(tourist);
            assert_eq!(history.len(), 60);
            assert!(history.iter().all(|f| f.tourist_id == tourist));
            assert!(history.iter().zip(history.iter().skip(1)).all(|(a, b)| a.timestamp < b.timestamp));
        }
        assert_eq!(engine.stats().total_fixes, 480);
    }

    #[test]
    fn test_pattern_detector_joins_after_training() {
        let engine = engine();
        let history: Vec<GpsFix> = (100..105).flat_map(|id| walk(id, 40, 0)).collect();
        assert_eq!(engine.preload(history), 200);
        assert!(engine.pattern_detector().is_trained());
        // Preloaded fixes are history, not evaluations
        assert_eq!(engine.stats().total_fixes, 0);

        engine.evaluate_fix(fix(1, 12.9716, 77.5946, 0)).unwrap();
        // 60km in a minute
        let verdict = engine.evaluate_fix(fix(1, 13.5, 77.8, 1)).unwrap();
        let kinds: Vec<AnomalyKind> = verdict.anomalies.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AnomalyKind::RouteDeviation, AnomalyKind::MlPatternAnomaly]);
    }

    #[test]
    fn test_retrain_now_needs_enough_history() {
        let engine = engine();
        engine.evaluate_fix(fix(1, 12.9716, 77.5946, 0)).unwrap();
        assert!(matches!(
            engine.retrain_now(),
            Err(TrainingError::InsufficientSamples { found: 0, .. })
        ));
        assert!(!engine.pattern_detector().is_trained());
        assert!(!engine.health().model_trained);
    }

    /// Wait for a background retrain to finish.
    fn settle(engine: &AnomalyEngine) {
        for _ in 0..1000 {
            if !engine.pattern_detector().is_retraining() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("retrain did not finish");
    }

    fn retraining_engine(interval: u64) -> AnomalyEngine {
        let mut config = EngineConfig::default();
        config.pattern.retrain_interval = interval;
        AnomalyEngine::new(config).unwrap()
    }

    #[test]
    fn test_appended_fixes_trigger_background_retrain() {
        let engine = retraining_engine(20);
        for f in walk(1, 20, 0) {
            engine.evaluate_fix(f).unwrap();
        }
        settle(&engine);
        let first = engine.health().model_version;
        assert!(first > 0);
        assert!(engine.pattern_detector().is_trained());

        for f in walk(1, 20, 20) {
            engine.evaluate_fix(f).unwrap();
            settle(&engine);
        }
        assert!(engine.health().model_version > first);
    }

    #[test]
    fn test_failed_background_retrain_installs_nothing() {
        let engine = retraining_engine(5);
        // One fix each: no consecutive pairs, so no training rows
        for tourist in 100..105 {
            engine.evaluate_fix(fix(tourist, 12.9716, 77.5946, 0)).unwrap();
        }
        settle(&engine);
        assert!(!engine.pattern_detector().is_trained());
        assert_eq!(engine.health().model_version, 0);

        // Slot released after the failure; a later trigger still trains
        for f in walk(1, 15, 0) {
            engine.evaluate_fix(f).unwrap();
            settle(&engine);
        }
        assert!(engine.health().model_trained);
    }

    #[test]
    fn test_failed_retrain_keeps_serving_model() {
        let engine = retraining_engine(5);
        engine.preload(walk(50, 30, 0));
        let installed = engine.health().model_version;
        assert!(installed > 0);

        // Nothing new to learn from does not change the live model
        let err = engine.pattern_detector().train(&walk(1, 3, 0)).unwrap_err();
        assert!(matches!(err, TrainingError::InsufficientSamples { .. }));
        assert_eq!(engine.health().model_version, installed);
    }

    #[test]
    fn test_health_reports_model_and_tourists() {
        let engine = engine();
        for id in 1..=3 {
            engine.evaluate_fix(fix(id, 12.9716, 77.5946, 0)).unwrap();
        }
        engine.preload(walk(50, 30, 0));

        let health = engine.health();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.tourists_tracked, 4);
        assert!(health.model_trained);
        assert_eq!(health.model_version, 1);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.pattern.contamination = 0.0;
        assert!(matches!(AnomalyEngine::new(config), Err(ConfigError::Invalid(_))));

        assert!(matches!(EngineConfig::from_json("{not json"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            EngineConfig::from_json(r#"{"route": {"deviation_threshold_meters": -1}}"#),
            Err(ConfigError::Invalid(_))
        ));
    }
}
