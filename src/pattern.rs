//! Pattern anomaly detection.
//!
//! Scores each fix's movement features against the currently installed
//! [`OutlierModel`]. The model lives behind a [`ModelHandle`]: scoring clones
//! an `Arc` under a read lock and works on it lock-free, while a retrain builds
//! a complete new model first and installs it with a pointer swap under the
//! write lock.
//!
//! Until a model with at least `min_training_samples` rows has been installed
//! the detector abstains.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::features::{extract_training_set, FeatureVector};
use crate::history::TouristTrack;
use crate::isolation_forest::OutlierModel;
use crate::{AnomalyEvent, AnomalyKind, GpsFix, TrainingError};

/// Configuration for the pattern model and its retraining schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Expected fraction of outliers in the training data; calibrates the threshold.
    /// Default: 0.1
    pub contamination: f64,

    /// Retrain after this many newly stored fixes.
    /// Default: 50
    pub retrain_interval: u64,

    /// Minimum feature rows needed to produce a model.
    /// Default: 10
    pub min_training_samples: usize,

    /// Trees in the forest. Default: 100
    pub num_trees: usize,

    /// Rows subsampled per tree. Default: 256
    pub sample_size: usize,

    /// RNG seed, so identical history yields an identical model. Default: 42
    pub seed: u64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            contamination: 0.1,
            retrain_interval: 50,
            min_training_samples: 10,
            num_trees: 100,
            sample_size: 256,
            seed: 42,
        }
    }
}

// =============================================================================
// Model Handle
// =============================================================================

/// Versioned slot holding the live model.
#[derive(Debug, Default)]
pub struct ModelHandle {
    current: RwLock<Option<Arc<OutlierModel>>>,
    next_version: AtomicU64,
}

impl ModelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The installed model, if any. The returned `Arc` stays valid even if a
    /// newer model is installed meanwhile.
    pub fn current(&self) -> Option<Arc<OutlierModel>> {
        self.current.read().clone()
    }

    /// Version of the installed model (0 = untrained).
    pub fn version(&self) -> u64 {
        self.current.read().as_ref().map_or(0, |m| m.version())
    }

    /// Reserve a version number for a model about to be trained.
    pub fn reserve_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Install `model` unless a newer one is already in place.
    ///
    /// Returns whether the model was installed.
    pub fn install(&self, model: OutlierModel) -> bool {
        let model = Arc::new(model);
        let mut slot = self.current.write();
        if slot.as_ref().is_some_and(|installed| installed.version() >= model.version()) {
            return false;
        }
        *slot = Some(model);
        true
    }
}

// =============================================================================
// Detector
// =============================================================================

#[derive(Debug)]
pub struct PatternDetector {
    config: PatternConfig,
    model: ModelHandle,
    fixes_since_retrain: AtomicU64,
    retrain_in_flight: AtomicBool,
}

impl PatternDetector {
    pub fn new(config: PatternConfig) -> Self {
        Self {
            config,
            model: ModelHandle::new(),
            fixes_since_retrain: AtomicU64::new(0),
            retrain_in_flight: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn is_trained(&self) -> bool {
        self.model.current().is_some()
    }

    /// Whether a background retrain currently holds the retrain slot.
    pub fn is_retraining(&self) -> bool {
        self.retrain_in_flight.load(Ordering::Acquire)
    }

    /// Score `fix` against the tourist's previous fix. Abstains for a first
    /// fix or while untrained.
    pub fn evaluate(&self, track: &TouristTrack, fix: &GpsFix) -> Option<AnomalyEvent> {
        let previous = track.last()?;
        let features = FeatureVector::between(previous, fix);
        self.evaluate_features(fix, &features)
    }

    /// Score precomputed features for `fix`.
    pub fn evaluate_features(&self, fix: &GpsFix, features: &FeatureVector) -> Option<AnomalyEvent> {
        let model = self.model.current()?;
        let score = model.score(features);
        if !model.is_outlier(score) {
            return None;
        }

        log::debug!(
            "[pattern] tourist {} score {:.3} > {:.3} (model v{}): {}",
            fix.tourist_id,
            score,
            model.threshold(),
            model.version(),
            features
        );

        Some(AnomalyEvent::for_fix(
            fix,
            AnomalyKind::MlPatternAnomaly,
            format!("ML detected unusual pattern (score: {:.2})", score),
            score / model.threshold(),
        ))
    }

    /// Count newly stored fixes. Returns `true` once enough have accumulated
    /// to warrant a retrain.
    pub fn note_appended(&self, count: u64) -> bool {
        let total = self.fixes_since_retrain.fetch_add(count, Ordering::Relaxed) + count;
        total >= self.config.retrain_interval
    }

    /// Fit a model on `fixes` (grouped by tourist, time-ordered) and install it.
    ///
    /// On failure the previously installed model stays authoritative and the
    /// failure is logged for operators.
    pub fn train(&self, fixes: &[GpsFix]) -> Result<u64, TrainingError> {
        self.fixes_since_retrain.store(0, Ordering::Relaxed);

        let samples = extract_training_set(fixes);
        let version = self.model.reserve_version();
        let start = std::time::Instant::now();

        match OutlierModel::fit(&samples, &self.config, version) {
            Ok(model) => {
                let threshold = model.threshold();
                if self.model.install(model) {
                    info!(
                        "[pattern] installed model v{} ({} samples, threshold {:.3}) in {:?}",
                        version,
                        samples.len(),
                        threshold,
                        start.elapsed()
                    );
                } else {
                    info!("[pattern] model v{} superseded before install", version);
                }
                Ok(version)
            }
            Err(e) => {
                warn!(
                    "[pattern] retrain v{} failed, keeping model v{}: {}",
                    version,
                    self.model.version(),
                    e
                );
                Err(e)
            }
        }
    }

    /// Claim the single background retrain slot.
    pub fn try_begin_retrain(self: &Arc<Self>) -> Option<RetrainTicket> {
        self.retrain_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RetrainTicket { detector: Arc::clone(self) })
    }
}

/// Exclusive right to run one background retrain. Releases the slot on drop.
#[derive(Debug)]
pub struct RetrainTicket {
    detector: Arc<PatternDetector>,
}

impl RetrainTicket {
    pub fn run(self, fixes: &[GpsFix]) -> Result<u64, TrainingError> {
        self.detector.train(fixes)
    }
}

impl Drop for RetrainTicket {
    fn drop(&mut self) {
        self.detector.retrain_in_flight.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GpsPoint, TouristId};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
    }

    /// A tourist strolling up the route, one fix every 90 seconds.
    fn stroll(tourist_id: TouristId, n: usize) -> Vec<GpsFix> {
        (0..n)
            .map(|i| {
                let wobble = ((i * 7 + tourist_id as usize * 3) % 11) as f64 * 0.00001;
                GpsFix::new(
                    tourist_id,
                    GpsPoint::new(12.9716 + i as f64 * 0.0002 + wobble, 77.5946 + i as f64 * 0.0002),
                    t0() + Duration::seconds(90 * i as i64 + (i as i64 % 5) * 7),
                )
            })
            .collect()
    }

    fn training_fixes() -> Vec<GpsFix> {
        (1..=4).flat_map(|id| stroll(id, 20)).collect()
    }

    #[test]
    fn test_untrained_detector_abstains() {
        let detector = PatternDetector::new(PatternConfig::default());
        let mut track = TouristTrack::new(1);
        let fixes = stroll(1, 2);
        track.push(fixes[0].clone()).unwrap();
        assert!(!detector.is_trained());
        assert!(detector.evaluate(&track, &fixes[1]).is_none());
    }

    #[test]
    fn test_first_fix_is_skipped() {
        let detector = PatternDetector::new(PatternConfig::default());
        detector.train(&training_fixes()).unwrap();
        let track = TouristTrack::new(9);
        let far = GpsFix::new(9, GpsPoint::new(40.0, -74.0), t0());
        assert!(detector.evaluate(&track, &far).is_none());
    }

    #[test]
    fn test_failed_retrain_keeps_previous_model() {
        let detector = PatternDetector::new(PatternConfig::default());
        let first = detector.train(&training_fixes()).unwrap();
        assert_eq!(detector.model().version(), first);

        let err = detector.train(&stroll(1, 3)).unwrap_err();
        assert!(matches!(err, TrainingError::InsufficientSamples { found: 2, .. }));
        assert_eq!(detector.model().version(), first);
        assert!(detector.is_trained());
    }

    #[test]
    fn test_teleport_is_flagged_after_training() {
        let detector = PatternDetector::new(PatternConfig::default());
        detector.train(&training_fixes()).unwrap();

        let mut track = TouristTrack::new(1);
        let fixes = stroll(1, 2);
        track.push(fixes[0].clone()).unwrap();

        let teleport = GpsFix::new(1, GpsPoint::new(13.5, 78.2), fixes[0].timestamp + Duration::seconds(5));
        let event = detector.evaluate(&track, &teleport).unwrap();
        assert_eq!(event.kind, AnomalyKind::MlPatternAnomaly);
        assert!(event.reason.starts_with("ML detected unusual pattern (score: "));
        assert!(event.confidence > 1.0);
    }

    #[test]
    fn test_retrain_trigger_counts_appends() {
        let detector = PatternDetector::new(PatternConfig { retrain_interval: 3, ..PatternConfig::default() });
        assert!(!detector.note_appended(1));
        assert!(!detector.note_appended(1));
        assert!(detector.note_appended(1));

        // Training resets the counter, even when it fails
        let _ = detector.train(&[]);
        assert!(!detector.note_appended(1));
    }

    #[test]
    fn test_install_never_downgrades() {
        let handle = ModelHandle::new();
        let config = PatternConfig::default();
        let samples = extract_training_set(&training_fixes());

        let older = OutlierModel::fit(&samples, &config, handle.reserve_version()).unwrap();
        let newer = OutlierModel::fit(&samples, &config, handle.reserve_version()).unwrap();

        assert!(handle.install(newer));
        assert!(!handle.install(older));
        assert_eq!(handle.version(), 2);
    }

    #[test]
    fn test_only_one_background_retrain_at_a_time() {
        let detector = Arc::new(PatternDetector::new(PatternConfig::default()));
        let ticket = detector.try_begin_retrain().unwrap();
        assert!(detector.is_retraining());
        assert!(detector.try_begin_retrain().is_none());

        ticket.run(&training_fixes()).unwrap();
        assert!(!detector.is_retraining());
        assert!(detector.try_begin_retrain().is_some());
    }

    #[test]
    fn test_scoring_holds_model_across_swap() {
        let detector = PatternDetector::new(PatternConfig::default());
        detector.train(&training_fixes()).unwrap();
        let held = detector.model().current().unwrap();

        detector.train(&training_fixes()).unwrap();
        let latest = detector.model().current().unwrap();

        assert_eq!(held.version(), 1);
        assert_eq!(latest.version(), 2);
        // The old instance is still whole and usable
        let probe = FeatureVector([100.0, 90.0, 1.1, 12.9736, 77.5966]);
        assert_eq!(held.score(&probe), latest.score(&probe));
    }
}
