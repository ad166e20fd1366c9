//! # Isolation Forest
//!
//! Unsupervised outlier model over [`FeatureVector`]s.
//!
//! ## Algorithm
//! 1. Standardize every feature column (zero mean, unit variance)
//! 2. Grow `num_trees` isolation trees, each on a random subsample of
//!    `sample_size` rows, splitting on a random feature at a random value until
//!    every row is isolated or the depth limit `ceil(log2(sample_size))` is hit
//! 3. Score a row by its mean path length `E[h(x)]` across trees:
//!    `s(x) = 2^(-E[h(x)] / c(n))`, where `c(n)` is the average path length of an
//!    unsuccessful BST search over `n` rows. Scores near 1 isolate quickly
//!    (outliers); scores well below 0.5 are ordinary.
//! 4. Calibrate the decision threshold as the `1 - contamination` quantile of
//!    the training scores
//!
//! Reference: Liu, Ting & Zhou, "Isolation Forest" (ICDM 2008).
//!
//! A fitted [`OutlierModel`] is never modified; retraining builds a new one.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};

use crate::features::{FeatureVector, FEATURE_COUNT};
use crate::pattern::PatternConfig;
use crate::TrainingError;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

type Row = [f64; FEATURE_COUNT];

/// Average path length of an unsuccessful search in a binary search tree of `n` nodes.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

// =============================================================================
// Standardization
// =============================================================================

#[derive(Debug, Clone)]
struct StandardScaler {
    means: Row,
    scales: Row,
}

impl StandardScaler {
    fn fit(rows: &[Row]) -> Self {
        let n = rows.len() as f64;
        let mut means = [0.0; FEATURE_COUNT];
        let mut scales = [1.0; FEATURE_COUNT];

        for col in 0..FEATURE_COUNT {
            let mean = rows.iter().map(|r| r[col]).sum::<f64>() / n;
            let variance = rows.iter().map(|r| (r[col] - mean).powi(2)).sum::<f64>() / n;
            let std = variance.sqrt();
            means[col] = mean;
            // Constant columns pass through centered but unscaled
            if std > f64::EPSILON {
                scales[col] = std;
            }
        }

        Self { means, scales }
    }

    fn transform(&self, row: &Row) -> Row {
        let mut out = [0.0; FEATURE_COUNT];
        for col in 0..FEATURE_COUNT {
            out[col] = (row[col] - self.means[col]) / self.scales[col];
        }
        out
    }
}

// =============================================================================
// Isolation Trees
// =============================================================================

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn grow(rows: Vec<Row>, depth: usize, max_depth: usize, rng: &mut StdRng) -> Self {
        if depth >= max_depth || rows.len() <= 1 {
            return Node::Leaf { size: rows.len() };
        }

        let mut min = [f64::INFINITY; FEATURE_COUNT];
        let mut max = [f64::NEG_INFINITY; FEATURE_COUNT];
        for row in &rows {
            for col in 0..FEATURE_COUNT {
                min[col] = min[col].min(row[col]);
                max[col] = max[col].max(row[col]);
            }
        }

        let splittable: Vec<usize> = (0..FEATURE_COUNT).filter(|&c| max[c] > min[c]).collect();
        if splittable.is_empty() {
            // All rows identical; cannot be isolated further
            return Node::Leaf { size: rows.len() };
        }

        let feature = splittable[rng.gen_range(0..splittable.len())];
        let threshold = rng.gen_range(min[feature]..max[feature]);
        let (left, right): (Vec<Row>, Vec<Row>) =
            rows.into_iter().partition(|row| row[feature] < threshold);

        Node::Split {
            feature,
            threshold,
            left: Box::new(Node::grow(left, depth + 1, max_depth, rng)),
            right: Box::new(Node::grow(right, depth + 1, max_depth, rng)),
        }
    }

    fn path_length(&self, row: &Row) -> f64 {
        let mut node = self;
        let mut depth = 0.0;
        loop {
            match node {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split { feature, threshold, left, right } => {
                    node = if row[*feature] < *threshold { left } else { right };
                    depth += 1.0;
                }
            }
        }
    }
}

// =============================================================================
// Model
// =============================================================================

/// A trained, immutable outlier model.
#[derive(Debug, Clone)]
pub struct OutlierModel {
    version: u64,
    trained_on: usize,
    trained_at: DateTime<Utc>,
    scaler: StandardScaler,
    trees: Vec<Node>,
    subsample: usize,
    threshold: f64,
}

impl OutlierModel {
    /// Fit a model on `samples`.
    ///
    /// Fails when there are fewer than `config.min_training_samples` rows (never
    /// fewer than two) or any row contains a non-finite value.
    pub fn fit(samples: &[FeatureVector], config: &PatternConfig, version: u64) -> Result<Self, TrainingError> {
        let required = config.min_training_samples.max(2);
        if samples.len() < required {
            return Err(TrainingError::InsufficientSamples { found: samples.len(), required });
        }
        if let Some(row) = samples.iter().position(|s| !s.is_finite()) {
            return Err(TrainingError::NonFiniteFeature { row });
        }

        let raw: Vec<Row> = samples.iter().map(|s| *s.values()).collect();
        let scaler = StandardScaler::fit(&raw);
        let rows: Vec<Row> = raw.iter().map(|r| scaler.transform(r)).collect();

        let subsample = config.sample_size.clamp(2, rows.len());
        let max_depth = (subsample as f64).log2().ceil() as usize;

        // Per-tree seeds drawn up front keep the forest identical with or
        // without the parallel feature
        let mut seeder = StdRng::seed_from_u64(config.seed);
        let tree_seeds: Vec<u64> = (0..config.num_trees.max(1)).map(|_| seeder.gen()).collect();

        let grow_tree = |seed: &u64| {
            let mut rng = StdRng::seed_from_u64(*seed);
            let picked: Vec<Row> = sample(&mut rng, rows.len(), subsample)
                .iter()
                .map(|i| rows[i])
                .collect();
            Node::grow(picked, 0, max_depth, &mut rng)
        };

        #[cfg(feature = "parallel")]
        let trees: Vec<Node> = {
            use rayon::prelude::*;
            tree_seeds.par_iter().map(grow_tree).collect()
        };

        #[cfg(not(feature = "parallel"))]
        let trees: Vec<Node> = tree_seeds.iter().map(grow_tree).collect();

        let mut model = Self {
            version,
            trained_on: samples.len(),
            trained_at: Utc::now(),
            scaler,
            trees,
            subsample,
            threshold: 1.0,
        };

        let mut training_scores: Vec<f64> = rows.iter().map(|r| model.score_scaled(r)).collect();
        training_scores.sort_by(|a, b| a.total_cmp(b));
        let quantile = (1.0 - config.contamination).clamp(0.0, 1.0);
        let idx = ((training_scores.len() - 1) as f64 * quantile).round() as usize;
        model.threshold = training_scores[idx.min(training_scores.len() - 1)];

        Ok(model)
    }

    fn score_scaled(&self, row: &Row) -> f64 {
        let mean_path =
            self.trees.iter().map(|t| t.path_length(row)).sum::<f64>() / self.trees.len() as f64;
        2f64.powf(-mean_path / average_path_length(self.subsample))
    }

    /// Outlier score in (0, 1]; higher means easier to isolate.
    pub fn score(&self, features: &FeatureVector) -> f64 {
        self.score_scaled(&self.scaler.transform(features.values()))
    }

    /// Scores strictly above this are outliers.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn is_outlier(&self, score: f64) -> bool {
        score > self.threshold
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn trained_on(&self) -> usize {
        self.trained_on
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }
}
