//! Error types for the detection engine.
//!
//! - **InputError**: a fix was rejected before it could be stored or scored
//! - **TrainingError**: a retrain could not produce a model (the old model stays installed)
//! - **ConfigError**: startup configuration could not be loaded

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::TouristId;

/// A fix that must be neither stored nor scored.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InputError {
    #[error("invalid latitude {0}: must be between -90 and 90")]
    LatitudeOutOfRange(f64),

    #[error("invalid longitude {0}: must be between -180 and 180")]
    LongitudeOutOfRange(f64),

    #[error("invalid timestamp {0:?}: use RFC 3339, YYYY-MM-DDTHH:MM:SS or YYYY-MM-DD HH:MM:SS")]
    InvalidTimestamp(String),

    /// Fixes for one tourist must arrive with strictly increasing timestamps.
    #[error("fix for tourist {tourist_id} at {timestamp} is not after the last recorded fix at {last}")]
    OutOfOrder {
        tourist_id: TouristId,
        timestamp: DateTime<Utc>,
        last: DateTime<Utc>,
    },
}

/// Why a retrain produced no model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingError {
    #[error("not enough samples to train: found {found}, need at least {required}")]
    InsufficientSamples { found: usize, required: usize },

    #[error("feature row {row} contains a non-finite value")]
    NonFiniteFeature { row: usize },
}

/// Configuration loading or validation failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}
