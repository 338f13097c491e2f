use std::path::PathBuf;

use hardware::{InstrumentError, StageError};
use thiserror::Error;

use crate::run_store::StoreError;

/// Invalid scan configuration. Raised before any hardware is touched.
#[derive(Error, Debug)]
pub enum ConfigFault {
    #[error("invalid {axis} range: {reason}")]
    InvalidRange { axis: &'static str, reason: String },

    #[error("lattice has {} points, limit is {max}", describe_count(.count))]
    TooManyPoints { count: Option<usize>, max: usize },

    #[error("retry bound must be at least 1, got {0}")]
    InvalidRetryBound(u32),

    #[error("rest interval must be at least 1, got {0}")]
    InvalidRestInterval(u32),

    #[error("settle tolerance must be positive and finite, got {0}")]
    InvalidTolerance(f64),

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("measurement timeout ({timeout_ms} ms) is shorter than the dwell time ({dwell_ms} ms)")]
    MeasurementTimeoutTooShort { dwell_ms: u64, timeout_ms: u64 },

    #[error("at least one counter channel is required")]
    NoChannels,

    #[error("reference position {0} does not match the lattice dimensions")]
    CenterDimension(hardware::Position),

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn describe_count(count: &Option<usize>) -> String {
    match count {
        Some(count) => count.to_string(),
        None => "more than usize::MAX".to_string(),
    }
}

/// Failures that prevent a scan from starting.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Config(#[from] ConfigFault),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to open stage: {0}")]
    Stage(#[from] StageError),

    #[error("failed to switch on {name}: {source}")]
    InstrumentPower {
        name: String,
        #[source]
        source: InstrumentError,
    },
}
