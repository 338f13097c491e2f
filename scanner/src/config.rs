//! Scan configuration.
//!
//! A [`ScanConfig`] is stored as JSON next to every run so a resumed scan
//! uses exactly the geometry it was started with. Timing values are kept in
//! milliseconds in the file and exposed as [`Duration`]s.

use std::path::Path;
use std::time::Duration;

use hardware::stage::{Position, SettleConfig, DEFAULT_SETTLE_POLL_INTERVAL};
use hardware::usb::UsbAddress;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigFault;
use crate::lattice::{Lattice, LatticeSpec, TraversalOrder};

pub const DEFAULT_RETRY_BOUND: u32 = 3;
pub const DEFAULT_REST_INTERVAL: u32 = 5;
pub const DEFAULT_RESET_SETTLE_MS: u64 = 1000;

/// Retry and drift-rest parameters of the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Settle timeouts tolerated at one point before a transport reset.
    pub retry_bound: u32,
    /// Successful moves between two rest maneuvers.
    pub rest_interval: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry_bound: DEFAULT_RETRY_BOUND,
            rest_interval: DEFAULT_REST_INTERVAL,
        }
    }
}

/// Settle detection parameters for the stage proxy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SettleParams {
    /// Accepted per-axis deviation, in stage units.
    pub tolerance: f64,
    pub timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_SETTLE_POLL_INTERVAL.as_millis() as u64
}

impl Default for SettleParams {
    fn default() -> Self {
        Self {
            tolerance: 1e-7,
            timeout_ms: 2000,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Count-rate measurement taken at every lattice point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementConfig {
    pub dwell_ms: u64,
    /// Upper bound on waiting for one measurement to finish.
    pub timeout_ms: u64,
    pub channels: usize,
    /// Pause between a settled move and the start of counting.
    #[serde(default)]
    pub pause_ms: u64,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            dwell_ms: 100,
            timeout_ms: 2000,
            channels: 1,
            pause_ms: 0,
        }
    }
}

fn default_reset_settle_ms() -> u64 {
    DEFAULT_RESET_SETTLE_MS
}

/// Everything needed to run (or resume) one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub lattice: LatticeSpec,
    #[serde(default)]
    pub order: TraversalOrder,
    /// Safe reference position. Defaults to the lattice centre.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<Position>,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub settle: SettleParams,
    #[serde(default)]
    pub measurement: MeasurementConfig,
    /// USB address of the stage controller, reset when its transport wedges.
    pub device: UsbAddress,
    #[serde(default = "default_reset_settle_ms")]
    pub reset_settle_ms: u64,
}

impl ScanConfig {
    /// Config with default recovery, settle and measurement parameters.
    pub fn new(lattice: LatticeSpec, order: TraversalOrder, device: UsbAddress) -> Self {
        Self {
            lattice,
            order,
            center: None,
            recovery: RecoveryConfig::default(),
            settle: SettleParams::default(),
            measurement: MeasurementConfig::default(),
            device,
            reset_settle_ms: DEFAULT_RESET_SETTLE_MS,
        }
    }

    /// Reject every invalid field combination.
    pub fn validate(&self) -> Result<(), ConfigFault> {
        self.lattice.validate()?;

        if self.recovery.retry_bound == 0 {
            return Err(ConfigFault::InvalidRetryBound(self.recovery.retry_bound));
        }
        if self.recovery.rest_interval == 0 {
            return Err(ConfigFault::InvalidRestInterval(self.recovery.rest_interval));
        }

        let tol = self.settle.tolerance;
        if !tol.is_finite() || tol <= 0.0 {
            return Err(ConfigFault::InvalidTolerance(tol));
        }

        let durations = [
            ("settle timeout", self.settle.timeout_ms),
            ("settle poll interval", self.settle.poll_interval_ms),
            ("measurement dwell", self.measurement.dwell_ms),
            ("measurement timeout", self.measurement.timeout_ms),
        ];
        for (field, value) in durations {
            if value == 0 {
                return Err(ConfigFault::ZeroDuration { field });
            }
        }
        if self.measurement.timeout_ms < self.measurement.dwell_ms {
            return Err(ConfigFault::MeasurementTimeoutTooShort {
                dwell_ms: self.measurement.dwell_ms,
                timeout_ms: self.measurement.timeout_ms,
            });
        }
        if self.measurement.channels == 0 {
            return Err(ConfigFault::NoChannels);
        }

        if let Some(center) = self.center {
            let finite = center.x.is_finite()
                && center.y.is_finite()
                && center.z.map_or(true, f64::is_finite);
            if !finite || center.z.is_some() != self.lattice.z.is_some() {
                return Err(ConfigFault::CenterDimension(center));
            }
        }

        Ok(())
    }

    /// Validate and enumerate the lattice.
    pub fn build_lattice(&self) -> Result<Lattice, ConfigFault> {
        self.validate()?;
        Lattice::new(self.lattice, self.order)
    }

    /// Position the stage returns to between retries and for rest maneuvers.
    pub fn reference_position(&self) -> Position {
        self.center.unwrap_or_else(|| self.lattice.center())
    }

    /// True when both configs enumerate the same points in the same order.
    pub fn same_lattice(&self, other: &ScanConfig) -> bool {
        self.lattice == other.lattice && self.order == other.order
    }

    pub fn settle_config(&self) -> SettleConfig {
        SettleConfig {
            tolerance: self.settle.tolerance,
            timeout: Duration::from_millis(self.settle.timeout_ms),
            poll_interval: Duration::from_millis(self.settle.poll_interval_ms),
        }
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.measurement.dwell_ms)
    }

    pub fn measurement_timeout(&self) -> Duration {
        Duration::from_millis(self.measurement.timeout_ms)
    }

    pub fn measurement_pause(&self) -> Duration {
        Duration::from_millis(self.measurement.pause_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    /// Load and validate a config from JSON.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigFault> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigFault::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ScanConfig =
            serde_json::from_str(&json).map_err(|source| ConfigFault::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigFault> {
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigFault::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| ConfigFault::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}
