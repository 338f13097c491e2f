//! Piezo Stage Proxy
//!
//! This module wraps a closed-loop piezo positioner (e.g. an Attocube ANC350
//! driving the cryostat sample stage) behind a small capability interface and
//! adds the settle logic the raw controller does not provide.
//!
//! # Overview
//!
//! The controller itself only knows two things: accept a target and report
//! where the stage currently is. [`StageProxy::move_to`] issues the target and
//! then polls the achieved position until every commanded axis is within the
//! configured tolerance, or the settle timeout elapses.
//!
//! Failures are classified into two distinct buckets:
//!
//! - **TransportError**: the controller reported busy, a connection timeout, or
//!   any other communication failure. Repositioning will not help.
//! - **Timeout**: the transport is healthy but the stage never settled.
//!
//! # Handles
//!
//! Stage handles are acquired through a [`StageConnector`]. After a USB reset
//! every previously opened handle must be treated as invalid, so the proxy is
//! dropped and a new one is built from a fresh `connect()`.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default polling interval while waiting for the stage to settle.
pub const DEFAULT_SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Stage coordinate in physical units (metres for the ANC350 stage).
///
/// `z` is `None` for planar scans; the z axis is then never commanded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl Position {
    /// Planar position (x, y).
    pub fn xy(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }

    /// Volumetric position (x, y, z).
    pub fn xyz(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z: Some(z) }
    }

    /// Check whether `achieved` is within `tolerance` of this target on every
    /// axis this target commands.
    pub fn is_reached_by(&self, achieved: &Position, tolerance: f64) -> bool {
        let z_ok = match (self.z, achieved.z) {
            (None, _) => true,
            (Some(target), Some(actual)) => (target - actual).abs() <= tolerance,
            (Some(_), None) => false,
        };
        (self.x - achieved.x).abs() <= tolerance && (self.y - achieved.y).abs() <= tolerance && z_ok
    }

    /// Largest per-axis deviation between two positions.
    pub fn max_deviation(&self, other: &Position) -> f64 {
        let dz = match (self.z, other.z) {
            (Some(a), Some(b)) => (a - b).abs(),
            (None, None) => 0.0,
            _ => f64::INFINITY,
        };
        (self.x - other.x).abs().max((self.y - other.y).abs()).max(dz)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.z {
            Some(z) => write!(f, "({:.6e}, {:.6e}, {:.6e})", self.x, self.y, z),
            None => write!(f, "({:.6e}, {:.6e})", self.x, self.y),
        }
    }
}

/// Errors reported by the stage controller transport.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    /// Controller refused the request because the USB link is busy.
    #[error("USB busy: {0}")]
    Busy(String),

    /// No response from the controller within the transport timeout.
    #[error("USB connection timeout: {0}")]
    ConnectionTimeout(String),

    /// Handle was invalidated (e.g. by a transport reset) and must be reopened.
    #[error("stage handle is stale, reconnect required")]
    StaleHandle,

    /// Controller could not be opened.
    #[error("failed to connect to stage controller: {0}")]
    Connect(String),

    /// Any other controller communication failure.
    #[error("stage communication error: {0}")]
    Communication(String),
}

/// Result type for stage transport operations.
pub type StageResult<T> = Result<T, StageError>;

/// Raw capability of a positioning controller.
pub trait StageInterface {
    /// Command an absolute move. Returns as soon as the command is accepted.
    fn move_to(&mut self, target: Position) -> StageResult<()>;

    /// Read the currently achieved position.
    fn position(&mut self) -> StageResult<Position>;

    /// Stop all motion.
    fn stop(&mut self) -> StageResult<()> {
        Ok(())
    }
}

/// Opens stage handles. Each call returns a fresh handle.
pub trait StageConnector {
    type Stage: StageInterface;

    fn connect(&mut self) -> StageResult<Self::Stage>;
}

/// Classified result of a single move attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveStatus {
    Settled,
    Timeout,
    TransportError,
}

/// Outcome of [`StageProxy::move_to`].
#[derive(Debug, Clone, PartialEq)]
pub struct MoveOutcome {
    /// Target that was commanded.
    pub requested: Position,
    /// Last position read back from the controller, if any read succeeded.
    pub achieved: Option<Position>,
    /// Time from issuing the command until the outcome was decided.
    pub settle_time: Duration,
    pub status: MoveStatus,
    /// Transport error text when `status` is `TransportError`.
    pub detail: Option<String>,
}

impl MoveOutcome {
    pub fn is_settled(&self) -> bool {
        self.status == MoveStatus::Settled
    }
}

/// Settling parameters for the proxy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettleConfig {
    /// Maximum per-axis deviation accepted as "on target".
    pub tolerance: f64,
    /// Upper bound on the wait for the stage to settle.
    pub timeout: Duration,
    /// Interval between position reads.
    pub poll_interval: Duration,
}

impl SettleConfig {
    pub fn new(tolerance: f64, timeout: Duration) -> Self {
        Self {
            tolerance,
            timeout,
            poll_interval: DEFAULT_SETTLE_POLL_INTERVAL,
        }
    }
}

/// Settle-aware wrapper around a stage handle.
pub struct StageProxy<S: StageInterface> {
    stage: S,
    settle: SettleConfig,
}

impl<S: StageInterface> StageProxy<S> {
    pub fn new(stage: S, settle: SettleConfig) -> Self {
        Self { stage, settle }
    }

    /// Read the current position straight from the controller.
    pub fn position(&mut self) -> StageResult<Position> {
        self.stage.position()
    }

    /// Stop motion on the underlying controller.
    pub fn stop(&mut self) -> StageResult<()> {
        self.stage.stop()
    }

    /// Move to `target` and wait for it to settle.
    ///
    /// Polls the achieved position every `poll_interval` until all commanded
    /// axes are within `tolerance`, or until `timeout` has elapsed. The
    /// position is always read at least once, even with a zero timeout.
    pub fn move_to(&mut self, target: Position) -> MoveOutcome {
        let start = Instant::now();

        if let Err(err) = self.stage.move_to(target) {
            return Self::transport_failure(target, None, start, err);
        }

        let mut achieved = None;
        loop {
            match self.stage.position() {
                Ok(pos) => {
                    achieved = Some(pos);
                    if target.is_reached_by(&pos, self.settle.tolerance) {
                        return MoveOutcome {
                            requested: target,
                            achieved,
                            settle_time: start.elapsed(),
                            status: MoveStatus::Settled,
                            detail: None,
                        };
                    }
                }
                Err(err) => return Self::transport_failure(target, achieved, start, err),
            }

            if start.elapsed() >= self.settle.timeout {
                debug!(
                    "Stage did not settle at {target} within {:?} (last read {:?})",
                    self.settle.timeout, achieved
                );
                return MoveOutcome {
                    requested: target,
                    achieved,
                    settle_time: start.elapsed(),
                    status: MoveStatus::Timeout,
                    detail: None,
                };
            }

            std::thread::sleep(self.settle.poll_interval);
        }
    }

    fn transport_failure(
        target: Position,
        achieved: Option<Position>,
        start: Instant,
        err: StageError,
    ) -> MoveOutcome {
        debug!("Stage transport failure moving to {target}: {err}");
        MoveOutcome {
            requested: target,
            achieved,
            settle_time: start.elapsed(),
            status: MoveStatus::TransportError,
            detail: Some(err.to_string()),
        }
    }
}
