//! Glitch detection and recovery.
//!
//! Every scheduled stage move goes through [`GlitchRecovery::move_to`], which
//! classifies the outcome reported by the stage proxy and picks a remedy:
//!
//! | outcome          | remedy                                                     |
//! |------------------|------------------------------------------------------------|
//! | `Settled`        | count a success, continue                                  |
//! | `Timeout`        | back to the reference position, retry (up to the bound)    |
//! | `TransportError` | transport reset straight away                              |
//!
//! A reset drops the stage handle, power-cycles the USB device, reconnects
//! and retries the move exactly once. If the reset, the reconnect or that
//! last retry fails the move is aborted; the caller stops the scan.
//!
//! Independently of faults, after every `rest_interval` successful moves the
//! next move is preceded by a rest maneuver (visit the reference position,
//! then re-approach) to bound piezo drift.

use std::fmt;

use hardware::stage::{
    MoveOutcome, MoveStatus, Position, SettleConfig, StageConnector, StageError, StageProxy,
};
use hardware::usb::{TransportFault, TransportReset, UsbAddress};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::ScanConfig;

/// Counts consecutive successful moves since the last rest maneuver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestCounter {
    interval: u32,
    count: u32,
}

impl RestCounter {
    pub fn new(interval: u32) -> Self {
        Self { interval, count: 0 }
    }

    pub fn record_success(&mut self) {
        self.count += 1;
    }

    /// True once `interval` successes have accumulated.
    pub fn is_due(&self) -> bool {
        self.count >= self.interval
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Where the policy currently is for the move being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryState {
    Attempting,
    Settled,
    Retrying,
    Resetting,
    Resting,
    Aborted,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Something the recovery policy did besides a plain move.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RecoveryEvent {
    /// Rest maneuver executed before the move to `before_index`.
    Rest { before_index: usize, settled: bool },
    /// Move to `index` failed with `status` and will be attempted again.
    Retry {
        index: usize,
        attempt: u32,
        status: MoveStatus,
    },
    /// Transport reset triggered while moving to `index`.
    Reset { index: usize, cause: MoveStatus },
    /// Move to `index` could not be completed.
    Aborted { index: usize, reason: String },
}

/// Why a move was given up.
#[derive(Error, Debug)]
pub enum AbortReason {
    #[error("transport reset failed: {0}")]
    ResetFailed(#[source] TransportFault),

    #[error("stage reconnect after reset failed: {0}")]
    Reconnect(#[source] StageError),

    #[error("transport error persisted after reset: {0}")]
    TransportAfterReset(String),

    #[error("stage did not settle after reset")]
    TimeoutAfterReset,

    #[error("no stage handle available")]
    HandleUnavailable,
}

/// Parameters of the recovery policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    pub device: UsbAddress,
    pub settle: SettleConfig,
    /// Consecutive settle timeouts tolerated before a reset.
    pub retry_bound: u32,
    pub rest_interval: u32,
    /// Safe position visited between retries and during rests.
    pub reference: Position,
}

impl RecoveryPolicy {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            device: config.device.clone(),
            settle: config.settle_config(),
            retry_bound: config.recovery.retry_bound,
            rest_interval: config.recovery.rest_interval,
            reference: config.reference_position(),
        }
    }
}

/// A move that reached its target.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveSuccess {
    pub outcome: MoveOutcome,
    /// Move attempts including the successful one.
    pub attempts: u32,
}

/// Stage access with bounded retry, reset and rest handling.
///
/// Owns the only stage handle, so nothing else can touch the stage while a
/// reset is in progress.
pub struct GlitchRecovery<C: StageConnector, R: TransportReset> {
    connector: C,
    transport: R,
    policy: RecoveryPolicy,
    proxy: Option<StageProxy<C::Stage>>,
    rest: RestCounter,
    state: RecoveryState,
    events: Vec<RecoveryEvent>,
    resets: usize,
    rest_maneuvers: usize,
}

impl<C: StageConnector, R: TransportReset> GlitchRecovery<C, R> {
    /// Open the stage and start with a fresh rest counter.
    pub fn new(mut connector: C, transport: R, policy: RecoveryPolicy) -> Result<Self, StageError> {
        let stage = connector.connect()?;
        Ok(Self {
            proxy: Some(StageProxy::new(stage, policy.settle)),
            rest: RestCounter::new(policy.rest_interval),
            connector,
            transport,
            policy,
            state: RecoveryState::Attempting,
            events: Vec::new(),
            resets: 0,
            rest_maneuvers: 0,
        })
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn rest_counter(&self) -> &RestCounter {
        &self.rest
    }

    /// Resets attempted so far.
    pub fn resets(&self) -> usize {
        self.resets
    }

    pub fn rest_maneuvers(&self) -> usize {
        self.rest_maneuvers
    }

    /// Drain the events recorded since the last call.
    pub fn take_events(&mut self) -> Vec<RecoveryEvent> {
        std::mem::take(&mut self.events)
    }

    /// Stop stage motion if a handle is open.
    pub fn stop(&mut self) {
        if let Some(proxy) = self.proxy.as_mut() {
            if let Err(e) = proxy.stop() {
                warn!("Failed to stop stage: {e}");
            }
        }
    }

    /// Move to the lattice point `index` at `target`, recovering from glitches.
    pub fn move_to(&mut self, index: usize, target: Position) -> Result<MoveSuccess, AbortReason> {
        if self.rest.is_due() {
            self.rest_maneuver(index);
        }

        self.state = RecoveryState::Attempting;
        let mut attempts = 0u32;
        let mut timeouts = 0u32;

        let cause = loop {
            attempts += 1;
            let outcome = self.attempt(index, target)?;
            match outcome.status {
                MoveStatus::Settled => return Ok(self.settled(index, outcome, attempts)),
                MoveStatus::Timeout => {
                    timeouts += 1;
                    warn!(
                        "Move to point {index} at {target} did not settle (attempt {attempts}, last read {:?})",
                        outcome.achieved
                    );
                    if timeouts >= self.policy.retry_bound {
                        break MoveStatus::Timeout;
                    }
                    self.state = RecoveryState::Retrying;
                    self.events.push(RecoveryEvent::Retry {
                        index,
                        attempt: attempts,
                        status: MoveStatus::Timeout,
                    });
                    self.return_to_reference();
                }
                MoveStatus::TransportError => {
                    warn!(
                        "Transport error moving to point {index}: {}",
                        outcome.detail.as_deref().unwrap_or("unknown")
                    );
                    break MoveStatus::TransportError;
                }
            }
        };

        self.reset_transport(index, cause)?;

        attempts += 1;
        let outcome = self.attempt(index, target)?;
        match outcome.status {
            MoveStatus::Settled => Ok(self.settled(index, outcome, attempts)),
            MoveStatus::Timeout => Err(self.abort(index, AbortReason::TimeoutAfterReset)),
            MoveStatus::TransportError => {
                let detail = outcome.detail.unwrap_or_default();
                Err(self.abort(index, AbortReason::TransportAfterReset(detail)))
            }
        }
    }

    fn attempt(&mut self, index: usize, target: Position) -> Result<MoveOutcome, AbortReason> {
        match self.proxy.as_mut() {
            Some(proxy) => Ok(proxy.move_to(target)),
            None => Err(self.abort(index, AbortReason::HandleUnavailable)),
        }
    }

    fn settled(&mut self, index: usize, outcome: MoveOutcome, attempts: u32) -> MoveSuccess {
        self.state = RecoveryState::Settled;
        self.rest.record_success();
        debug!(
            "Point {index} settled in {:?} after {attempts} attempt(s)",
            outcome.settle_time
        );
        MoveSuccess { outcome, attempts }
    }

    /// Visit the reference position. Failures are logged only: the next
    /// scheduled move classifies the stage state on its own.
    fn return_to_reference(&mut self) -> bool {
        let reference = self.policy.reference;
        let Some(proxy) = self.proxy.as_mut() else {
            return false;
        };
        let outcome = proxy.move_to(reference);
        if !outcome.is_settled() {
            warn!(
                "Return to reference {reference} ended with {:?}",
                outcome.status
            );
        }
        outcome.is_settled()
    }

    fn rest_maneuver(&mut self, before_index: usize) {
        self.state = RecoveryState::Resting;
        info!(
            "Rest maneuver after {} moves, before point {before_index}",
            self.rest.count()
        );
        let settled = self.return_to_reference();
        self.rest.reset();
        self.rest_maneuvers += 1;
        self.events.push(RecoveryEvent::Rest {
            before_index,
            settled,
        });
    }

    fn reset_transport(&mut self, index: usize, cause: MoveStatus) -> Result<(), AbortReason> {
        self.state = RecoveryState::Resetting;
        self.resets += 1;
        self.events.push(RecoveryEvent::Reset { index, cause });

        // The old handle dies with the reset
        self.proxy = None;
        info!(
            "Resetting USB device {} after {:?} at point {index}",
            self.policy.device, cause
        );

        if let Err(fault) = self.transport.reset(&self.policy.device) {
            return Err(self.abort(index, AbortReason::ResetFailed(fault)));
        }

        match self.connector.connect() {
            Ok(stage) => {
                self.proxy = Some(StageProxy::new(stage, self.policy.settle));
                info!("Stage reconnected after reset");
                Ok(())
            }
            Err(e) => Err(self.abort(index, AbortReason::Reconnect(e))),
        }
    }

    fn abort(&mut self, index: usize, reason: AbortReason) -> AbortReason {
        self.state = RecoveryState::Aborted;
        error!("Aborting at point {index}: {reason}");
        self.events.push(RecoveryEvent::Aborted {
            index,
            reason: reason.to_string(),
        });
        reason
    }
}
