//! Measurement instruments used at each lattice point.
//!
//! Two capabilities are modelled: a photon counter (Swabian Time Tagger style
//! count-rate measurement) and a switchable source such as the RF generator
//! that drives the sample during a scan.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors reported by measurement instruments.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstrumentError {
    #[error("measurement did not finish within {0:?}")]
    Timeout(Duration),

    #[error("instrument communication error: {0}")]
    Communication(String),

    #[error("instrument not ready: {0}")]
    NotReady(String),
}

/// Count-rate acquisition that runs for a fixed dwell time.
pub trait PhotonCounter {
    /// Start a measurement lasting `dwell`.
    fn start(&mut self, dwell: Duration) -> Result<(), InstrumentError>;

    /// Block until the running measurement finishes or `timeout` passes.
    ///
    /// Returns `true` if the measurement finished.
    fn wait_until_finished(&mut self, timeout: Duration) -> Result<bool, InstrumentError>;

    /// Abort the running measurement.
    fn stop(&mut self) -> Result<(), InstrumentError>;

    /// Count rate per channel of the last finished measurement, in counts/s.
    fn data(&mut self) -> Result<Vec<f64>, InstrumentError>;
}

/// Switchable output of an auxiliary instrument.
pub trait InstrumentPower {
    fn name(&self) -> &str;

    fn set_output(&mut self, on: bool) -> Result<(), InstrumentError>;
}

/// Run one count-rate measurement and return the per-channel rates.
///
/// A measurement that does not finish within `timeout` is stopped and
/// reported as [`InstrumentError::Timeout`].
pub fn measure_count_rate<P: PhotonCounter + ?Sized>(
    counter: &mut P,
    dwell: Duration,
    timeout: Duration,
) -> Result<Vec<f64>, InstrumentError> {
    let started = Instant::now();
    counter.start(dwell)?;

    if !counter.wait_until_finished(timeout)? {
        warn!("Count-rate measurement exceeded {timeout:?}, stopping");
        if let Err(e) = counter.stop() {
            warn!("Failed to stop counter after timeout: {e}");
        }
        return Err(InstrumentError::Timeout(timeout));
    }

    let rates = counter.data()?;
    debug!(
        "Count rate measured in {:?}: {:?}",
        started.elapsed(),
        rates
    );
    Ok(rates)
}
