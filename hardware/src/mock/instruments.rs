use std::thread;
use std::time::Duration;

use super::MockRig;
use crate::instrument::{InstrumentError, InstrumentPower, PhotonCounter};

/// Photon counter whose rate follows the rig's emitter and stage position.
#[derive(Debug)]
pub struct MockCounter {
    rig: MockRig,
    channels: usize,
    running: bool,
    hung: bool,
    rates: Option<Vec<f64>>,
}

impl MockCounter {
    pub(crate) fn new(rig: MockRig, channels: usize) -> Self {
        Self {
            rig,
            channels,
            running: false,
            hung: false,
            rates: None,
        }
    }
}

impl PhotonCounter for MockCounter {
    fn start(&mut self, _dwell: Duration) -> Result<(), InstrumentError> {
        let mut state = self.rig.lock();
        self.hung = state.take_hang();
        self.rates = if self.hung {
            None
        } else {
            Some(state.count_rates(self.channels))
        };
        self.running = true;
        Ok(())
    }

    fn wait_until_finished(&mut self, timeout: Duration) -> Result<bool, InstrumentError> {
        if !self.running {
            return Err(InstrumentError::NotReady("no measurement running".to_string()));
        }
        if self.hung {
            thread::sleep(timeout);
            return Ok(false);
        }
        self.running = false;
        Ok(true)
    }

    fn stop(&mut self) -> Result<(), InstrumentError> {
        self.running = false;
        self.hung = false;
        Ok(())
    }

    fn data(&mut self) -> Result<Vec<f64>, InstrumentError> {
        self.rates
            .clone()
            .ok_or_else(|| InstrumentError::NotReady("no finished measurement".to_string()))
    }
}

/// Switchable RF source that records every output change on the rig.
#[derive(Debug, Clone)]
pub struct MockRfSource {
    rig: MockRig,
}

impl MockRfSource {
    pub(crate) fn new(rig: MockRig) -> Self {
        Self { rig }
    }
}

impl InstrumentPower for MockRfSource {
    fn name(&self) -> &str {
        "mock RF source"
    }

    fn set_output(&mut self, on: bool) -> Result<(), InstrumentError> {
        self.rig.lock().rf_history.push(on);
        Ok(())
    }
}
