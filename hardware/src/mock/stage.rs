use std::thread;
use std::time::Duration;

use tracing::debug;

use super::{MockFault, MockRig};
use crate::stage::{Position, StageConnector, StageError, StageInterface, StageResult};
use crate::usb::{TransportFault, TransportReset, UsbAddress};

/// Opens [`SimulatedStage`] handles on a [`MockRig`].
#[derive(Debug, Clone)]
pub struct MockConnector {
    rig: MockRig,
}

impl MockConnector {
    pub(crate) fn new(rig: MockRig) -> Self {
        Self { rig }
    }
}

impl StageConnector for MockConnector {
    type Stage = SimulatedStage;

    fn connect(&mut self) -> StageResult<SimulatedStage> {
        let mut state = self.rig.lock();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(StageError::Connect("simulated connect failure".to_string()));
        }
        if state.wedged {
            return Err(StageError::Connect("controller not responding".to_string()));
        }
        Ok(SimulatedStage {
            rig: self.rig.clone(),
            generation: state.generation,
        })
    }
}

/// Stage handle bound to the transport generation it was opened on.
#[derive(Debug)]
pub struct SimulatedStage {
    rig: MockRig,
    generation: u64,
}

impl StageInterface for SimulatedStage {
    fn move_to(&mut self, target: Position) -> StageResult<()> {
        let mut state = self.rig.lock();
        if state.generation != self.generation {
            return Err(StageError::StaleHandle);
        }
        state.moves.push(target);
        if state.wedged {
            return Err(StageError::Busy("transport wedged".to_string()));
        }

        match state.take_fault(&target) {
            None => {
                state.position = target;
                Ok(())
            }
            Some(MockFault::NeverSettles) => {
                debug!("Simulated stage will not settle at {target}");
                Ok(())
            }
            Some(MockFault::Busy) => Err(StageError::Busy("simulated busy".to_string())),
            Some(MockFault::ConnectionTimeout) => Err(StageError::ConnectionTimeout(
                "simulated connection timeout".to_string(),
            )),
            Some(MockFault::Wedge) => {
                debug!("Simulated transport wedged moving to {target}");
                state.wedged = true;
                Err(StageError::ConnectionTimeout("transport wedged".to_string()))
            }
        }
    }

    fn position(&mut self) -> StageResult<Position> {
        let state = self.rig.lock();
        if state.generation != self.generation {
            return Err(StageError::StaleHandle);
        }
        if state.wedged {
            return Err(StageError::ConnectionTimeout("transport wedged".to_string()));
        }
        Ok(state.position)
    }
}

/// Simulated bus reset: clears a wedge and invalidates open handles.
#[derive(Debug, Clone)]
pub struct MockUsbReset {
    rig: MockRig,
    settle: Duration,
}

impl MockUsbReset {
    pub(crate) fn new(rig: MockRig) -> Self {
        Self {
            rig,
            settle: Duration::ZERO,
        }
    }

    /// Sleep this long between deauthorize and reauthorize.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

impl TransportReset for MockUsbReset {
    fn reset(&mut self, address: &UsbAddress) -> Result<(), TransportFault> {
        {
            let mut state = self.rig.lock();
            if *address != state.device {
                return Err(TransportFault::DeviceNotFound(address.clone()));
            }
            // Handles die as soon as the device is deauthorized
            state.generation += 1;
            if state.failing_resets > 0 {
                state.failing_resets -= 1;
                return Err(TransportFault::Other(format!(
                    "simulated reauthorize failure on {address}"
                )));
            }
        }

        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }

        let mut state = self.rig.lock();
        state.wedged = false;
        state.resets += 1;
        debug!("Simulated reset of {address} (generation {})", state.generation);
        Ok(())
    }
}
