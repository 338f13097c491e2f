//! Simulated scan rig.
//!
//! [`MockRig`] holds the state of one simulated setup (stage, USB link, photon
//! counter, RF source) behind a shared handle so that the pieces handed to the
//! scan controller all see the same world. Tests script faults on the rig and
//! then inspect what the controller did to it.
//!
//! Faults that can be scripted:
//!
//! - per target: the stage never settles, rejects the move as busy, times out
//!   on the connection, or wedges the transport until the next reset
//! - per reset: the next N resets fail
//! - per target: the count-rate measurement hangs
//! - random: seeded probabilities for settle glitches and transport wedges

mod instruments;
mod stage;

pub use instruments::{MockCounter, MockRfSource};
pub use stage::{MockConnector, MockUsbReset, SimulatedStage};

use std::sync::{Arc, Mutex, MutexGuard};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::stage::Position;
use crate::usb::UsbAddress;

/// Positions closer than this are treated as the same target when matching
/// scripted faults.
const TARGET_MATCH_EPSILON: f64 = 1e-12;

/// Fault injected on a move command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    /// Command accepted but the stage stays where it was.
    NeverSettles,
    /// Controller reports busy for this command only.
    Busy,
    /// Controller connection times out for this command only.
    ConnectionTimeout,
    /// Transport wedges: every call fails until the device is reset.
    Wedge,
}

#[derive(Debug, Clone)]
struct ScriptedFault {
    target: Position,
    fault: MockFault,
    remaining: usize,
}

#[derive(Debug, Clone)]
struct ScriptedHang {
    target: Position,
    remaining: usize,
}

#[derive(Debug, Clone, Copy)]
struct GlitchModel {
    settle_probability: f64,
    wedge_probability: f64,
}

#[derive(Debug, Clone, Copy)]
struct Emitter {
    position: Position,
    width: f64,
    peak_rate: f64,
    background_rate: f64,
}

#[derive(Debug)]
pub(crate) struct RigState {
    device: UsbAddress,
    position: Position,
    generation: u64,
    wedged: bool,
    faults: Vec<ScriptedFault>,
    hangs: Vec<ScriptedHang>,
    failing_resets: usize,
    failing_connects: usize,
    glitches: Option<GlitchModel>,
    emitter: Emitter,
    rng: ChaCha8Rng,
    moves: Vec<Position>,
    resets: usize,
    connects: usize,
    rf_history: Vec<bool>,
}

impl RigState {
    fn take_fault(&mut self, target: &Position) -> Option<MockFault> {
        let scripted = self.faults.iter_mut().find(|f| {
            f.remaining > 0 && f.target.max_deviation(target) <= TARGET_MATCH_EPSILON
        });
        if let Some(entry) = scripted {
            entry.remaining -= 1;
            return Some(entry.fault);
        }

        let model = self.glitches?;
        let roll: f64 = self.rng.gen();
        if roll < model.wedge_probability {
            Some(MockFault::Wedge)
        } else if roll < model.wedge_probability + model.settle_probability {
            Some(MockFault::NeverSettles)
        } else {
            None
        }
    }

    fn take_hang(&mut self) -> bool {
        let position = self.position;
        match self.hangs.iter_mut().find(|h| {
            h.remaining > 0 && h.target.max_deviation(&position) <= TARGET_MATCH_EPSILON
        }) {
            Some(hang) => {
                hang.remaining -= 1;
                true
            }
            None => false,
        }
    }

    /// Gaussian emitter over background with ±2.5% multiplicative noise
    /// drawn from the rig's seeded generator.
    fn count_rates(&mut self, channels: usize) -> Vec<f64> {
        let e = self.emitter;
        let dx = self.position.x - e.position.x;
        let dy = self.position.y - e.position.y;
        let dz = match (self.position.z, e.position.z) {
            (Some(a), Some(b)) => a - b,
            _ => 0.0,
        };
        let r2 = dx * dx + dy * dy + dz * dz;
        let signal = e.peak_rate * (-r2 / (2.0 * e.width * e.width)).exp();

        (0..channels)
            .map(|ch| {
                let scale = if ch == 0 { 1.0 } else { 0.1 };
                let noise = 1.0 + 0.05 * (self.rng.gen::<f64>() - 0.5);
                (e.background_rate + signal * scale) * noise
            })
            .collect()
    }
}

/// Shared handle to one simulated rig.
#[derive(Debug, Clone)]
pub struct MockRig {
    state: Arc<Mutex<RigState>>,
}

impl MockRig {
    /// Rig whose stage controller sits at `device` on the simulated bus.
    pub fn new(device: UsbAddress) -> Self {
        let state = RigState {
            device,
            position: Position::xy(0.0, 0.0),
            generation: 0,
            wedged: false,
            faults: Vec::new(),
            hangs: Vec::new(),
            failing_resets: 0,
            failing_connects: 0,
            glitches: None,
            emitter: Emitter {
                position: Position::xy(0.0, 0.0),
                width: 1.0,
                peak_rate: 50_000.0,
                background_rate: 800.0,
            },
            rng: ChaCha8Rng::seed_from_u64(0),
            moves: Vec::new(),
            resets: 0,
            connects: 0,
            rf_history: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Enable random glitches drawn from a seeded generator.
    ///
    /// `settle_probability` is the chance a move never settles,
    /// `wedge_probability` the chance it wedges the transport.
    pub fn with_glitches(self, seed: u64, settle_probability: f64, wedge_probability: f64) -> Self {
        {
            let mut state = self.lock();
            state.rng = ChaCha8Rng::seed_from_u64(seed);
            state.glitches = Some(GlitchModel {
                settle_probability,
                wedge_probability,
            });
        }
        self
    }

    /// Place a Gaussian emitter that shapes the simulated count rate.
    pub fn with_emitter(self, position: Position, width: f64) -> Self {
        {
            let mut state = self.lock();
            state.emitter.position = position;
            state.emitter.width = width;
        }
        self
    }

    /// Inject `fault` on the next `times` moves commanded to `target`.
    pub fn fail_moves_to(&self, target: Position, fault: MockFault, times: usize) {
        self.lock().faults.push(ScriptedFault {
            target,
            fault,
            remaining: times,
        });
    }

    /// Make the next `times` measurements taken at `target` hang.
    pub fn hang_measurements_at(&self, target: Position, times: usize) {
        self.lock().hangs.push(ScriptedHang {
            target,
            remaining: times,
        });
    }

    /// Make the next `times` transport resets fail.
    pub fn fail_next_resets(&self, times: usize) {
        self.lock().failing_resets = times;
    }

    /// Make the next `times` connection attempts fail.
    pub fn fail_next_connects(&self, times: usize) {
        self.lock().failing_connects = times;
    }

    /// Wedge the transport right now.
    pub fn wedge(&self) {
        self.lock().wedged = true;
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector::new(self.clone())
    }

    pub fn usb_reset(&self) -> MockUsbReset {
        MockUsbReset::new(self.clone())
    }

    pub fn counter(&self, channels: usize) -> MockCounter {
        MockCounter::new(self.clone(), channels)
    }

    pub fn rf_source(&self) -> MockRfSource {
        MockRfSource::new(self.clone())
    }

    /// Every move command the stage accepted or rejected, in order.
    pub fn commanded_moves(&self) -> Vec<Position> {
        self.lock().moves.clone()
    }

    pub fn position(&self) -> Position {
        self.lock().position
    }

    pub fn reset_count(&self) -> usize {
        self.lock().resets
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn is_wedged(&self) -> bool {
        self.lock().wedged
    }

    /// Every RF output state that was set, in order.
    pub fn rf_history(&self) -> Vec<bool> {
        self.lock().rf_history.clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RigState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
