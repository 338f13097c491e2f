//! Scan sequencer.
//!
//! Walks the lattice in traversal order and, for every point not yet in the
//! run, moves the stage through the recovery policy, measures the count rate
//! and appends the sample to the run. Stage, counter and store are used
//! strictly one after the other on the calling thread.
//!
//! The cancel flag is checked between points only, so an interrupt never
//! splits a move from its measurement or leaves a half-written sample.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use hardware::instrument::{measure_count_rate, InstrumentError, InstrumentPower, PhotonCounter};
use hardware::stage::StageConnector;
use hardware::usb::TransportReset;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::ScanConfig;
use crate::errors::{ConfigFault, ScanError};
use crate::lattice::{Lattice, LatticePoint};
use crate::recovery::{AbortReason, GlitchRecovery, RecoveryEvent, RecoveryPolicy};
use crate::run_store::{RunId, RunStore, RunWriter, Sample, StoreError};

/// Why a scan stopped before the end of the lattice.
#[derive(Error, Debug)]
pub enum AbortCause {
    #[error(transparent)]
    Recovery(#[from] AbortReason),

    #[error("measurement failed: {0}")]
    Measurement(#[from] InstrumentError),

    #[error("failed to record sample: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub enum ScanOutcome {
    /// Every lattice point is recorded.
    Completed,
    /// Operator interrupt observed between points.
    Interrupted,
    /// Forward progress stopped at `index`. The run stays resumable.
    Aborted { index: usize, cause: AbortCause },
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanOutcome::Completed => write!(f, "completed"),
            ScanOutcome::Interrupted => write!(f, "interrupted"),
            ScanOutcome::Aborted { index, cause } => {
                write!(f, "aborted at point {index}: {cause}")
            }
        }
    }
}

/// Terminal report of one scan pass.
#[derive(Debug)]
pub struct ScanReport {
    pub run_id: RunId,
    pub outcome: ScanOutcome,
    pub total_points: usize,
    /// Samples recorded during this pass.
    pub recorded: usize,
    /// Points skipped because the run already had them.
    pub skipped: usize,
    /// Last point recorded in this pass, or the highest previously recorded
    /// point if this pass recorded nothing.
    pub last_completed: Option<usize>,
    pub rest_maneuvers: usize,
    pub resets: usize,
    pub events: Vec<RecoveryEvent>,
}

impl ScanReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, ScanOutcome::Completed)
    }
}

/// Drives one scan over a lattice.
#[derive(Debug, Clone)]
pub struct ScanSequencer {
    config: ScanConfig,
    lattice: Lattice,
    cancel: Arc<AtomicBool>,
}

impl ScanSequencer {
    /// Validate the config and enumerate its lattice.
    pub fn new(config: ScanConfig) -> Result<Self, ConfigFault> {
        let lattice = config.build_lattice()?;
        Ok(Self {
            config,
            lattice,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Use an externally owned interrupt flag.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    /// Points not in `completed`, in traversal order.
    pub fn pending<'a>(
        &'a self,
        completed: &'a BTreeSet<usize>,
    ) -> impl Iterator<Item = &'a LatticePoint> + 'a {
        self.lattice
            .points()
            .iter()
            .filter(move |p| !completed.contains(&p.index))
    }

    /// Scan every point missing from `writer`.
    ///
    /// Instruments are switched on before the first move and switched off on
    /// every exit path.
    pub fn run<C, R, P>(
        &self,
        recovery: &mut GlitchRecovery<C, R>,
        counter: &mut P,
        instruments: &mut [&mut dyn InstrumentPower],
        writer: &mut RunWriter,
    ) -> Result<ScanReport, ScanError>
    where
        C: StageConnector,
        R: TransportReset,
        P: PhotonCounter + ?Sized,
    {
        switch_on(instruments)?;
        let report = self.visit_points(recovery, counter, writer);
        switch_off(instruments);

        match &report.outcome {
            ScanOutcome::Completed => info!(
                "Scan {} completed: {} recorded, {} skipped, {} rests, {} resets",
                report.run_id, report.recorded, report.skipped, report.rest_maneuvers, report.resets
            ),
            ScanOutcome::Interrupted => warn!(
                "Scan {} interrupted after point {:?}",
                report.run_id, report.last_completed
            ),
            ScanOutcome::Aborted { index, cause } => error!(
                "Scan {} aborted at point {index} (last completed {:?}): {cause}",
                report.run_id, report.last_completed
            ),
        }
        Ok(report)
    }

    fn visit_points<C, R, P>(
        &self,
        recovery: &mut GlitchRecovery<C, R>,
        counter: &mut P,
        writer: &mut RunWriter,
    ) -> ScanReport
    where
        C: StageConnector,
        R: TransportReset,
        P: PhotonCounter + ?Sized,
    {
        let already = writer.completion_set().clone();
        let mut recorded = 0;
        let mut last_recorded = None;
        let mut outcome = ScanOutcome::Completed;

        if !already.is_empty() {
            info!(
                "Resuming: {} of {} points already recorded",
                already.len(),
                self.lattice.len()
            );
        }

        for point in self.pending(&already) {
            if self.cancel.load(Ordering::SeqCst) {
                info!("Interrupt requested, stopping before point {}", point.index);
                outcome = ScanOutcome::Interrupted;
                break;
            }

            match self.visit(point, recovery, counter, writer) {
                Ok(()) => {
                    recorded += 1;
                    last_recorded = Some(point.index);
                }
                Err(cause) => {
                    recovery.stop();
                    outcome = ScanOutcome::Aborted {
                        index: point.index,
                        cause,
                    };
                    break;
                }
            }

            if (point.index + 1) % self.lattice.row_len() == 0 {
                debug!(
                    "Row done at point {} ({}/{} recorded)",
                    point.index,
                    writer.completion_set().len(),
                    self.lattice.len()
                );
            }
        }

        ScanReport {
            run_id: writer.id().clone(),
            outcome,
            total_points: self.lattice.len(),
            recorded,
            skipped: already.len(),
            last_completed: last_recorded.or_else(|| already.last().copied()),
            rest_maneuvers: recovery.rest_maneuvers(),
            resets: recovery.resets(),
            events: recovery.take_events(),
        }
    }

    fn visit<C, R, P>(
        &self,
        point: &LatticePoint,
        recovery: &mut GlitchRecovery<C, R>,
        counter: &mut P,
        writer: &mut RunWriter,
    ) -> Result<(), AbortCause>
    where
        C: StageConnector,
        R: TransportReset,
        P: PhotonCounter + ?Sized,
    {
        let moved = recovery.move_to(point.index, point.position)?;
        let pause = self.config.measurement_pause();
        if !pause.is_zero() {
            thread::sleep(pause);
        }
        let payload = measure_count_rate(
            counter,
            self.config.dwell(),
            self.config.measurement_timeout(),
        )?;

        let sample = Sample {
            index: point.index,
            position: point.position,
            achieved: moved.outcome.achieved,
            payload,
            timestamp: Utc::now(),
            attempts: moved.attempts,
        };
        writer.append(&sample)?;
        debug!("Point {} at {} recorded", point.index, point.position);
        Ok(())
    }
}

fn switch_on(instruments: &mut [&mut dyn InstrumentPower]) -> Result<(), ScanError> {
    for i in 0..instruments.len() {
        let result = instruments[i].set_output(true);
        if let Err(source) = result {
            let name = instruments[i].name().to_string();
            switch_off(&mut instruments[..i]);
            return Err(ScanError::InstrumentPower { name, source });
        }
        info!("{} output on", instruments[i].name());
    }
    Ok(())
}

fn switch_off(instruments: &mut [&mut dyn InstrumentPower]) {
    for instrument in instruments.iter_mut() {
        match instrument.set_output(false) {
            Ok(()) => info!("{} output off", instrument.name()),
            Err(e) => warn!("Failed to switch off {}: {e}", instrument.name()),
        }
    }
}

/// Open (or resume) `run_id` and scan whatever is missing.
///
/// The config is validated before the stage is opened; a run that is
/// already complete does not touch the hardware at all.
#[allow(clippy::too_many_arguments)]
pub fn run_scan<C, R, P>(
    config: &ScanConfig,
    store: &RunStore,
    run_id: RunId,
    connector: C,
    transport: R,
    counter: &mut P,
    instruments: &mut [&mut dyn InstrumentPower],
    cancel: Arc<AtomicBool>,
) -> Result<ScanReport, ScanError>
where
    C: StageConnector,
    R: TransportReset,
    P: PhotonCounter + ?Sized,
{
    let sequencer = ScanSequencer::new(config.clone())?.with_cancel_flag(cancel);
    let mut writer = store.open_or_create(run_id, config.clone())?;

    if writer.completion_set().len() == sequencer.lattice().len() {
        info!("Run {} is already complete", writer.id());
        return Ok(ScanReport {
            run_id: writer.id().clone(),
            outcome: ScanOutcome::Completed,
            total_points: sequencer.lattice().len(),
            recorded: 0,
            skipped: writer.completion_set().len(),
            last_completed: writer.completion_set().last().copied(),
            rest_maneuvers: 0,
            resets: 0,
            events: Vec::new(),
        });
    }

    let mut recovery = GlitchRecovery::new(connector, transport, RecoveryPolicy::from_config(config))?;
    sequencer.run(&mut recovery, counter, instruments, &mut writer)
}
