//! End-to-end scan scenarios against the simulated rig.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use approx::assert_abs_diff_eq;
use chrono::Utc;
use hardware::instrument::{InstrumentError, PhotonCounter};
use hardware::mock::{MockCounter, MockFault, MockRig};
use hardware::stage::Position;
use hardware::usb::TransportFault;
use scanner::config::ScanConfig;
use scanner::lattice::{AxisRange, LatticeSpec, TraversalOrder};
use scanner::recovery::{AbortReason, RecoveryEvent};
use scanner::run_store::{merge_runs, MergeError, RunId, RunStore, Sample, StoreError};
use scanner::sequencer::{run_scan, AbortCause, ScanOutcome, ScanReport, ScanSequencer};
use tempfile::TempDir;

const DEVICE: &str = "1-1.4";
const PARK: Position = Position {
    x: -1.0,
    y: -1.0,
    z: None,
};

fn grid_config(order: TraversalOrder) -> ScanConfig {
    let mut c = ScanConfig::new(
        LatticeSpec::planar(AxisRange::new(0.0, 2.0, 1.0), AxisRange::new(0.0, 2.0, 1.0)),
        order,
        DEVICE.parse().unwrap(),
    );
    c.center = Some(PARK);
    c.recovery.retry_bound = 3;
    c.recovery.rest_interval = 5;
    c.settle.tolerance = 1e-6;
    c.settle.timeout_ms = 3;
    c.settle.poll_interval_ms = 1;
    c.measurement.dwell_ms = 1;
    c.measurement.timeout_ms = 5;
    c.reset_settle_ms = 0;
    c
}

fn rig() -> MockRig {
    MockRig::new(DEVICE.parse().unwrap())
}

fn id(s: &str) -> RunId {
    RunId::new(s).unwrap()
}

fn scan_with<P: PhotonCounter>(
    config: &ScanConfig,
    store: &RunStore,
    run: &str,
    rig: &MockRig,
    counter: &mut P,
    cancel: Arc<AtomicBool>,
) -> ScanReport {
    let mut rf = rig.rf_source();
    run_scan(
        config,
        store,
        id(run),
        rig.connector(),
        rig.usb_reset(),
        counter,
        &mut [&mut rf],
        cancel,
    )
    .unwrap()
}

fn scan(config: &ScanConfig, store: &RunStore, run: &str, rig: &MockRig) -> ScanReport {
    let mut counter = rig.counter(1);
    scan_with(
        config,
        store,
        run,
        rig,
        &mut counter,
        Arc::new(AtomicBool::new(false)),
    )
}

/// Counter that raises the interrupt flag after a number of measurements.
struct InterruptAfter {
    inner: MockCounter,
    remaining: usize,
    flag: Arc<AtomicBool>,
}

impl PhotonCounter for InterruptAfter {
    fn start(&mut self, dwell: Duration) -> Result<(), InstrumentError> {
        self.inner.start(dwell)
    }

    fn wait_until_finished(&mut self, timeout: Duration) -> Result<bool, InstrumentError> {
        self.inner.wait_until_finished(timeout)
    }

    fn stop(&mut self) -> Result<(), InstrumentError> {
        self.inner.stop()
    }

    fn data(&mut self) -> Result<Vec<f64>, InstrumentError> {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.flag.store(true, Ordering::SeqCst);
        }
        self.inner.data()
    }
}

#[test]
fn clean_grid_completes_with_one_rest() {
    let tmp = TempDir::new().unwrap();
    let store = RunStore::new(tmp.path());
    let rig = rig();
    let config = grid_config(TraversalOrder::Raster);

    let report = scan(&config, &store, "clean", &rig);

    assert!(report.is_completed());
    assert_eq!(report.recorded, 9);
    assert_eq!(report.last_completed, Some(8));
    assert_eq!(report.resets, 0);
    assert_eq!(report.rest_maneuvers, 1);
    assert_eq!(
        report.events,
        vec![RecoveryEvent::Rest {
            before_index: 5,
            settled: true
        }]
    );

    // Rest happens after the fifth move, before the sixth
    let moves = rig.commanded_moves();
    assert_eq!(moves.len(), 10);
    assert_eq!(moves[5], PARK);
    assert_eq!(moves[6], Position::xy(2.0, 1.0));

    let run = store.open(&id("clean")).unwrap();
    assert!(run.is_complete());
    let indices: Vec<usize> = run.samples().map(|s| s.index).collect();
    assert_eq!(indices, (0..9).collect::<Vec<_>>());
    for s in run.samples() {
        assert_eq!(s.attempts, 1);
        assert_eq!(s.position, Position::xy((s.index % 3) as f64, (s.index / 3) as f64));
    }

    // RF source on for the scan only
    assert_eq!(rig.rf_history(), vec![true, false]);
}

#[test]
fn repeated_timeouts_escalate_to_reset() {
    let tmp = TempDir::new().unwrap();
    let store = RunStore::new(tmp.path());
    let rig = rig();
    let config = grid_config(TraversalOrder::Raster);
    rig.fail_moves_to(Position::xy(1.0, 1.0), MockFault::NeverSettles, 3);

    let report = scan(&config, &store, "glitchy", &rig);

    assert!(report.is_completed());
    assert_eq!(report.resets, 1);
    assert_eq!(rig.reset_count(), 1);
    assert!(report.events.contains(&RecoveryEvent::Reset {
        index: 4,
        cause: hardware::stage::MoveStatus::Timeout
    }));

    let run = store.open(&id("glitchy")).unwrap();
    assert_eq!(run.len(), 9);
    assert_eq!(run.sample(4).unwrap().attempts, 4);
    assert_eq!(run.sample(3).unwrap().attempts, 1);
}

#[test]
fn missing_device_aborts_and_keeps_prior_samples() {
    let tmp = TempDir::new().unwrap();
    let store = RunStore::new(tmp.path());
    let rig = rig();
    let mut config = grid_config(TraversalOrder::Raster);
    config.device = "9:9".parse().unwrap();
    rig.fail_moves_to(Position::xy(0.0, 1.0), MockFault::Wedge, 1);

    let report = scan(&config, &store, "partial", &rig);

    match &report.outcome {
        ScanOutcome::Aborted {
            index,
            cause: AbortCause::Recovery(AbortReason::ResetFailed(TransportFault::DeviceNotFound(addr))),
        } => {
            assert_eq!(*index, 3);
            assert_eq!(addr.to_string(), "9:9");
        }
        other => panic!("expected DeviceNotFound abort, got {other:?}"),
    }
    assert_eq!(report.last_completed, Some(2));
    assert_eq!(rig.rf_history(), vec![true, false]);

    let run = store.open(&id("partial")).unwrap();
    assert_eq!(run.completion_set(), BTreeSet::from([0, 1, 2]));
    assert_eq!(run.sample(2).unwrap().position, Position::xy(2.0, 0.0));
}

#[test]
fn resume_visits_exactly_the_complement() {
    let tmp = TempDir::new().unwrap();
    let store = RunStore::new(tmp.path());
    let config = grid_config(TraversalOrder::Meander);
    let lattice = ScanSequencer::new(config.clone()).unwrap().lattice().clone();

    // First pass interrupted after four points
    let first = rig();
    let flag = Arc::new(AtomicBool::new(false));
    let mut counter = InterruptAfter {
        inner: first.counter(1),
        remaining: 4,
        flag: flag.clone(),
    };
    let report = scan_with(&config, &store, "resume", &first, &mut counter, flag);
    assert!(matches!(report.outcome, ScanOutcome::Interrupted));
    assert_eq!(report.last_completed, Some(3));
    assert_eq!(
        store.completion_set(&id("resume")).unwrap(),
        BTreeSet::from([0, 1, 2, 3])
    );

    // Second pass on a fresh rig
    let second = rig();
    let report = scan(&config, &store, "resume", &second);
    assert!(report.is_completed());
    assert_eq!(report.skipped, 4);
    assert_eq!(report.recorded, 5);

    let visited: Vec<Position> = second
        .commanded_moves()
        .into_iter()
        .filter(|p| *p != PARK)
        .collect();
    let expected: Vec<Position> = lattice.points()[4..].iter().map(|p| p.position).collect();
    assert_eq!(visited, expected);

    let run = store.open(&id("resume")).unwrap();
    assert!(run.is_complete());
    assert!(run.missing().is_empty());
}

#[test]
fn resume_after_abort_with_corrected_device() {
    let tmp = TempDir::new().unwrap();
    let store = RunStore::new(tmp.path());
    let rig = rig();
    let mut wrong = grid_config(TraversalOrder::Raster);
    wrong.device = "2-1".parse().unwrap();
    rig.fail_moves_to(Position::xy(2.0, 2.0), MockFault::Busy, 1);

    let report = scan(&wrong, &store, "fixup", &rig);
    assert!(matches!(report.outcome, ScanOutcome::Aborted { index: 8, .. }));

    // Same lattice, different device: accepted as a resume
    let report = scan(&grid_config(TraversalOrder::Raster), &store, "fixup", &rig);
    assert!(report.is_completed());
    assert_eq!(report.recorded, 1);
    assert!(store.open(&id("fixup")).unwrap().is_complete());
}

#[test]
fn resume_with_other_lattice_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let store = RunStore::new(tmp.path());
    scan(&grid_config(TraversalOrder::Raster), &store, "r", &rig());

    let result = run_scan(
        &grid_config(TraversalOrder::Meander),
        &store,
        id("r"),
        rig().connector(),
        rig().usb_reset(),
        &mut rig().counter(1),
        &mut [],
        Arc::new(AtomicBool::new(false)),
    );
    assert!(matches!(
        result,
        Err(scanner::ScanError::Store(StoreError::LatticeMismatch(_)))
    ));
}

#[test]
fn torn_tail_from_crash_is_repaired_on_resume() {
    let tmp = TempDir::new().unwrap();
    let store = RunStore::new(tmp.path());
    let config = grid_config(TraversalOrder::Raster);
    let rig = rig();
    rig.hang_measurements_at(Position::xy(0.0, 2.0), 1);

    let report = scan(&config, &store, "crash", &rig);
    assert!(matches!(report.outcome, ScanOutcome::Aborted { index: 6, .. }));

    // Half-written record left by a crash
    let journal = store.run_dir(&id("crash")).join("samples.jsonl");
    let mut bytes = std::fs::read(&journal).unwrap();
    bytes.extend_from_slice(br#"{"index":6,"position":{"x":0.0,"#);
    std::fs::write(&journal, bytes).unwrap();
    assert_eq!(store.open(&id("crash")).unwrap().len(), 6);

    let report = scan(&config, &store, "crash", &rig);
    assert!(report.is_completed());
    let run = store.open(&id("crash")).unwrap();
    assert_eq!(run.completion_set(), (0..9).collect());
}

#[test]
fn append_after_scan_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let store = RunStore::new(tmp.path());
    let config = grid_config(TraversalOrder::Raster);
    scan(&config, &store, "done", &rig());

    let before = store.open(&id("done")).unwrap().sample(4).unwrap().clone();
    let mut writer = store.open_for_append(&id("done")).unwrap();
    let replay = Sample {
        payload: vec![0.0],
        timestamp: Utc::now(),
        ..before.clone()
    };
    assert!(matches!(
        writer.append(&replay),
        Err(StoreError::DuplicateIndex(4))
    ));
    assert_eq!(store.open(&id("done")).unwrap().sample(4).unwrap(), &before);
}

#[test]
fn partial_runs_merge_into_complete_dataset() {
    let tmp = TempDir::new().unwrap();
    let store = RunStore::new(tmp.path());
    let config = grid_config(TraversalOrder::Raster);

    // Run a stops at point 5
    let rig_a = rig();
    rig_a.hang_measurements_at(Position::xy(2.0, 1.0), 1);
    scan(&config, &store, "a", &rig_a);

    // Run b only records points 5..9
    let lattice = ScanSequencer::new(config.clone()).unwrap().lattice().clone();
    let mut writer = store.create(id("b"), config.clone()).unwrap();
    for point in &lattice.points()[5..] {
        writer
            .append(&Sample {
                index: point.index,
                position: point.position,
                achieved: Some(point.position),
                payload: vec![42.0],
                timestamp: Utc::now(),
                attempts: 1,
            })
            .unwrap();
    }
    drop(writer);

    let a = store.open(&id("a")).unwrap();
    let b = store.open(&id("b")).unwrap();
    assert_eq!(a.completion_set(), (0..5).collect());

    let merged = merge_runs(&[a.clone(), b.clone()]).unwrap();
    assert_eq!(merged.overlaps, 0);
    assert_eq!(merged.completion_set(), (0..9).collect());

    let run = store.write_merged(id("ab"), &merged).unwrap();
    assert!(run.is_complete());
    assert_eq!(run.sample(0).unwrap(), a.sample(0).unwrap());
    assert_eq!(run.sample(7).unwrap(), b.sample(7).unwrap());

    // A run that recorded point 4 somewhere else cannot be merged
    let mut c_writer = store.create(id("c"), config).unwrap();
    c_writer
        .append(&Sample {
            index: 4,
            position: Position::xy(1.5, 1.0),
            achieved: None,
            payload: vec![1.0],
            timestamp: Utc::now(),
            attempts: 1,
        })
        .unwrap();
    let c = store.open(&id("c")).unwrap();
    assert!(matches!(
        merge_runs(&[a, c]),
        Err(MergeError::MergeConflict { index: 4, .. })
    ));
}

#[test]
fn random_glitches_still_produce_complete_run() {
    let tmp = TempDir::new().unwrap();
    let store = RunStore::new(tmp.path());
    let mut config = grid_config(TraversalOrder::Meander);
    config.lattice = LatticeSpec::planar(AxisRange::new(0.0, 3.0, 1.0), AxisRange::new(0.0, 3.0, 1.0));
    let rig = MockRig::new(DEVICE.parse().unwrap()).with_glitches(11, 0.2, 0.0);

    let mut passes = 0;
    loop {
        passes += 1;
        let report = scan(&config, &store, "noisy", &rig);
        if report.is_completed() {
            break;
        }
        assert!(passes < 20, "scan never completed");
    }

    let run = store.open(&id("noisy")).unwrap();
    assert_eq!(run.len(), 16);
    for s in run.samples() {
        assert!(s.attempts >= 1);
        let achieved = s.achieved.unwrap();
        assert_abs_diff_eq!(achieved.x, s.position.x, epsilon = 1e-6);
        assert_abs_diff_eq!(achieved.y, s.position.y, epsilon = 1e-6);
    }
}

#[test]
fn preset_interrupt_records_nothing() {
    let tmp = TempDir::new().unwrap();
    let store = RunStore::new(tmp.path());
    let rig = rig();
    let mut counter = rig.counter(1);

    let report = scan_with(
        &grid_config(TraversalOrder::Raster),
        &store,
        "stopped",
        &rig,
        &mut counter,
        Arc::new(AtomicBool::new(true)),
    );

    assert!(matches!(report.outcome, ScanOutcome::Interrupted));
    assert_eq!(report.recorded, 0);
    assert_eq!(report.last_completed, None);
    assert!(rig.commanded_moves().is_empty());
    assert_eq!(rig.rf_history(), vec![true, false]);
    assert!(store.open(&id("stopped")).unwrap().is_empty());
}
