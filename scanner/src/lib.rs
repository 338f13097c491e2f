//! Fault-tolerant piezo raster scan controller.
//!
//! - [`config`]: scan configuration and validation
//! - [`lattice`]: lattice enumeration in raster or meander order
//! - [`recovery`]: glitch classification, retry / reset / abort, drift rests
//! - [`sequencer`]: per-point move, measure, record loop
//! - [`run_store`]: append-only run persistence, resume and merge

pub mod config;
pub mod errors;
pub mod lattice;
pub mod recovery;
pub mod run_store;
pub mod sequencer;

pub use config::ScanConfig;
pub use errors::{ConfigFault, ScanError};
pub use lattice::{AxisRange, Lattice, LatticePoint, LatticeSpec, TraversalOrder};
pub use recovery::{AbortReason, GlitchRecovery, RecoveryEvent, RecoveryPolicy, RecoveryState};
pub use run_store::{merge_runs, MergeError, Run, RunId, RunStore, Sample, StoreError};
pub use sequencer::{run_scan, ScanOutcome, ScanReport, ScanSequencer};
