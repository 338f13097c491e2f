//! Merging partial runs of the same lattice.
//!
//! Runs are combined index by index. Where two runs both recorded an index,
//! the commanded positions must agree; a disagreement means the runs do not
//! describe the same scan and is reported as a conflict for the operator.

use std::collections::{BTreeMap, BTreeSet};

use hardware::Position;
use thiserror::Error;
use tracing::{info, warn};

use super::{Run, RunId, Sample};
use crate::config::ScanConfig;

/// Largest position difference treated as the same commanded point.
pub const MERGE_POSITION_EPSILON: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MergeError {
    #[error("nothing to merge")]
    Empty,

    #[error("run {other} does not share the lattice and traversal order of run {first}")]
    LatticeMismatch { first: RunId, other: RunId },

    #[error(
        "merge conflict at index {index}: run {first_run} recorded {first_position}, \
         run {other_run} recorded {other_position}"
    )]
    MergeConflict {
        index: usize,
        first_run: RunId,
        first_position: Position,
        other_run: RunId,
        other_position: Position,
    },
}

/// Union of several runs, not yet persisted.
#[derive(Debug, Clone)]
pub struct MergedRun {
    /// Config of the first input run.
    pub config: ScanConfig,
    pub sources: Vec<RunId>,
    pub samples: BTreeMap<usize, Sample>,
    /// Indices present in more than one input.
    pub overlaps: usize,
}

impl MergedRun {
    pub fn completion_set(&self) -> BTreeSet<usize> {
        self.samples.keys().copied().collect()
    }

    pub fn missing(&self) -> Vec<usize> {
        (0..self.config.lattice.point_count())
            .filter(|i| !self.samples.contains_key(i))
            .collect()
    }
}

/// Merge runs in the given order. For overlapping indices the first run's
/// sample is kept.
pub fn merge_runs(runs: &[Run]) -> Result<MergedRun, MergeError> {
    let Some(first) = runs.first() else {
        return Err(MergeError::Empty);
    };

    for run in &runs[1..] {
        if !first.config().same_lattice(run.config()) {
            return Err(MergeError::LatticeMismatch {
                first: first.id().clone(),
                other: run.id().clone(),
            });
        }
    }

    let mut samples: BTreeMap<usize, Sample> = BTreeMap::new();
    let mut owners: BTreeMap<usize, &RunId> = BTreeMap::new();
    let mut overlaps = 0;

    for run in runs {
        for sample in run.samples() {
            match samples.get(&sample.index) {
                None => {
                    samples.insert(sample.index, sample.clone());
                    owners.insert(sample.index, run.id());
                }
                Some(kept) => {
                    if kept.position.max_deviation(&sample.position) > MERGE_POSITION_EPSILON {
                        let first_run = owners
                            .get(&sample.index)
                            .map(|id| (*id).clone())
                            .unwrap_or_else(|| first.id().clone());
                        warn!(
                            "Merge conflict at index {}: {} vs {}",
                            sample.index, kept.position, sample.position
                        );
                        return Err(MergeError::MergeConflict {
                            index: sample.index,
                            first_run,
                            first_position: kept.position,
                            other_run: run.id().clone(),
                            other_position: sample.position,
                        });
                    }
                    overlaps += 1;
                }
            }
        }
    }

    let sources: Vec<RunId> = runs.iter().map(|r| r.id().clone()).collect();
    info!(
        "Merged {} runs into {} samples ({} overlapping)",
        sources.len(),
        samples.len(),
        overlaps
    );

    Ok(MergedRun {
        config: first.config().clone(),
        sources,
        samples,
        overlaps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::{AxisRange, LatticeSpec, TraversalOrder};
    use crate::run_store::RunStore;
    use chrono::Utc;
    use tempfile::TempDir;

    fn config() -> ScanConfig {
        ScanConfig::new(
            LatticeSpec::planar(AxisRange::new(0.0, 2.0, 1.0), AxisRange::new(0.0, 2.0, 1.0)),
            TraversalOrder::Raster,
            "3:7".parse().unwrap(),
        )
    }

    fn sample(index: usize) -> Sample {
        Sample {
            index,
            position: Position::xy((index % 3) as f64, (index / 3) as f64),
            achieved: None,
            payload: vec![index as f64],
            timestamp: Utc::now(),
            attempts: 1,
        }
    }

    fn make_run(store: &RunStore, name: &str, config: ScanConfig, samples: &[Sample]) -> Run {
        let id = RunId::new(name).unwrap();
        let mut writer = store.create(id.clone(), config).unwrap();
        for s in samples {
            writer.append(s).unwrap();
        }
        store.open(&id).unwrap()
    }

    #[test]
    fn test_disjoint_runs_union() {
        let tmp = TempDir::new().unwrap();
        let store = RunStore::new(tmp.path());
        let a = make_run(&store, "a", config(), &(0..4).map(sample).collect::<Vec<_>>());
        let b = make_run(&store, "b", config(), &(4..9).map(sample).collect::<Vec<_>>());

        let merged = merge_runs(&[a, b]).unwrap();
        assert_eq!(merged.completion_set(), (0..9).collect());
        assert!(merged.missing().is_empty());
        assert_eq!(merged.overlaps, 0);
        assert_eq!(merged.samples[&6].payload, vec![6.0]);
    }

    #[test]
    fn test_identical_overlap_keeps_first() {
        let tmp = TempDir::new().unwrap();
        let store = RunStore::new(tmp.path());
        let a = make_run(&store, "a", config(), &[sample(0), sample(1)]);
        let mut later = sample(1);
        later.payload = vec![500.0];
        let b = make_run(&store, "b", config(), &[later, sample(2)]);

        let merged = merge_runs(&[a, b]).unwrap();
        assert_eq!(merged.overlaps, 1);
        assert_eq!(merged.samples[&1].payload, vec![1.0]);
        assert_eq!(merged.missing(), (3..9).collect::<Vec<_>>());
    }

    #[test]
    fn test_conflicting_positions_are_surfaced() {
        let tmp = TempDir::new().unwrap();
        let store = RunStore::new(tmp.path());
        let a = make_run(&store, "a", config(), &[sample(4)]);
        let mut shifted = sample(4);
        shifted.position.x += 0.5;
        let b = make_run(&store, "b", config(), &[shifted]);

        let err = merge_runs(&[a, b]).unwrap_err();
        match err {
            MergeError::MergeConflict {
                index,
                first_run,
                other_run,
                ..
            } => {
                assert_eq!(index, 4);
                assert_eq!(first_run.as_str(), "a");
                assert_eq!(other_run.as_str(), "b");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_lattice_mismatch_and_empty() {
        let tmp = TempDir::new().unwrap();
        let store = RunStore::new(tmp.path());
        let mut meander = config();
        meander.order = TraversalOrder::Meander;
        let a = make_run(&store, "a", config(), &[sample(0)]);
        let b = make_run(&store, "b", meander, &[sample(1)]);

        assert!(matches!(
            merge_runs(&[a, b]),
            Err(MergeError::LatticeMismatch { .. })
        ));
        assert_eq!(merge_runs(&[]).unwrap_err(), MergeError::Empty);
    }

    #[test]
    fn test_write_merged_run() {
        let tmp = TempDir::new().unwrap();
        let store = RunStore::new(tmp.path());
        let a = make_run(&store, "a", config(), &[sample(0), sample(2)]);
        let b = make_run(&store, "b", config(), &[sample(1)]);

        let merged = merge_runs(&[a, b]).unwrap();
        let run = store
            .write_merged(RunId::new("ab").unwrap(), &merged)
            .unwrap();

        assert_eq!(run.completion_set(), [0, 1, 2].into_iter().collect());
        let sources: Vec<&str> = run.metadata().merged_from.iter().map(|r| r.as_str()).collect();
        assert_eq!(sources, vec!["a", "b"]);
    }
}
