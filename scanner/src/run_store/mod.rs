//! Run persistence.
//!
//! Each run lives in its own directory under the store root:
//!
//! ```text
//! <root>/<run_id>/run.json       metadata (id, config, created, merged_from)
//! <root>/<run_id>/samples.jsonl  one JSON sample per line, append-only
//! ```
//!
//! Samples are fsynced one by one as they are appended, so a crash loses at
//! most the sample being written. A run only ever grows: an index that is
//! already recorded cannot be written again.

mod journal;
pub mod merge;

pub use merge::{merge_runs, MergeError, MergedRun};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use hardware::Position;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ScanConfig;
use crate::errors::ConfigFault;
use journal::JournalWriter;

const METADATA_FILE: &str = "run.json";
const SAMPLES_FILE: &str = "samples.jsonl";

/// Run persistence errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("index {0} is already recorded")]
    DuplicateIndex(usize),

    #[error("index {index} is outside the lattice ({len} points)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid run id '{0}'")]
    InvalidRunId(String),

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("run {0} already exists")]
    RunExists(RunId),

    #[error("run {0} was recorded with a different lattice or traversal order")]
    LatticeMismatch(RunId),

    #[error("run {id} has an invalid config: {source}")]
    InvalidConfig {
        id: RunId,
        #[source]
        source: ConfigFault,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad run metadata {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode sample: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Stable run identifier, usable as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Result<Self, StoreError> {
        let id = id.into();
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if valid {
            Ok(Self(id))
        } else {
            Err(StoreError::InvalidRunId(id))
        }
    }

    /// Timestamped id, e.g. `scan_20240131_142501`.
    pub fn generate() -> Self {
        Self(format!("scan_{}", Utc::now().format("%Y%m%d_%H%M%S")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RunId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RunId> for String {
    fn from(value: RunId) -> Self {
        value.0
    }
}

/// One measured lattice point. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub index: usize,
    /// Commanded lattice position.
    pub position: Position,
    /// Position read back when the stage settled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub achieved: Option<Position>,
    /// Count rate per counter channel.
    pub payload: Vec<f64>,
    pub timestamp: DateTime<Utc>,
    /// Move attempts needed to reach the point (1 = first try).
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub id: RunId,
    pub config: ScanConfig,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<RunId>,
}

/// Read-only snapshot of a run.
#[derive(Debug, Clone)]
pub struct Run {
    metadata: RunMetadata,
    samples: BTreeMap<usize, Sample>,
}

impl Run {
    pub fn id(&self) -> &RunId {
        &self.metadata.id
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn config(&self) -> &ScanConfig {
        &self.metadata.config
    }

    /// Samples in index order.
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.values()
    }

    pub fn sample(&self, index: usize) -> Option<&Sample> {
        self.samples.get(&index)
    }

    pub fn completion_set(&self) -> BTreeSet<usize> {
        self.samples.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn point_count(&self) -> usize {
        self.metadata.config.lattice.point_count()
    }

    /// Lattice indices not recorded yet, ascending.
    pub fn missing(&self) -> Vec<usize> {
        (0..self.point_count())
            .filter(|i| !self.samples.contains_key(i))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.samples.len() == self.point_count()
    }
}

/// Open run accepting new samples.
#[derive(Debug)]
pub struct RunWriter {
    metadata: RunMetadata,
    journal: JournalWriter,
    completed: BTreeSet<usize>,
    point_count: usize,
}

impl RunWriter {
    pub fn id(&self) -> &RunId {
        &self.metadata.id
    }

    /// Indices already recorded.
    pub fn completion_set(&self) -> &BTreeSet<usize> {
        &self.completed
    }

    /// Durably record a sample for an index that has none yet.
    pub fn append(&mut self, sample: &Sample) -> Result<(), StoreError> {
        if sample.index >= self.point_count {
            return Err(StoreError::IndexOutOfRange {
                index: sample.index,
                len: self.point_count,
            });
        }
        if self.completed.contains(&sample.index) {
            return Err(StoreError::DuplicateIndex(sample.index));
        }

        self.journal.append(sample)?;
        self.completed.insert(sample.index);
        debug!("Recorded sample {} in run {}", sample.index, self.metadata.id);
        Ok(())
    }
}

/// Directory of runs.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, id: &RunId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn exists(&self, id: &RunId) -> bool {
        self.run_dir(id).join(METADATA_FILE).is_file()
    }

    /// Ids of all runs under the root, sorted.
    pub fn list_runs(&self) -> Result<Vec<RunId>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut runs = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(id) = RunId::new(name) {
                if self.exists(&id) {
                    runs.push(id);
                }
            }
        }
        runs.sort();
        Ok(runs)
    }

    /// Start a new run. Fails if the id is taken.
    pub fn create(&self, id: RunId, config: ScanConfig) -> Result<RunWriter, StoreError> {
        self.create_with_sources(id, config, Vec::new())
    }

    fn create_with_sources(
        &self,
        id: RunId,
        config: ScanConfig,
        merged_from: Vec<RunId>,
    ) -> Result<RunWriter, StoreError> {
        config.validate().map_err(|source| StoreError::InvalidConfig {
            id: id.clone(),
            source,
        })?;
        if self.exists(&id) {
            return Err(StoreError::RunExists(id));
        }

        let dir = self.run_dir(&id);
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        journal::sync_dir(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;

        let metadata = RunMetadata {
            id,
            config,
            created: Utc::now(),
            merged_from,
        };
        write_metadata(&dir, &metadata)?;
        info!("Created run {} in {}", metadata.id, dir.display());

        self.writer_for(metadata)
    }

    /// Load a run (metadata and every intact sample).
    pub fn open(&self, id: &RunId) -> Result<Run, StoreError> {
        let metadata = self.read_metadata(id)?;
        let path = self.run_dir(id).join(SAMPLES_FILE);
        let samples = if path.exists() {
            journal::read_journal(&path)?.samples
        } else {
            Vec::new()
        };

        Ok(Run {
            metadata,
            samples: index_samples(samples),
        })
    }

    /// Indices recorded in a run.
    pub fn completion_set(&self, id: &RunId) -> Result<BTreeSet<usize>, StoreError> {
        Ok(self.open(id)?.completion_set())
    }

    /// Re-open an existing run for appending.
    pub fn open_for_append(&self, id: &RunId) -> Result<RunWriter, StoreError> {
        let metadata = self.read_metadata(id)?;
        metadata
            .config
            .validate()
            .map_err(|source| StoreError::InvalidConfig {
                id: id.clone(),
                source,
            })?;
        self.writer_for(metadata)
    }

    /// Resume `id` if it exists (same lattice required), otherwise create it.
    pub fn open_or_create(&self, id: RunId, config: ScanConfig) -> Result<RunWriter, StoreError> {
        if !self.exists(&id) {
            return self.create(id, config);
        }

        let metadata = self.read_metadata(&id)?;
        if !metadata.config.same_lattice(&config) {
            return Err(StoreError::LatticeMismatch(id));
        }
        let writer = self.open_for_append(&id)?;
        info!(
            "Resuming run {} with {} of {} points recorded",
            id,
            writer.completed.len(),
            writer.point_count
        );
        Ok(writer)
    }

    /// Persist a merge result as a new run.
    pub fn write_merged(&self, id: RunId, merged: &MergedRun) -> Result<Run, StoreError> {
        let mut writer =
            self.create_with_sources(id.clone(), merged.config.clone(), merged.sources.clone())?;
        for sample in merged.samples.values() {
            writer.append(sample)?;
        }
        info!(
            "Wrote merged run {} ({} samples from {} runs)",
            id,
            merged.samples.len(),
            merged.sources.len()
        );
        self.open(&id)
    }

    fn read_metadata(&self, id: &RunId) -> Result<RunMetadata, StoreError> {
        if !self.exists(id) {
            return Err(StoreError::RunNotFound(id.clone()));
        }
        let path = self.run_dir(id).join(METADATA_FILE);
        let json = fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| StoreError::Metadata { path, source })
    }

    fn writer_for(&self, metadata: RunMetadata) -> Result<RunWriter, StoreError> {
        let path = self.run_dir(&metadata.id).join(SAMPLES_FILE);
        let (journal, samples) = JournalWriter::open(&path)?;
        let point_count = metadata.config.lattice.point_count();
        Ok(RunWriter {
            metadata,
            journal,
            completed: samples.iter().map(|s| s.index).collect(),
            point_count,
        })
    }
}

/// Key samples by index; the first record for an index wins.
fn index_samples(samples: Vec<Sample>) -> BTreeMap<usize, Sample> {
    let mut map = BTreeMap::new();
    for sample in samples {
        map.entry(sample.index).or_insert(sample);
    }
    map
}

/// Write metadata via temp file + rename so a crash never leaves it half written.
fn write_metadata(dir: &Path, metadata: &RunMetadata) -> Result<(), StoreError> {
    let path = dir.join(METADATA_FILE);
    let tmp = dir.join(format!("{METADATA_FILE}.tmp"));
    let json = serde_json::to_string_pretty(metadata).map_err(|source| StoreError::Metadata {
        path: path.clone(),
        source,
    })?;

    let io_err = |source| StoreError::Io {
        path: tmp.clone(),
        source,
    };
    fs::write(&tmp, json).map_err(io_err)?;
    fs::File::open(&tmp)
        .and_then(|f| f.sync_all())
        .map_err(io_err)?;
    fs::rename(&tmp, &path).map_err(|source| StoreError::Io {
        path: path.clone(),
        source,
    })?;
    journal::sync_dir(dir).map_err(|source| StoreError::Io {
        path: dir.to_path_buf(),
        source,
    })
}
