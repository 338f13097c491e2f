//! Append-only sample journal (one JSON object per line).
//!
//! A record only counts once its terminating newline is on disk. Readers stop
//! at the first line that is unterminated or does not parse, so a torn write
//! at the tail never hides the records before it.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::{Sample, StoreError};

/// Flush a directory so entries created or renamed in it survive a crash.
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Result of scanning a journal file.
#[derive(Debug)]
pub(crate) struct JournalScan {
    pub samples: Vec<Sample>,
    /// Byte length of the valid prefix.
    pub valid_len: u64,
    /// Bytes after the valid prefix (torn or corrupt tail).
    pub trailing_bytes: u64,
}

pub(crate) fn read_journal(path: &Path) -> Result<JournalScan, StoreError> {
    let file = File::open(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let total_len = file
        .metadata()
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();

    let mut reader = BufReader::new(file);
    let mut samples = Vec::new();
    let mut valid_len = 0u64;
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        if read == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            warn!(
                "Ignoring unterminated record at byte {valid_len} of {}",
                path.display()
            );
            break;
        }
        match serde_json::from_slice::<Sample>(&line[..line.len() - 1]) {
            Ok(sample) => {
                samples.push(sample);
                valid_len += read as u64;
            }
            Err(e) => {
                warn!(
                    "Stopping at corrupt record at byte {valid_len} of {}: {e}",
                    path.display()
                );
                break;
            }
        }
    }

    Ok(JournalScan {
        samples,
        valid_len,
        trailing_bytes: total_len.saturating_sub(valid_len),
    })
}

/// Durable appender for a journal file.
#[derive(Debug)]
pub(crate) struct JournalWriter {
    path: PathBuf,
    file: File,
}

impl JournalWriter {
    /// Open for appending, cutting off any torn tail first.
    ///
    /// Returns the writer and the samples already in the journal.
    pub fn open(path: &Path) -> Result<(Self, Vec<Sample>), StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        let created = !path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;
        if created {
            if let Some(dir) = path.parent() {
                sync_dir(dir).map_err(|source| StoreError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
        }

        let scan = read_journal(path)?;
        if scan.trailing_bytes > 0 {
            warn!(
                "Truncating {} bytes of damaged tail from {}",
                scan.trailing_bytes,
                path.display()
            );
            file.set_len(scan.valid_len).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        file.seek(SeekFrom::Start(scan.valid_len)).map_err(io_err)?;

        Ok((
            Self {
                path: path.to_path_buf(),
                file,
            },
            scan.samples,
        ))
    }

    /// Write one record and flush it to disk.
    pub fn append(&mut self, sample: &Sample) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(sample).map_err(StoreError::Encode)?;
        line.push(b'\n');

        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        self.file.write_all(&line).map_err(io_err)?;
        self.file.sync_data().map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hardware::Position;
    use tempfile::TempDir;

    fn sample(index: usize) -> Sample {
        Sample {
            index,
            position: Position::xy(index as f64, 0.0),
            achieved: Some(Position::xy(index as f64, 0.0)),
            payload: vec![1000.0 + index as f64],
            timestamp: Utc::now(),
            attempts: 1,
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("samples.jsonl");

        let (mut writer, existing) = JournalWriter::open(&path).unwrap();
        assert!(existing.is_empty());
        for i in 0..3 {
            writer.append(&sample(i)).unwrap();
        }

        let scan = read_journal(&path).unwrap();
        assert_eq!(scan.samples.len(), 3);
        assert_eq!(scan.trailing_bytes, 0);
        assert_eq!(scan.samples[2].payload, vec![1002.0]);
    }

    #[test]
    fn test_torn_tail_is_ignored_then_truncated() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("samples.jsonl");
        {
            let (mut writer, _) = JournalWriter::open(&path).unwrap();
            writer.append(&sample(0)).unwrap();
            writer.append(&sample(1)).unwrap();
        }
        let good_len = std::fs::metadata(&path).unwrap().len();

        // Simulate a crash halfway through the third record
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(br#"{"index":2,"posit"#).unwrap();
        drop(f);

        let scan = read_journal(&path).unwrap();
        assert_eq!(scan.samples.len(), 2);
        assert_eq!(scan.valid_len, good_len);
        assert!(scan.trailing_bytes > 0);

        let (mut writer, existing) = JournalWriter::open(&path).unwrap();
        assert_eq!(existing.len(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        writer.append(&sample(2)).unwrap();
        let scan = read_journal(&path).unwrap();
        let indices: Vec<usize> = scan.samples.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_corrupt_line_stops_reading() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("samples.jsonl");
        {
            let (mut writer, _) = JournalWriter::open(&path).unwrap();
            writer.append(&sample(0)).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"garbage\n").unwrap();
        drop(f);
        {
            // A valid record after the corruption is not trusted
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            let mut line = serde_json::to_vec(&sample(1)).unwrap();
            line.push(b'\n');
            f.write_all(&line).unwrap();
        }

        let scan = read_journal(&path).unwrap();
        assert_eq!(scan.samples.len(), 1);
        assert_eq!(scan.samples[0].index, 0);
    }
}
