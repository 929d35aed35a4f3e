// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Collection and delivery progress
//!
//! [`CollectionProgress`] is the only state shared between the collector and
//! the retriever. [`ProgressFile`] persists how far delivery has got.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

/// Newest timestamp written to the store by the collector.
///
/// Cloning yields another handle to the same value. It never moves backwards.
#[derive(Debug, Clone, Default)]
pub struct CollectionProgress {
    last: Arc<AtomicU64>,
}

impl CollectionProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last collected timestamp, 0 before the first cycle
    pub fn get(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    /// Publish a newly collected timestamp; older values are ignored
    pub fn publish(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::AcqRel);
    }
}

/// Durable retriever progress: one decimal timestamp in a file
#[derive(Debug, Clone)]
pub struct ProgressFile {
    path: PathBuf,
}

impl ProgressFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved timestamp.
    ///
    /// A missing or unreadable file means no prior progress and yields 0.
    pub fn load(&self) -> u64 {
        match fs::read_to_string(&self.path) {
            Ok(text) => match text.trim().parse::<u64>() {
                Ok(ts) => {
                    info!(path = %self.path.display(), timestamp = ts, "Last sent timestamp loaded");
                    ts
                }
                Err(_) => {
                    warn!(path = %self.path.display(), "Corrupt progress file, starting from scratch");
                    0
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "No progress file, first run");
                0
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot read progress file, starting from scratch");
                0
            }
        }
    }

    /// Persist a timestamp, replacing the file atomically
    pub fn save(&self, timestamp: u64) -> io::Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        {
            let mut file = fs::File::create(&tmp)?;
            writeln!(file, "{}", timestamp)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_progress_is_monotonic() {
        let progress = CollectionProgress::new();
        assert_eq!(progress.get(), 0);
        progress.publish(120);
        progress.publish(60);
        assert_eq!(progress.get(), 120);

        let handle = progress.clone();
        handle.publish(180);
        assert_eq!(progress.get(), 180);
    }

    #[test]
    fn test_progress_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = ProgressFile::new(dir.path().join("last_sent_ts.dat"));
        assert_eq!(file.load(), 0);

        file.save(1_700_000_040).unwrap();
        assert_eq!(file.load(), 1_700_000_040);

        file.save(1_700_000_100).unwrap();
        assert_eq!(file.load(), 1_700_000_100);
    }

    #[test]
    fn test_corrupt_progress_file_is_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_sent_ts.dat");
        std::fs::write(&path, "not a number").unwrap();
        assert_eq!(ProgressFile::new(path).load(), 0);
    }
}
