// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! File-backed store
//!
//! # File Format
//!
//! One CSV file per node, `n<node>.csv`:
//!
//! ```text
//! timestamp,HU,TE
//! 1700000040,48,21.5
//! 1700000100,U,21.6
//! ```
//!
//! Rows are appended as they are collected. The file is rewritten with only
//! the retained rows once its oldest row is twice the retention old.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use super::{MeasurementStore, NodeSeries};
use crate::error::StoreError;
use crate::measurement::{MeasurementSet, Reading, Tag};
use crate::protocol::NodeId;

const TIMESTAMP_COLUMN: &str = "timestamp";

#[derive(Debug)]
struct FileSeries {
    series: NodeSeries,
    path: PathBuf,
    /// Oldest row still present in the file
    oldest_on_disk: Option<u64>,
}

/// Store persisted as one CSV file per node
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    series: Mutex<HashMap<NodeId, FileSeries>>,
    retention_secs: u64,
}

impl FileStore {
    /// Open the store, replaying existing files of the configured nodes
    pub fn open(
        dir: impl Into<PathBuf>,
        templates: impl IntoIterator<Item = (NodeId, Vec<Tag>)>,
        retention_secs: u64,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut series = HashMap::new();
        for (node, tags) in templates {
            let loaded = load_series(&dir, &node, NodeSeries::new(tags), retention_secs)?;
            series.insert(node, loaded);
        }
        info!(dir = %dir.display(), nodes = series.len(), "File store opened");

        Ok(Self {
            dir,
            series: Mutex::new(series),
            retention_secs,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, FileSeries>> {
        self.series.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn node_path(dir: &Path, node: &NodeId) -> PathBuf {
    dir.join(format!("n{}.csv", node))
}

fn corrupt(path: &Path, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn load_series(dir: &Path, node: &NodeId, mut series: NodeSeries, retention_secs: u64) -> Result<FileSeries, StoreError> {
    let path = node_path(dir, node);
    if !path.exists() {
        return Ok(FileSeries {
            series,
            path,
            oldest_on_disk: None,
        });
    }

    let mut reader = csv::Reader::from_path(&path).map_err(|e| corrupt(&path, e.to_string()))?;
    let headers = reader.headers().map_err(|e| corrupt(&path, e.to_string()))?.clone();
    let columns: Vec<&str> = headers.iter().skip(1).collect();
    let expected: Vec<&str> = series.template().iter().map(Tag::as_str).collect();
    if headers.get(0) != Some(TIMESTAMP_COLUMN) || columns != expected {
        return Err(corrupt(
            &path,
            format!("header {:?} does not match template {:?}", columns, expected),
        ));
    }
    let template = series.template().to_vec();

    let mut oldest_on_disk = None;
    let mut replayed = 0usize;
    for record in reader.records() {
        let record = record.map_err(|e| corrupt(&path, e.to_string()))?;
        let timestamp: u64 = record
            .get(0)
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| corrupt(&path, format!("bad timestamp in {:?}", record)))?;
        let mut readings = Vec::with_capacity(template.len());
        for (tag, text) in template.iter().zip(record.iter().skip(1)) {
            let reading = Reading::parse(text).ok_or_else(|| corrupt(&path, format!("bad value {:?}", text)))?;
            readings.push((tag.clone(), reading));
        }
        let set = MeasurementSet::from_readings(readings);

        if let Err(e) = series.check(node, timestamp, &set) {
            warn!(path = %path.display(), error = %e, "Skipping unreplayable row");
            continue;
        }
        oldest_on_disk.get_or_insert(timestamp);
        series.insert(timestamp, set, retention_secs);
        replayed += 1;
    }
    debug!(node = %node, rows = replayed, "Store file replayed");

    Ok(FileSeries {
        series,
        path,
        oldest_on_disk,
    })
}

fn write_row(writer: &mut csv::Writer<File>, timestamp: u64, set: &MeasurementSet) -> csv::Result<()> {
    let mut row = Vec::with_capacity(set.len() + 1);
    row.push(timestamp.to_string());
    row.extend(set.iter().map(|(_, reading)| reading.to_string()));
    writer.write_record(&row)
}

fn header(template: &[Tag]) -> Vec<&str> {
    std::iter::once(TIMESTAMP_COLUMN)
        .chain(template.iter().map(Tag::as_str))
        .collect()
}

fn csv_error(e: csv::Error) -> StoreError {
    StoreError::Io(e.into())
}

impl FileSeries {
    fn append_row(&mut self, timestamp: u64, set: &MeasurementSet) -> Result<(), StoreError> {
        let fresh = !self.path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if fresh {
            writer.write_record(header(self.series.template())).map_err(csv_error)?;
        }
        write_row(&mut writer, timestamp, set).map_err(csv_error)?;
        writer.flush()?;
        self.oldest_on_disk.get_or_insert(timestamp);
        Ok(())
    }

    /// Rewrite the file with only the rows still in memory
    fn compact(&mut self) -> Result<(), StoreError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_path(&tmp)
                .map_err(csv_error)?;
            writer.write_record(header(self.series.template())).map_err(csv_error)?;
            for (timestamp, set) in self.series.rows() {
                write_row(&mut writer, *timestamp, set).map_err(csv_error)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.oldest_on_disk = self.series.oldest();
        debug!(path = %self.path.display(), "Store file compacted");
        Ok(())
    }
}

impl MeasurementStore for FileStore {
    fn append(&self, timestamp: u64, node: &NodeId, set: &MeasurementSet) -> Result<(), StoreError> {
        let mut all = self.lock();
        let entry = match all.entry(node.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                let template = set.tags().cloned().collect();
                slot.insert(load_series(&self.dir, node, NodeSeries::new(template), self.retention_secs)?)
            }
        };

        entry.series.check(node, timestamp, set)?;
        entry.append_row(timestamp, set)?;
        entry.series.insert(timestamp, set.clone(), self.retention_secs);

        let horizon = timestamp.saturating_sub(2 * self.retention_secs);
        if entry.oldest_on_disk.is_some_and(|oldest| oldest < horizon) {
            entry.compact()?;
        }
        Ok(())
    }

    fn last_timestamp(&self, node: &NodeId) -> Option<u64> {
        self.lock().get(node).and_then(|e| e.series.last())
    }

    fn fetch(&self, node: &NodeId, timestamp: u64) -> Option<MeasurementSet> {
        self.lock()
            .get(node)
            .and_then(|e| e.series.get(timestamp).cloned())
    }
}
