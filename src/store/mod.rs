// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Local time-series store
//!
//! The collector appends one [`MeasurementSet`] per node per boundary; the
//! retriever reads them back by timestamp. Each node has a fixed template
//! (its tag set) and strictly increasing timestamps.

mod file;
mod memory;

use std::collections::BTreeMap;

use crate::calibration::CalibrationTable;
use crate::error::StoreError;
use crate::measurement::{MeasurementSet, Tag};
use crate::protocol::NodeId;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Storage used between collection and delivery
pub trait MeasurementStore: Send + Sync {
    /// Append the readings of `node` at `timestamp`
    fn append(&self, timestamp: u64, node: &NodeId, set: &MeasurementSet) -> Result<(), StoreError>;

    /// Newest stored timestamp of `node`
    fn last_timestamp(&self, node: &NodeId) -> Option<u64>;

    /// Readings of `node` at exactly `timestamp`
    fn fetch(&self, node: &NodeId, timestamp: u64) -> Option<MeasurementSet>;
}

/// Templates for every configured node
pub fn templates(calibration: &CalibrationTable) -> Vec<(NodeId, Vec<Tag>)> {
    calibration
        .nodes()
        .iter()
        .map(|node| (node.clone(), calibration.tags(node).to_vec()))
        .collect()
}

/// Rows of one node, bounded by retention
#[derive(Debug, Clone)]
pub(crate) struct NodeSeries {
    template: Vec<Tag>,
    rows: BTreeMap<u64, MeasurementSet>,
}

impl NodeSeries {
    pub(crate) fn new(mut template: Vec<Tag>) -> Self {
        template.sort();
        template.dedup();
        Self {
            template,
            rows: BTreeMap::new(),
        }
    }

    pub(crate) fn template(&self) -> &[Tag] {
        &self.template
    }

    pub(crate) fn last(&self) -> Option<u64> {
        self.rows.keys().next_back().copied()
    }

    pub(crate) fn oldest(&self) -> Option<u64> {
        self.rows.keys().next().copied()
    }

    pub(crate) fn get(&self, timestamp: u64) -> Option<&MeasurementSet> {
        self.rows.get(&timestamp)
    }

    pub(crate) fn rows(&self) -> impl Iterator<Item = (&u64, &MeasurementSet)> {
        self.rows.iter()
    }

    /// Refuse writes that break the template or ordering
    pub(crate) fn check(&self, node: &NodeId, timestamp: u64, set: &MeasurementSet) -> Result<(), StoreError> {
        if !set.tags().eq(self.template.iter()) {
            return Err(StoreError::TemplateMismatch {
                node: node.clone(),
                expected: self.template.iter().map(Tag::to_string).collect(),
                actual: set.tags().map(Tag::to_string).collect(),
            });
        }
        if let Some(last) = self.last() {
            if timestamp <= last {
                return Err(StoreError::StaleTimestamp {
                    node: node.clone(),
                    timestamp,
                    last,
                });
            }
        }
        Ok(())
    }

    /// Insert an already checked row and evict what falls out of retention
    pub(crate) fn insert(&mut self, timestamp: u64, set: MeasurementSet, retention_secs: u64) {
        self.rows.insert(timestamp, set);
        let horizon = timestamp.saturating_sub(retention_secs);
        self.rows = self.rows.split_off(&horizon);
    }
}
