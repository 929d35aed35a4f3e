// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Volatile store

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::{MeasurementStore, NodeSeries};
use crate::error::StoreError;
use crate::measurement::{MeasurementSet, Tag};
use crate::protocol::NodeId;

/// Store kept entirely in memory.
///
/// Nodes without a template get one from their first write.
#[derive(Debug)]
pub struct MemoryStore {
    series: Mutex<HashMap<NodeId, NodeSeries>>,
    retention_secs: u64,
}

impl MemoryStore {
    pub fn new(templates: impl IntoIterator<Item = (NodeId, Vec<Tag>)>, retention_secs: u64) -> Self {
        let series = templates
            .into_iter()
            .map(|(node, tags)| (node, NodeSeries::new(tags)))
            .collect();
        Self {
            series: Mutex::new(series),
            retention_secs,
        }
    }

    /// Number of rows held for a node
    pub fn row_count(&self, node: &NodeId) -> usize {
        self.lock().get(node).map(|s| s.rows().count()).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, NodeSeries>> {
        self.series.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MeasurementStore for MemoryStore {
    fn append(&self, timestamp: u64, node: &NodeId, set: &MeasurementSet) -> Result<(), StoreError> {
        let mut all = self.lock();
        let series = all
            .entry(node.clone())
            .or_insert_with(|| NodeSeries::new(set.tags().cloned().collect()));
        series.check(node, timestamp, set)?;
        series.insert(timestamp, set.clone(), self.retention_secs);
        debug!(node = %node, timestamp, known = set.known_count(), "Stored measurements");
        Ok(())
    }

    fn last_timestamp(&self, node: &NodeId) -> Option<u64> {
        self.lock().get(node).and_then(NodeSeries::last)
    }

    fn fetch(&self, node: &NodeId, timestamp: u64) -> Option<MeasurementSet> {
        self.lock().get(node).and_then(|s| s.get(timestamp).cloned())
    }
}
