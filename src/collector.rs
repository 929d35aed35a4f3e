// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Collection scheduler
//!
//! Each cycle waits for the next wall-clock boundary, queries every
//! discovered node in turn, calibrates the answers and writes one
//! fixed-arity [`MeasurementSet`] per node to the store. The cycle's
//! timestamp is then published as [`CollectionProgress`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::calibration::CalibrationTable;
use crate::config::CollectionConfig;
use crate::measurement::{parse_payload, MeasurementSet};
use crate::progress::CollectionProgress;
use crate::protocol::{Frame, MessageType, NodeId};
use crate::store::MeasurementStore;
use crate::time::{align, sleep_or_cancel, Clock};
use crate::transport::Transport;

/// Minimum pause after a cycle so one boundary never fires twice
const REARM_DELAY: Duration = Duration::from_secs(1);

/// Collector counters
#[derive(Debug, Default)]
pub struct CollectorStats {
    cycles: AtomicU64,
    responses: AtomicU64,
    misses: AtomicU64,
    store_errors: AtomicU64,
}

impl CollectorStats {
    /// Completed collection cycles
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Nodes that answered a query
    pub fn responses(&self) -> u64 {
        self.responses.load(Ordering::Relaxed)
    }

    /// Nodes that did not answer a query
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn store_errors(&self) -> u64 {
        self.store_errors.load(Ordering::Relaxed)
    }
}

/// The collector main loop
pub struct CollectionScheduler {
    calibration: Arc<CalibrationTable>,
    store: Arc<dyn MeasurementStore>,
    clock: Arc<dyn Clock>,
    progress: CollectionProgress,
    config: CollectionConfig,
    nodes: Vec<NodeId>,
    stats: Arc<CollectorStats>,
}

impl CollectionScheduler {
    pub fn new(
        calibration: Arc<CalibrationTable>,
        store: Arc<dyn MeasurementStore>,
        clock: Arc<dyn Clock>,
        progress: CollectionProgress,
        config: CollectionConfig,
        nodes: Vec<NodeId>,
    ) -> Self {
        Self {
            calibration,
            store,
            clock,
            progress,
            config,
            nodes,
            stats: Arc::new(CollectorStats::default()),
        }
    }

    /// Shared handle to the counters
    pub fn stats(&self) -> Arc<CollectorStats> {
        Arc::clone(&self.stats)
    }

    /// Nodes polled each cycle
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Run cycles until cancelled
    pub async fn run(&self, transport: &mut dyn Transport, cancel: &CancellationToken) {
        info!(
            nodes = self.nodes.len(),
            interval_secs = self.config.interval_secs,
            "Collector started"
        );
        while !cancel.is_cancelled() {
            let Some(timestamp) = self.wait_for_boundary(cancel).await else {
                break;
            };
            self.run_cycle(transport, timestamp, cancel).await;
        }
        info!(cycles = self.stats.cycles(), "Collector stopped");
    }

    /// Collect, store and publish one timestamp
    pub async fn run_cycle(&self, transport: &mut dyn Transport, timestamp: u64, cancel: &CancellationToken) {
        let started = Instant::now();
        let sets = self.collect(transport, cancel).await;
        if cancel.is_cancelled() {
            debug!(timestamp, "Cycle interrupted by shutdown, not stored");
            return;
        }
        self.emit(timestamp, &sets);
        self.progress.publish(timestamp);
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        info!(
            timestamp,
            nodes = sets.len(),
            answered = sets.iter().filter(|(_, s)| s.known_count() > 0).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Collection cycle complete"
        );
    }

    /// Wait for the next multiple of the interval.
    ///
    /// The clock is re-read at least every tick, never sleeping past the
    /// target. Returns the aligned timestamp, or `None` if cancelled.
    pub async fn wait_for_boundary(&self, cancel: &CancellationToken) -> Option<u64> {
        if !sleep_or_cancel(cancel, REARM_DELAY).await {
            return None;
        }
        let interval = self.config.interval_secs.max(1);
        let target = align(self.clock.now().saturating_add(interval - 1), interval);
        loop {
            let now = self.clock.now();
            if now >= target {
                return Some(align(now, interval));
            }
            let remaining = Duration::from_secs(target - now);
            if !sleep_or_cancel(cancel, self.config.tick().min(remaining)).await {
                return None;
            }
        }
    }

    /// Query every node and build its measurement set
    pub async fn collect(
        &self,
        transport: &mut dyn Transport,
        cancel: &CancellationToken,
    ) -> Vec<(NodeId, MeasurementSet)> {
        let mut sets = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut set = MeasurementSet::unknown(self.calibration.tags(node));
            if cancel.is_cancelled() {
                sets.push((node.clone(), set));
                continue;
            }
            match self.query(transport, node).await {
                Some(frame) => {
                    self.stats.responses.fetch_add(1, Ordering::Relaxed);
                    self.apply_response(node, &frame.data, &mut set);
                }
                None => {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    warn!(node = %node, "No measurement response");
                }
            }
            sets.push((node.clone(), set));
        }
        sets
    }

    /// Send one query and wait for the node's answer
    async fn query(&self, transport: &mut dyn Transport, node: &NodeId) -> Option<Frame> {
        let settle = self.config.settle_timeout();
        if let Err(e) = transport.send(node, MessageType::QryMsr, "", settle).await {
            error!(node = %node, error = %e, "Cannot send measurement query");
            return None;
        }

        let deadline = Instant::now() + settle;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            match transport.receive(deadline - now).await {
                Ok(Some(frame)) if frame.sender == *node => return Some(frame),
                Ok(Some(frame)) => {
                    warn!(node = %node, sender = %frame.sender, "Response from unexpected node skipped");
                }
                Ok(None) => return None,
                Err(e) => {
                    error!(node = %node, error = %e, "Receive failed");
                    return None;
                }
            }
        }
    }

    /// Calibrate a response payload into `set`
    pub fn apply_response(&self, node: &NodeId, data: &str, set: &mut MeasurementSet) {
        for (tag, raw) in parse_payload(data) {
            let raw_value: i64 = match raw.trim().parse() {
                Ok(v) => v,
                Err(_) => {
                    warn!(node = %node, tag = %tag, raw = %raw, "Raw value is not an integer");
                    continue;
                }
            };
            match self.calibration.calibrate(node, &tag, raw_value) {
                Some(value) => {
                    set.set(&tag, value);
                }
                None => warn!(node = %node, tag = %tag, "No calibration entry, tag dropped"),
            }
        }
    }

    fn emit(&self, timestamp: u64, sets: &[(NodeId, MeasurementSet)]) {
        for (node, set) in sets {
            if let Err(e) = self.store.append(timestamp, node, set) {
                self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                error!(node = %node, timestamp, error = %e, "Cannot store measurements");
            }
        }
    }
}
