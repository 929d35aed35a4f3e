// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Retriever synchronisation
//!
//! Delivers stored measurements to a [`TelemetrySink`] one interval at a
//! time. Two clocks are involved: the collector's progress `C` (newest
//! stored timestamp) and the retriever's own progress `R` (newest delivered
//! timestamp, persisted). `R` only moves forward, by exactly one interval,
//! on a successful push or on a hole the collector has already passed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::calibration::CalibrationTable;
use crate::config::RetrieverConfig;
use crate::error::SinkError;
use crate::measurement::{MeasurementRecord, Reading};
use crate::progress::{CollectionProgress, ProgressFile};
use crate::sink::TelemetrySink;
use crate::store::MeasurementStore;
use crate::time::sleep_or_cancel;

/// Next timestamp to deliver, `None` when there is nothing to do yet.
///
/// With prior progress the retriever follows one interval at a time behind
/// the collector. Without it, it joins one interval behind the live edge.
pub fn next_timestamp(retrieved: u64, collected: u64, interval: u64) -> Option<u64> {
    if retrieved > 0 {
        (retrieved < collected).then(|| retrieved + interval)
    } else {
        collected.checked_sub(interval).filter(|next| *next > 0)
    }
}

/// Result of one retriever step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Caught up with the collector
    Idle,
    /// Batch accepted by the sink
    Delivered(u64),
    /// No data for a timestamp already behind the collector
    GapSkipped(u64),
    /// No data yet for the next timestamp
    NotYetAvailable(u64),
    /// Sink refused or could not be reached
    PushFailed(u64),
}

/// Retriever counters
#[derive(Debug, Default)]
pub struct RetrieverStats {
    delivered: AtomicU64,
    gap_skips: AtomicU64,
    push_failures: AtomicU64,
    last_sent: AtomicU64,
}

impl RetrieverStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn gap_skips(&self) -> u64 {
        self.gap_skips.load(Ordering::Relaxed)
    }

    pub fn push_failures(&self) -> u64 {
        self.push_failures.load(Ordering::Relaxed)
    }

    /// Newest delivered timestamp
    pub fn last_sent(&self) -> u64 {
        self.last_sent.load(Ordering::Relaxed)
    }
}

/// The retriever main loop
pub struct RetrieverSync<S: TelemetrySink> {
    calibration: Arc<CalibrationTable>,
    store: Arc<dyn MeasurementStore>,
    progress: CollectionProgress,
    progress_file: ProgressFile,
    config: RetrieverConfig,
    interval: u64,
    sink: S,
    last_sent: u64,
    needs_connect: bool,
    stats: Arc<RetrieverStats>,
}

impl<S: TelemetrySink> RetrieverSync<S> {
    /// Create the retriever, loading persisted progress
    pub fn new(
        calibration: Arc<CalibrationTable>,
        store: Arc<dyn MeasurementStore>,
        progress: CollectionProgress,
        config: RetrieverConfig,
        interval_secs: u64,
        sink: S,
    ) -> Self {
        let progress_file = ProgressFile::new(config.progress_file.clone());
        let last_sent = progress_file.load();
        let stats = Arc::new(RetrieverStats::default());
        stats.last_sent.store(last_sent, Ordering::Relaxed);

        Self {
            calibration,
            store,
            progress,
            progress_file,
            config,
            interval: interval_secs,
            sink,
            last_sent,
            needs_connect: true,
            stats,
        }
    }

    /// Newest delivered timestamp
    pub fn last_sent(&self) -> u64 {
        self.last_sent
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Shared handle to the counters
    pub fn stats(&self) -> Arc<RetrieverStats> {
        Arc::clone(&self.stats)
    }

    /// Run steps until cancelled
    pub async fn run(&mut self, cancel: &CancellationToken) {
        info!(sink = self.sink.name(), last_sent = self.last_sent, "Retriever started");
        self.connect_sink().await;

        while !cancel.is_cancelled() {
            let outcome = self.step().await;
            let Some(delay) = self.delay_after(outcome) else {
                tokio::task::yield_now().await;
                continue;
            };
            if !sleep_or_cancel(cancel, delay).await {
                break;
            }
        }
        info!(last_sent = self.last_sent, "Retriever stopped");
    }

    /// Pause before the next step; `None` means go on immediately
    pub fn delay_after(&self, outcome: StepOutcome) -> Option<Duration> {
        match outcome {
            StepOutcome::Idle => Some(Duration::from_secs(self.interval)),
            StepOutcome::Delivered(_) | StepOutcome::GapSkipped(_) => None,
            StepOutcome::NotYetAvailable(_) => Some(self.config.poll_delay()),
            StepOutcome::PushFailed(_) => Some(self.config.retry_delay()),
        }
    }

    /// Try to deliver the next timestamp once
    pub async fn step(&mut self) -> StepOutcome {
        let collected = self.progress.get();
        let Some(next) = next_timestamp(self.last_sent, collected, self.interval) else {
            return StepOutcome::Idle;
        };

        let batch = self.build_batch(next);
        if batch.is_empty() {
            if next < collected {
                warn!(timestamp = next, collected, "No data for past timestamp, skipping");
                self.advance(next);
                self.stats.gap_skips.fetch_add(1, Ordering::Relaxed);
                return StepOutcome::GapSkipped(next);
            }
            debug!(timestamp = next, "Data not yet available");
            return StepOutcome::NotYetAvailable(next);
        }

        if self.needs_connect {
            self.connect_sink().await;
        }
        match self.sink.push(next, &batch).await {
            Ok(()) => {
                info!(timestamp = next, records = batch.len(), sink = self.sink.name(), "Batch delivered");
                self.advance(next);
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                StepOutcome::Delivered(next)
            }
            Err(e) => {
                if matches!(e, SinkError::NotConnected) {
                    self.needs_connect = true;
                }
                warn!(timestamp = next, error = %e, sink = self.sink.name(), "Push failed, will retry");
                self.stats.push_failures.fetch_add(1, Ordering::Relaxed);
                StepOutcome::PushFailed(next)
            }
        }
    }

    /// Calibrated records of every configured node at `timestamp`
    pub fn build_batch(&self, timestamp: u64) -> Vec<MeasurementRecord> {
        let mut batch = Vec::new();
        for node in self.calibration.nodes() {
            if !self.store.last_timestamp(node).is_some_and(|last| last >= timestamp) {
                continue;
            }
            let Some(set) = self.store.fetch(node, timestamp) else {
                continue;
            };
            for (tag, reading) in set.iter() {
                let Reading::Value(value) = reading else {
                    continue;
                };
                let Some(entry) = self.calibration.get(node, tag) else {
                    continue;
                };
                batch.push(MeasurementRecord {
                    node: node.clone(),
                    tag: tag.clone(),
                    position: entry.position.clone(),
                    measured_item: entry.measured_item.clone(),
                    unit: entry.unit.clone(),
                    value: *value,
                });
            }
        }
        batch
    }

    async fn connect_sink(&mut self) {
        match self.sink.connect().await {
            Ok(()) => {
                info!(sink = self.sink.name(), "Sink connected");
                self.needs_connect = false;
            }
            Err(e) => {
                warn!(sink = self.sink.name(), error = %e, "Sink connection failed");
                self.needs_connect = true;
            }
        }
    }

    fn advance(&mut self, timestamp: u64) {
        self.last_sent = timestamp;
        self.stats.last_sent.store(timestamp, Ordering::Relaxed);
        if let Err(e) = self.progress_file.save(timestamp) {
            warn!(path = %self.progress_file.path().display(), error = %e, "Cannot persist retriever progress");
        }
    }
}
