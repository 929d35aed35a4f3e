// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Dry-run sink

use async_trait::async_trait;
use clen::{MeasurementRecord, SinkError, TelemetrySink};
use tracing::info;

/// Logs every record and accepts every batch
#[derive(Debug, Default)]
pub struct LogSink {
    delivered: u64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches accepted so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

#[async_trait]
impl TelemetrySink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn connect(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn push(&mut self, timestamp: u64, batch: &[MeasurementRecord]) -> Result<(), SinkError> {
        for r in batch {
            info!(
                timestamp,
                node = %r.node,
                tag = %r.tag,
                position = %r.position,
                item = %r.measured_item,
                value = r.value,
                unit = %r.unit,
                "measurement"
            );
        }
        self.delivered += 1;
        Ok(())
    }
}
