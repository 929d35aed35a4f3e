// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Telemetry sink interface
//!
//! A sink receives one batch of calibrated records per timestamp. Vendor
//! implementations live in the `clen-sinks` crate.

use async_trait::async_trait;

use crate::error::SinkError;
use crate::measurement::MeasurementRecord;

/// Destination for delivered measurements
#[async_trait]
pub trait TelemetrySink: Send {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Prepare the remote side (session, credentials check)
    async fn connect(&mut self) -> Result<(), SinkError>;

    /// Deliver every record collected at `timestamp`.
    ///
    /// An `Ok` means the whole batch was accepted.
    async fn push(&mut self, timestamp: u64, batch: &[MeasurementRecord]) -> Result<(), SinkError>;
}

#[async_trait]
impl<T: TelemetrySink + ?Sized> TelemetrySink for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn connect(&mut self) -> Result<(), SinkError> {
        (**self).connect().await
    }

    async fn push(&mut self, timestamp: u64, batch: &[MeasurementRecord]) -> Result<(), SinkError> {
        (**self).push(timestamp, batch).await
    }
}

/// Sink that keeps every accepted batch, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemorySink {
    connected: bool,
    batches: Vec<(u64, Vec<MeasurementRecord>)>,
    /// Number of upcoming pushes to reject
    fail_next: usize,
    connect_failures: usize,
    connects: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` pushes
    pub fn fail_next(&mut self, n: usize) {
        self.fail_next = n;
    }

    /// Make the next `n` connects fail
    pub fn fail_connects(&mut self, n: usize) {
        self.connect_failures = n;
    }

    pub fn batches(&self) -> &[(u64, Vec<MeasurementRecord>)] {
        &self.batches
    }

    /// Timestamps delivered, in order
    pub fn timestamps(&self) -> Vec<u64> {
        self.batches.iter().map(|(t, _)| *t).collect()
    }

    /// Successful and failed connect attempts
    pub fn connects(&self) -> usize {
        self.connects
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&mut self) -> Result<(), SinkError> {
        self.connects += 1;
        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            self.connected = false;
            return Err(SinkError::Request("connection refused".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn push(&mut self, timestamp: u64, batch: &[MeasurementRecord]) -> Result<(), SinkError> {
        if !self.connected {
            return Err(SinkError::NotConnected);
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(SinkError::Rejected("simulated failure".to_string()));
        }
        self.batches.push((timestamp, batch.to_vec()));
        Ok(())
    }
}
