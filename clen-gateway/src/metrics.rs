// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for the control node.
//!
//! The core keeps its counters in atomics; they are copied into the gauges
//! below on every scrape.

use clen::{CollectorStats, RetrieverStats};
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};

/// Gauges exposed on `/metrics`
pub struct Metrics {
    registry: Registry,

    // Collection
    cycles: IntGauge,
    node_responses: IntGauge,
    node_misses: IntGauge,
    store_errors: IntGauge,
    collected_timestamp: IntGauge,

    // Delivery
    deliveries: IntGauge,
    gap_skips: IntGauge,
    push_failures: IntGauge,
    delivered_timestamp: IntGauge,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            cycles: gauge(&registry, "clen_collection_cycles_total", "Completed collection cycles")?,
            node_responses: gauge(
                &registry,
                "clen_node_responses_total",
                "Measurement responses received",
            )?,
            node_misses: gauge(
                &registry,
                "clen_node_misses_total",
                "Measurement queries left unanswered",
            )?,
            store_errors: gauge(&registry, "clen_store_errors_total", "Rejected store appends")?,
            collected_timestamp: gauge(
                &registry,
                "clen_collected_timestamp_seconds",
                "Newest fully collected timestamp",
            )?,
            deliveries: gauge(&registry, "clen_deliveries_total", "Batches accepted by the sink")?,
            gap_skips: gauge(&registry, "clen_gap_skips_total", "Timestamps skipped with no data")?,
            push_failures: gauge(&registry, "clen_push_failures_total", "Failed sink pushes")?,
            delivered_timestamp: gauge(
                &registry,
                "clen_delivered_timestamp_seconds",
                "Newest delivered timestamp",
            )?,
            registry,
        })
    }

    /// Copy the core counters into the gauges
    pub fn update(&self, collector: &CollectorStats, retriever: &RetrieverStats, collected: u64) {
        self.cycles.set(to_i64(collector.cycles()));
        self.node_responses.set(to_i64(collector.responses()));
        self.node_misses.set(to_i64(collector.misses()));
        self.store_errors.set(to_i64(collector.store_errors()));
        self.collected_timestamp.set(to_i64(collected));

        self.deliveries.set(to_i64(retriever.delivered()));
        self.gap_skips.set(to_i64(retriever.gap_skips()));
        self.push_failures.set(to_i64(retriever.push_failures()));
        self.delivered_timestamp.set(to_i64(retriever.last_sent()));
    }

    /// Prometheus text format
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
