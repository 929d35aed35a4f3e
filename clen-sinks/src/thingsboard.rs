// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! ThingsBoard device telemetry API

use async_trait::async_trait;
use clen::{MeasurementRecord, SinkError, TelemetrySink};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{base_url, check_status, default_timeout_secs, http_client, request_error};

/// ThingsBoard sink settings
#[derive(Debug, Clone, Deserialize)]
pub struct ThingsBoardConfig {
    /// Host name, optionally with scheme and port (https by default)
    pub host: String,
    /// Device access token
    pub access_token: String,
    /// Accept self-signed certificates
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Posts one telemetry object per batch
pub struct ThingsBoardSink {
    client: reqwest::Client,
    url: String,
    connected: bool,
}

impl ThingsBoardSink {
    pub fn new(config: ThingsBoardConfig) -> Result<Self, SinkError> {
        let client = http_client(config.timeout_secs, config.accept_invalid_certs)?;
        Ok(Self {
            client,
            url: telemetry_url(&config),
            connected: false,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn telemetry_url(config: &ThingsBoardConfig) -> String {
    format!(
        "{}/api/v1/{}/telemetry",
        base_url("https", &config.host),
        config.access_token
    )
}

/// Telemetry body: millisecond timestamp plus one key per record
pub(crate) fn telemetry_body(timestamp: u64, batch: &[MeasurementRecord]) -> Value {
    let values: Map<String, Value> = batch
        .iter()
        .map(|r| {
            (
                format!("{}:{}:{}", r.node, r.position, r.measured_item),
                json!(r.value),
            )
        })
        .collect();
    json!({ "ts": timestamp * 1000, "values": values })
}

#[async_trait]
impl TelemetrySink for ThingsBoardSink {
    fn name(&self) -> &str {
        "thingsboard"
    }

    // Device API is stateless; the token is checked on the first push
    async fn connect(&mut self) -> Result<(), SinkError> {
        self.connected = true;
        Ok(())
    }

    async fn push(&mut self, timestamp: u64, batch: &[MeasurementRecord]) -> Result<(), SinkError> {
        if !self.connected {
            return Err(SinkError::NotConnected);
        }
        if batch.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(&self.url)
            .json(&telemetry_body(timestamp, batch))
            .send()
            .await
            .map_err(request_error)?;
        check_status(response).await?;

        debug!(timestamp, records = batch.len(), "telemetry accepted");
        Ok(())
    }
}
