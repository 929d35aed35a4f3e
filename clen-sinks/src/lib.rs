// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # clen-sinks
//!
//! Vendor implementations of [`clen::TelemetrySink`]. One sink is selected
//! at startup from the `[sink]` configuration section:
//!
//! ```toml
//! [sink]
//! kind = "thingsboard"
//! host = "demo.thingsboard.io"
//! access_token = "A1_TEST_TOKEN"
//! ```
//!
//! Every sink receives calibrated records; none of them recalibrates.

mod dreamfactory;
mod emoncms;
mod log;
mod thingsboard;

use std::time::Duration;

use clen::{SinkError, TelemetrySink};
use serde::Deserialize;

pub use dreamfactory::{DreamFactoryConfig, DreamFactorySink};
pub use emoncms::{EmonCmsConfig, EmonCmsSink};
pub use log::LogSink;
pub use thingsboard::{ThingsBoardConfig, ThingsBoardSink};

/// Default HTTP timeout for every vendor sink
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Sink selection
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    ThingsBoard(ThingsBoardConfig),
    EmonCms(EmonCmsConfig),
    DreamFactory(DreamFactoryConfig),
    Log,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Log
    }
}

impl SinkConfig {
    pub fn name(&self) -> &'static str {
        match self {
            SinkConfig::ThingsBoard(_) => "thingsboard",
            SinkConfig::EmonCms(_) => "emoncms",
            SinkConfig::DreamFactory(_) => "dreamfactory",
            SinkConfig::Log => "log",
        }
    }
}

/// Build the configured sink
pub fn build_sink(config: &SinkConfig) -> Result<Box<dyn TelemetrySink>, SinkError> {
    Ok(match config {
        SinkConfig::ThingsBoard(c) => Box::new(ThingsBoardSink::new(c.clone())?),
        SinkConfig::EmonCms(c) => Box::new(EmonCmsSink::new(c.clone())?),
        SinkConfig::DreamFactory(c) => Box::new(DreamFactorySink::new(c.clone())?),
        SinkConfig::Log => Box::new(LogSink::new()),
    })
}

pub(crate) fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

pub(crate) fn http_client(timeout_secs: u64, accept_invalid_certs: bool) -> Result<reqwest::Client, SinkError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .map_err(request_error)
}

/// `host` may carry its own scheme; otherwise `default_scheme` is used
pub(crate) fn base_url(default_scheme: &str, host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("{default_scheme}://{host}")
    }
}

pub(crate) fn request_error(e: reqwest::Error) -> SinkError {
    SinkError::Request(e.to_string())
}

/// Map a non-success HTTP status to a rejection
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SinkError::Rejected(format!("HTTP {status}: {}", body.trim())))
}

/// Numeric form of a node id where the vendor wants an integer
pub(crate) fn node_number(node: &clen::NodeId) -> serde_json::Value {
    match node.as_str().parse::<u64>() {
        Ok(n) => serde_json::Value::from(n),
        Err(_) => serde_json::Value::from(node.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_config_kinds() {
        let config: SinkConfig = toml::from_str(
            r#"
            kind = "emoncms"
            host = "192.168.1.10"
            api_key = "abc"
            "#,
        )
        .unwrap();
        match &config {
            SinkConfig::EmonCms(c) => {
                assert_eq!(c.host, "192.168.1.10");
                assert_eq!(c.timeout_secs, DEFAULT_TIMEOUT_SECS);
            }
            other => panic!("unexpected {other:?}"),
        }

        let log: SinkConfig = toml::from_str(r#"kind = "log""#).unwrap();
        assert!(matches!(log, SinkConfig::Log));
        assert_eq!(SinkConfig::default().name(), "log");
    }

    #[test]
    fn test_build_sink() {
        let sink = build_sink(&SinkConfig::Log).unwrap();
        assert_eq!(sink.name(), "log");
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("https", "tb.local"), "https://tb.local");
        assert_eq!(base_url("https", "http://tb.local:8080/"), "http://tb.local:8080");
    }

    #[test]
    fn test_node_number() {
        assert_eq!(node_number(&clen::NodeId::new("012").unwrap()), serde_json::json!(12));
        assert_eq!(node_number(&clen::NodeId::new("00A").unwrap()), serde_json::json!("00A"));
    }
}
