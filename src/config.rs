// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for the control node components
//!
//! Every struct deserializes from a TOML section and falls back to its
//! `Default` for missing fields.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Collection timing and limits
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Seconds between collection boundaries
    pub interval_secs: u64,

    /// Upper bound on the network size, drives the discovery window
    pub max_nodes: usize,

    /// How long to wait for a measurement response
    pub settle_timeout_ms: u64,

    /// How long to wait for a configuration acknowledgement
    pub config_ack_timeout_ms: u64,

    /// Pause between discovery rounds that found nothing
    pub discovery_backoff_secs: u64,

    /// Clock polling period while waiting for a boundary
    pub tick_ms: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_nodes: 30,
            settle_timeout_ms: 600,
            config_ack_timeout_ms: 600,
            discovery_backoff_secs: 60,
            tick_ms: 250,
        }
    }
}

impl CollectionConfig {
    /// Create a configuration with a custom interval
    pub fn with_interval(interval_secs: u64) -> Self {
        Self {
            interval_secs,
            ..Default::default()
        }
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn config_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.config_ack_timeout_ms)
    }

    pub fn discovery_backoff(&self) -> Duration {
        Duration::from_secs(self.discovery_backoff_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Data of the CONFIG command: `TG` + interval in whole minutes, at least one
    pub fn config_payload(&self) -> String {
        format!("TG{}", (self.interval_secs / 60).max(1))
    }
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
        }
    }
}

/// Topics used to reach a relay bridge
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayedConfig {
    /// Topic the bridge listens on
    pub command_topic: String,

    /// Prefix of the per-process reply topic
    pub reply_topic_prefix: String,
}

impl Default for RelayedConfig {
    fn default() -> Self {
        Self {
            command_topic: DEFAULT_COMMAND_TOPIC.to_string(),
            reply_topic_prefix: "clen/reply".to_string(),
        }
    }
}

const DEFAULT_COMMAND_TOPIC: &str = "clen/serial";

/// Which transport the control node uses
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Direct(SerialConfig),
    Relayed(RelayedConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Direct(SerialConfig::default())
    }
}

/// Broker connection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "clen".to_string(),
            keep_alive_secs: 60,
        }
    }
}

/// In-process relay bridge
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    pub port: String,
    pub baud_rate: u32,
    pub command_topic: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let serial = SerialConfig::default();
        Self {
            enabled: false,
            port: serial.port,
            baud_rate: serial.baud_rate,
            command_topic: DEFAULT_COMMAND_TOPIC.to_string(),
        }
    }
}

/// Local time-series store
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// File-backed store directory; memory store when absent
    pub dir: Option<PathBuf>,

    /// Seconds of history kept behind the newest row
    pub retention_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retention_secs: 10_800,
        }
    }
}

/// Delivery pacing and progress file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    pub progress_file: PathBuf,

    /// Wait when the next timestamp is not collected yet
    pub poll_secs: u64,

    /// Wait after a failed push
    pub retry_secs: u64,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            progress_file: PathBuf::from("last_sent_ts.dat"),
            poll_secs: 5,
            retry_secs: 30,
        }
    }
}

impl RetrieverConfig {
    pub fn poll_delay(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_config_default() {
        let config = CollectionConfig::default();
        assert_eq!(config.interval_secs, 60);
        assert_eq!(config.max_nodes, 30);
        assert_eq!(config.settle_timeout(), Duration::from_millis(600));
        assert_eq!(config.config_payload(), "TG1");
    }

    #[test]
    fn test_config_payload_minutes() {
        assert_eq!(CollectionConfig::with_interval(300).config_payload(), "TG5");
        assert_eq!(CollectionConfig::with_interval(90).config_payload(), "TG1");
        assert_eq!(CollectionConfig::with_interval(30).config_payload(), "TG1");
    }

    #[test]
    fn test_transport_default_is_direct() {
        match TransportConfig::default() {
            TransportConfig::Direct(serial) => {
                assert_eq!(serial.port, "/dev/ttyUSB0");
                assert_eq!(serial.baud_rate, 9600);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_store_and_retriever_defaults() {
        assert_eq!(StoreConfig::default().retention_secs, 10_800);
        assert!(StoreConfig::default().dir.is_none());
        let retriever = RetrieverConfig::default();
        assert_eq!(retriever.poll_delay(), Duration::from_secs(5));
        assert_eq!(retriever.retry_delay(), Duration::from_secs(30));
    }
}
