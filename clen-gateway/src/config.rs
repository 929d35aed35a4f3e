// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Daemon configuration
//!
//! Loaded from a TOML file; environment variables prefixed with `CLEN_`
//! override file settings, nested keys separated by `__`
//! (`CLEN_COLLECTION__INTERVAL_SECS=30`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clen::{
    CollectionConfig, MqttConfig, RelayConfig, RetrieverConfig, StoreConfig, TransportConfig,
};
use clen_sinks::SinkConfig;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Figment(Box<figment::Error>),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Log file; stdout when absent or when it cannot be opened
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// `[status]` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Endpoint disabled when absent
    pub bind: Option<SocketAddr>,
}

/// Whole daemon configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub collection: CollectionConfig,
    pub transport: TransportConfig,
    pub mqtt: Option<MqttConfig>,
    pub relay: RelayConfig,
    pub store: StoreConfig,
    pub retriever: RetrieverConfig,
    pub sink: SinkConfig,
    pub logging: LoggingConfig,
    pub status: StatusConfig,
    pub calibration_file: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            collection: CollectionConfig::default(),
            transport: TransportConfig::default(),
            mqtt: None,
            relay: RelayConfig::default(),
            store: StoreConfig::default(),
            retriever: RetrieverConfig::default(),
            sink: SinkConfig::default(),
            logging: LoggingConfig::default(),
            status: StatusConfig::default(),
            calibration_file: PathBuf::from("cfg/clen_transcalibration.cfg"),
        }
    }
}

impl AppConfig {
    /// Load from `path`, with `CLEN_` environment overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CLEN_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new().merge(Toml::string(content)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection.interval_secs < 60 {
            return Err(ConfigError::Invalid(
                "collection.interval_secs must be at least 60, nodes count in minutes".to_string(),
            ));
        }
        if self.collection.tick_ms == 0 {
            return Err(ConfigError::Invalid(
                "collection.tick_ms must be positive".to_string(),
            ));
        }
        if self.collection.max_nodes == 0 {
            return Err(ConfigError::Invalid(
                "collection.max_nodes must be positive".to_string(),
            ));
        }
        if self.needs_broker() && self.mqtt.is_none() {
            return Err(ConfigError::Invalid(
                "[mqtt] is required by the relayed transport and the relay bridge".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a broker connection is needed for the collection side
    pub fn needs_broker(&self) -> bool {
        matches!(self.transport, TransportConfig::Relayed(_)) || self.relay.enabled
    }

    /// Broker settings, required in relay-only mode
    pub fn mqtt(&self) -> Result<&MqttConfig, ConfigError> {
        self.mqtt
            .as_ref()
            .ok_or_else(|| ConfigError::Invalid("missing [mqtt] section".to_string()))
    }

    /// Serial port given on the command line replaces the configured one
    pub fn override_serial_port(&mut self, port: &str) {
        if let TransportConfig::Direct(serial) = &mut self.transport {
            serial.port = port.to_string();
        }
        self.relay.port = port.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.collection.interval_secs, 60);
        assert_eq!(config.transport, TransportConfig::default());
        assert!(config.mqtt.is_none());
        assert!(!config.relay.enabled);
        assert_eq!(config.logging.level, "info");
        assert!(config.status.bind.is_none());
        assert!(matches!(config.sink, SinkConfig::Log));
    }

    #[test]
    fn test_sample_config_parses() {
        let config = AppConfig::from_toml_str(include_str!("../clen.toml")).unwrap();
        assert!(matches!(config.sink, SinkConfig::ThingsBoard(_)));
        assert_eq!(
            config.status.bind,
            Some("127.0.0.1:9100".parse().unwrap())
        );
    }

    #[test]
    fn test_relayed_requires_mqtt() {
        let err = AppConfig::from_toml_str(
            r#"
            [transport]
            kind = "relayed"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let ok = AppConfig::from_toml_str(
            r#"
            [transport]
            kind = "relayed"
            command_topic = "site/serial"

            [mqtt]
            host = "broker.local"
            "#,
        )
        .unwrap();
        assert_eq!(ok.mqtt().unwrap().port, 1883);
        match ok.transport {
            TransportConfig::Relayed(r) => assert_eq!(r.command_topic, "site/serial"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = AppConfig::from_toml_str("[collection]\ninterval_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_sub_minute_interval_rejected() {
        let err = AppConfig::from_toml_str("[collection]\ninterval_secs = 30\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(AppConfig::from_toml_str("[collection]\ninterval_secs = 120\n").is_ok());
    }

    #[test]
    fn test_tick_validation() {
        let err = AppConfig::from_toml_str("[collection]\ntick_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let coarse = AppConfig::from_toml_str("[collection]\ntick_ms = 2000\n").unwrap();
        assert_eq!(coarse.collection.tick_ms, 2000);
    }

    #[test]
    fn test_serial_override() {
        let mut config = AppConfig::default();
        config.override_serial_port("/dev/ttyAMA0");
        match &config.transport {
            TransportConfig::Direct(serial) => assert_eq!(serial.port, "/dev/ttyAMA0"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(config.relay.port, "/dev/ttyAMA0");
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::load_from("/nonexistent/clen.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }
}
