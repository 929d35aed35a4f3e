// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Subscriber setup for the daemon

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::{warn, Level};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Map a level name, defaulting to info
pub fn parse_level(name: &str) -> Level {
    match name.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `cli_level`, which wins over the configured level.
pub fn init(config: &LoggingConfig, cli_level: Option<&str>) {
    let level = parse_level(cli_level.unwrap_or(&config.level));
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::from_default_env().add_directive(level.into()));

    let Some(path) = &config.file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return;
    };

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        Err(e) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            warn!(path = %path.display(), error = %e, "Cannot open log file, logging to stdout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }
}
