// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # CLEN Gateway
//!
//! Daemon around the `clen` core: loads the configuration, opens the
//! transport, discovers the network and runs collection and delivery until
//! SIGINT/SIGTERM. Optionally serves `/health`, `/status` and `/metrics`.

pub mod app;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod status;

pub use app::{run, run_relay_only, GatewayError};
pub use config::{AppConfig, ConfigError};
