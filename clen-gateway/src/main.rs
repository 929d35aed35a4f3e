// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # clen-gateway
//!
//! ## Usage
//!
//! ```bash
//! # Control node with the configured serial port
//! clen-gateway --config /etc/clen/clen.toml
//!
//! # Override the serial port
//! clen-gateway --serial /dev/ttyAMA0
//!
//! # Relay bridge only, on the host wired to the sensor network
//! clen-gateway --relay-only
//! ```

use std::path::PathBuf;

use clap::Parser;
use clen_gateway::{logging, run, run_relay_only, AppConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// CLEN sensor network control node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "clen.toml")]
    config: PathBuf,

    /// Serial port, overrides the configured one
    #[arg(short, long)]
    serial: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Run only the relay bridge
    #[arg(long)]
    relay_only: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = AppConfig::load_from(&args.config)?;
    if let Some(port) = &args.serial {
        config.override_serial_port(port);
    }
    logging::init(&config.logging, args.log_level.as_deref());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        relay_only = args.relay_only,
        "CLEN gateway starting"
    );

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        cancel_on_signal.cancel();
    });

    let result = if args.relay_only {
        run_relay_only(config, cancel).await
    } else {
        run(config, cancel).await
    };
    if let Err(e) = result {
        error!(error = %e, "Gateway stopped");
        return Err(e.into());
    }

    info!("Gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
