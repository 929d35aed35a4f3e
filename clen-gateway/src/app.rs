// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Task wiring for the daemon

use std::sync::Arc;
use std::time::Instant;

use clen::transport::serial::open_port;
use clen::transport::SerialLink;
use clen::{
    store, CalibrationError, CalibrationTable, CollectionProgress, CollectionScheduler,
    DirectTransport, DiscoveryEngine, DiscoveryError, FileStore, MeasurementStore, MemoryStore,
    MqttBroker, PubSub, RelayBridge, RelayConfig, RelayedTransport, RetrieverSync, SinkError,
    StoreError, SystemClock, Transport, TransportConfig, TransportError,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AppConfig, ConfigError};
use crate::metrics::Metrics;
use crate::status::{self, StatusState};

/// Conditions that stop the daemon with a non-zero exit
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Calibration table: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Store: {0}")]
    Store(#[from] StoreError),

    #[error("Transport: {0}")]
    Transport(#[from] TransportError),

    #[error("Discovery: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Sink: {0}")]
    Sink(#[from] SinkError),

    #[error("Metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Background tasks to await on shutdown
#[derive(Default)]
struct Tasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Tasks {
    fn push(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.handles.push((name, handle));
    }

    async fn join(self) {
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Task panicked");
            }
        }
    }
}

/// Run the control node until `cancel` fires.
///
/// Startup failures (calibration, store, transport, unknown node) are
/// returned; the caller exits non-zero.
pub async fn run(config: AppConfig, cancel: CancellationToken) -> Result<(), GatewayError> {
    config.validate()?;
    let started = Instant::now();

    let calibration = Arc::new(CalibrationTable::load(&config.calibration_file)?);

    let store = open_store(&config, &calibration)?;
    let sink = clen_sinks::build_sink(&config.sink)?;
    let metrics = match config.status.bind {
        Some(_) => Some(Metrics::new()?),
        None => None,
    };
    let mut tasks = Tasks::default();

    let broker = if config.needs_broker() {
        let (broker, handle) = MqttBroker::connect(config.mqtt()?, cancel.clone());
        tasks.push("mqtt", handle);
        Some(Arc::new(broker) as Arc<dyn PubSub>)
    } else {
        None
    };

    if config.relay.enabled {
        if let Some(broker) = &broker {
            match spawn_relay(&config.relay, broker.clone(), cancel.clone()).await {
                Ok(handle) => tasks.push("relay", handle),
                Err(e) => {
                    cancel.cancel();
                    tasks.join().await;
                    return Err(e);
                }
            }
        }
    }

    let mut transport = match open_transport(&config, broker.clone()).await {
        Ok(transport) => transport,
        Err(e) => {
            cancel.cancel();
            tasks.join().await;
            return Err(e);
        }
    };
    let transport_kind = transport.kind();

    let mut discovery = DiscoveryEngine::new(calibration.clone(), config.collection.clone());
    let nodes = match discovery.run(transport.as_mut(), &cancel).await {
        Ok(Some(nodes)) => nodes,
        Ok(None) => {
            info!("Shutdown during discovery");
            tasks.join().await;
            return Ok(());
        }
        Err(e) => {
            cancel.cancel();
            tasks.join().await;
            return Err(e.into());
        }
    };

    let progress = CollectionProgress::new();
    let collector = CollectionScheduler::new(
        calibration.clone(),
        store.clone(),
        Arc::new(SystemClock),
        progress.clone(),
        config.collection.clone(),
        nodes.clone(),
    );
    let collector_stats = collector.stats();

    let mut retriever = RetrieverSync::new(
        calibration,
        store,
        progress.clone(),
        config.retriever.clone(),
        config.collection.interval_secs,
        sink,
    );
    let retriever_stats = retriever.stats();

    if let (Some(bind), Some(metrics)) = (config.status.bind, metrics) {
        let state = Arc::new(StatusState {
            started,
            transport: transport_kind.name(),
            nodes,
            progress,
            collector: collector_stats,
            retriever: retriever_stats,
            metrics,
        });
        let cancel = cancel.clone();
        tasks.push(
            "status",
            tokio::spawn(async move {
                if let Err(e) = status::serve(bind, state, cancel).await {
                    error!(addr = %bind, error = %e, "Status endpoint failed");
                }
            }),
        );
    }

    let collector_cancel = cancel.clone();
    tasks.push(
        "collector",
        tokio::spawn(async move {
            collector.run(transport.as_mut(), &collector_cancel).await;
        }),
    );

    let retriever_cancel = cancel.clone();
    tasks.push(
        "retriever",
        tokio::spawn(async move {
            retriever.run(&retriever_cancel).await;
        }),
    );

    tasks.join().await;
    Ok(())
}

/// Run only the relay bridge, for a host wired to the serial network
pub async fn run_relay_only(config: AppConfig, cancel: CancellationToken) -> Result<(), GatewayError> {
    let mqtt = config.mqtt()?;
    let (broker, mqtt_task) = MqttBroker::connect(mqtt, cancel.clone());

    let port = open_port(&config.relay.port, config.relay.baud_rate)?;
    let bridge = RelayBridge::new(
        Arc::new(broker),
        SerialLink::new(port),
        config.relay.command_topic.clone(),
    );
    let result = bridge.run(cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = mqtt_task.await {
        error!(error = %e, "MQTT task panicked");
    }
    result.map_err(GatewayError::from)
}

fn open_store(
    config: &AppConfig,
    calibration: &CalibrationTable,
) -> Result<Arc<dyn MeasurementStore>, GatewayError> {
    let templates = store::templates(calibration);
    let retention = config.store.retention_secs;
    Ok(match &config.store.dir {
        Some(dir) => Arc::new(FileStore::open(dir, templates, retention)?),
        None => {
            warn!("No store directory configured, measurements are kept in memory only");
            Arc::new(MemoryStore::new(templates, retention))
        }
    })
}

/// Start the in-process bridge; returns once it is subscribed to commands
async fn spawn_relay(
    relay: &RelayConfig,
    broker: Arc<dyn PubSub>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, GatewayError> {
    let port = open_port(&relay.port, relay.baud_rate)?;
    let bridge = RelayBridge::new(broker, SerialLink::new(port), relay.command_topic.clone());
    let serving = bridge.start(cancel.clone()).await?;
    Ok(tokio::spawn(async move {
        match serving.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Relay bridge failed, shutting down");
                cancel.cancel();
            }
            Err(e) => {
                error!(error = %e, "Relay bridge panicked, shutting down");
                cancel.cancel();
            }
        }
    }))
}

async fn open_transport(
    config: &AppConfig,
    broker: Option<Arc<dyn PubSub>>,
) -> Result<Box<dyn Transport>, GatewayError> {
    match &config.transport {
        TransportConfig::Direct(serial) => {
            Ok(Box::new(DirectTransport::open(&serial.port, serial.baud_rate)?))
        }
        TransportConfig::Relayed(relayed) => {
            let broker = broker.ok_or_else(|| ConfigError::Invalid("missing [mqtt] section".to_string()))?;
            let client_id = config.mqtt()?.client_id.clone();
            Ok(Box::new(
                RelayedTransport::open(broker, relayed, &client_id).await?,
            ))
        }
    }
}
