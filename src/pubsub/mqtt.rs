// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! MQTT broker client

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::PubSub;
use crate::config::MqttConfig;
use crate::error::TransportError;
use crate::time::sleep_or_cancel;

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>;

const REQUEST_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// MQTT client with one queue per subscribed topic
#[derive(Clone)]
pub struct MqttBroker {
    client: AsyncClient,
    routes: Routes,
}

impl MqttBroker {
    /// Start the client and its event loop task.
    ///
    /// The task keeps reconnecting until `cancel` fires.
    pub fn connect(config: &MqttConfig, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let routes = Routes::default();
        info!(host = %config.host, port = config.port, client_id = %config.client_id, "Connecting to MQTT broker");

        let task = tokio::spawn(run_event_loop(eventloop, client.clone(), routes.clone(), cancel));
        (Self { client, routes }, task)
    }
}

fn lock(routes: &Routes) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<String>>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_event_loop(mut eventloop: EventLoop, client: AsyncClient, routes: Routes, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let topics: Vec<String> = lock(&routes).keys().cloned().collect();
                info!(subscriptions = topics.len(), "MQTT connected");
                for topic in topics {
                    if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtMostOnce) {
                        warn!(topic = %topic, error = %e, "MQTT resubscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                match lock(&routes).get(&publish.topic) {
                    Some(tx) => {
                        if tx.send(payload).is_err() {
                            debug!(topic = %publish.topic, "Subscriber gone, message dropped");
                        }
                    }
                    None => debug!(topic = %publish.topic, "Message on unrouted topic"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT connection error, retrying");
                if !sleep_or_cancel(&cancel, RECONNECT_DELAY).await {
                    break;
                }
            }
        }
    }

    if let Err(e) = client.try_disconnect() {
        debug!(error = %e, "MQTT disconnect request not queued");
    }
    info!("MQTT event loop stopped");
}

#[async_trait]
impl PubSub for MqttBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.into_bytes())
            .await
            .map_err(|e| TransportError::Broker(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<String>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.routes).insert(topic.to_string(), tx);
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| TransportError::Broker(e.to_string()))?;
        debug!(topic, "MQTT subscribed");
        Ok(rx)
    }
}
