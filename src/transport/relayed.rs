// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Transport that reaches the serial link through a relay bridge

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ExchangeGuard, Transport, TransportKind, TransportMetrics};
use crate::config::RelayedConfig;
use crate::error::TransportError;
use crate::protocol::{decode, encode, Frame, MessageType, NodeId};
use crate::pubsub::PubSub;
use crate::relay::{Envelope, Purpose};

/// Relayed transport.
///
/// Commands are published as envelopes on the bridge's command topic; replies
/// come back on a reply topic private to this process.
pub struct RelayedTransport {
    broker: Arc<dyn PubSub>,
    command_topic: String,
    reply_topic: String,
    replies: mpsc::UnboundedReceiver<String>,
    guard: ExchangeGuard,
    metrics: TransportMetrics,
}

impl RelayedTransport {
    /// Subscribe to a fresh reply topic
    pub async fn open(
        broker: Arc<dyn PubSub>,
        config: &RelayedConfig,
        client_id: &str,
    ) -> Result<Self, TransportError> {
        let reply_topic = format!(
            "{}/{}-{}-{:08x}",
            config.reply_topic_prefix,
            client_id,
            std::process::id(),
            rand::random::<u32>()
        );
        let replies = broker.subscribe(&reply_topic).await?;
        info!(command_topic = %config.command_topic, reply_topic = %reply_topic, "Relayed transport ready");

        Ok(Self {
            broker,
            command_topic: config.command_topic.clone(),
            reply_topic,
            replies,
            guard: ExchangeGuard::new(),
            metrics: TransportMetrics::default(),
        })
    }

    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    fn discard_stale(&mut self) {
        let mut dropped = 0;
        while self.replies.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Discarded stale relay replies");
        }
    }

    async fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let message = match tokio::time::timeout_at(deadline, self.replies.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(TransportError::Closed),
                Ok(Some(message)) => message,
            };

            let envelope = match message.parse::<Envelope>() {
                Ok(envelope) if envelope.purpose == Purpose::Response => envelope,
                Ok(_) => {
                    debug!("Non-response message on reply topic ignored");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Malformed relay reply ignored");
                    continue;
                }
            };
            match decode(&envelope.payload) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => {
                    warn!(error = %e, payload = %envelope.payload, "Invalid frame in relay reply");
                    self.metrics.invalid_frames += 1;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for RelayedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relayed
    }

    async fn send(
        &mut self,
        dest: &NodeId,
        msg_type: MessageType,
        data: &str,
        reply_window: Duration,
    ) -> Result<(), TransportError> {
        self.guard.begin(dest, reply_window)?;
        self.discard_stale();

        let wire = encode(&NodeId::control(), dest, &msg_type, data);
        let envelope = Envelope::command(self.reply_topic.clone(), reply_window, wire);
        self.broker.publish(&self.command_topic, envelope.to_string()).await?;
        self.metrics.frames_sent += 1;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        let received = self.next_frame(timeout).await;
        self.guard.resolve();
        match &received {
            Ok(Some(_)) => self.metrics.frames_received += 1,
            Ok(None) => self.metrics.timeouts += 1,
            Err(_) => {}
        }
        received
    }

    fn metrics(&self) -> TransportMetrics {
        self.metrics.clone()
    }
}
