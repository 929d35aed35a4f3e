// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! In-memory transport for tests and local simulation

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;

use super::{ExchangeGuard, Transport, TransportKind, TransportMetrics};
use crate::error::TransportError;
use crate::protocol::{decode, Frame, MessageType, NodeId};

type Responder = Box<dyn FnMut(&Frame) -> Vec<Frame> + Send>;

/// A scripted transport.
///
/// Every command is recorded; an optional responder turns each command into
/// the frames the simulated network answers with.
pub struct MemoryTransport {
    kind: TransportKind,
    /// Commands sent, in order
    sent: Vec<Frame>,
    /// Incoming wire strings waiting to be received
    rx_buffer: VecDeque<String>,
    responder: Option<Responder>,
    guard: ExchangeGuard,
    metrics: TransportMetrics,
}

impl MemoryTransport {
    /// Create a transport with no responder
    pub fn new() -> Self {
        Self {
            kind: TransportKind::Memory,
            sent: Vec::new(),
            rx_buffer: VecDeque::new(),
            responder: None,
            guard: ExchangeGuard::new(),
            metrics: TransportMetrics::default(),
        }
    }

    /// Answer every command with the frames returned by `responder`
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&Frame) -> Vec<Frame> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Report a different link kind, e.g. to get relayed timings
    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    /// Push a frame to the receive buffer (simulate receiving)
    pub fn push_incoming(&mut self, frame: &Frame) {
        self.rx_buffer.push_back(frame.to_wire());
    }

    /// Push raw wire text, valid or not
    pub fn push_incoming_wire(&mut self, wire: impl Into<String>) {
        self.rx_buffer.push_back(wire.into());
    }

    /// Commands sent so far
    pub fn sent(&self) -> &[Frame] {
        &self.sent
    }

    /// Commands of one type sent so far
    pub fn sent_of(&self, msg_type: &MessageType) -> Vec<&Frame> {
        self.sent.iter().filter(|f| &f.msg_type == msg_type).collect()
    }

    /// Get number of pending incoming frames
    pub fn pending_incoming(&self) -> usize {
        self.rx_buffer.len()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("kind", &self.kind)
            .field("sent", &self.sent.len())
            .field("pending", &self.rx_buffer.len())
            .field("metrics", &self.metrics)
            .finish()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send(
        &mut self,
        dest: &NodeId,
        msg_type: MessageType,
        data: &str,
        reply_window: Duration,
    ) -> Result<(), TransportError> {
        self.guard.begin(dest, reply_window)?;
        // Replies to earlier commands are stale now
        self.rx_buffer.clear();

        let command = Frame::new(NodeId::control(), dest.clone(), msg_type, data);
        if let Some(responder) = self.responder.as_mut() {
            let replies = responder(&command);
            self.rx_buffer.extend(replies.iter().map(Frame::to_wire));
        }
        self.sent.push(command);
        self.metrics.frames_sent += 1;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        let mut received = None;
        while let Some(wire) = self.rx_buffer.pop_front() {
            match decode(&wire) {
                Ok(frame) => {
                    received = Some(frame);
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, wire = %wire, "Dropping invalid frame");
                    self.metrics.invalid_frames += 1;
                }
            }
        }

        match received {
            Some(_) => self.metrics.frames_received += 1,
            None => {
                tokio::time::sleep(timeout).await;
                self.metrics.timeouts += 1;
            }
        }
        self.guard.resolve();
        Ok(received)
    }

    fn metrics(&self) -> TransportMetrics {
        self.metrics.clone()
    }
}
