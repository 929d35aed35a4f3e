// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Transport abstraction
//!
//! A [`Transport`] carries commands from the control node to sensor nodes and
//! brings frames back. Implementations:
//!
//! - [`DirectTransport`]: owns the physical serial link
//! - [`RelayedTransport`]: reaches the serial link through a pub/sub relay
//! - [`MemoryTransport`]: scripted in-memory double for tests
//!
//! Only one command may be outstanding per transport: there are no
//! correlation ids, so a reply is matched to the single open exchange.

mod memory;
mod relayed;
pub mod serial;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::protocol::{Frame, MessageType, NodeId};

pub use memory::MemoryTransport;
pub use relayed::RelayedTransport;
pub use serial::{DirectTransport, SerialIo, SerialLink};

/// Which kind of link a transport drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Relayed,
    Memory,
}

impl TransportKind {
    /// How long discovery listens for answers to one broadcast
    pub fn discovery_window(&self, max_nodes: usize) -> Duration {
        let secs = match self {
            Self::Relayed => 2 * (max_nodes as u64 + 3),
            Self::Direct | Self::Memory => max_nodes as u64 + 2,
        };
        Duration::from_secs(secs)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Relayed => "relayed",
            Self::Memory => "memory",
        }
    }
}

/// Statistics about transport usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMetrics {
    /// Commands sent
    pub frames_sent: u64,
    /// Valid frames received
    pub frames_received: u64,
    /// Candidates dropped as undecodable
    pub invalid_frames: u64,
    /// Receives that ended without a frame
    pub timeouts: u64,
}

/// Trait for sensor transports
#[async_trait]
pub trait Transport: Send {
    /// Kind of link behind this transport
    fn kind(&self) -> TransportKind;

    /// Send a command to `dest`.
    ///
    /// `reply_window` is how long replies are expected for; a zero window
    /// means no reply. Fails with [`TransportError::CommandOutstanding`] while
    /// a previous exchange is still open.
    async fn send(
        &mut self,
        dest: &NodeId,
        msg_type: MessageType,
        data: &str,
        reply_window: Duration,
    ) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next valid frame
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError>;

    /// Get transport metrics
    fn metrics(&self) -> TransportMetrics;
}

#[derive(Debug)]
struct Exchange {
    dest: NodeId,
    deadline: Instant,
}

/// Tracks the single open exchange of a transport.
///
/// A unicast exchange closes on the first receive that returns; a broadcast
/// exchange stays open for its whole reply window so every answer can be
/// collected. Any exchange closes once its window has elapsed.
#[derive(Debug, Default)]
pub struct ExchangeGuard {
    open: Option<Exchange>,
}

impl ExchangeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an exchange for a new command
    pub fn begin(&mut self, dest: &NodeId, reply_window: Duration) -> Result<(), TransportError> {
        if let Some(open) = &self.open {
            if Instant::now() < open.deadline {
                return Err(TransportError::CommandOutstanding {
                    dest: open.dest.clone(),
                });
            }
        }
        self.open = (!reply_window.is_zero()).then(|| Exchange {
            dest: dest.clone(),
            deadline: Instant::now() + reply_window,
        });
        Ok(())
    }

    /// Record that a receive returned
    pub fn resolve(&mut self) {
        let close = match &self.open {
            Some(open) => !open.dest.is_broadcast() || Instant::now() >= open.deadline,
            None => false,
        };
        if close {
            self.open = None;
        }
    }

    /// True while a command is waiting for replies
    pub fn is_open(&self) -> bool {
        self.open
            .as_ref()
            .is_some_and(|open| Instant::now() < open.deadline)
    }
}
