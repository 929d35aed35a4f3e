// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Broadcast discovery of the sensor network
//!
//! # State Machine
//!
//! ```text
//! Broadcasting -> Listening -> Validating -> Done
//!       ^             |
//!       +-- backoff --+  (nothing heard)
//! ```
//!
//! The discovered set is frozen once validated. Every discovered node must
//! have calibration entries; an unknown node stops the process.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::calibration::CalibrationTable;
use crate::config::CollectionConfig;
use crate::error::DiscoveryError;
use crate::protocol::{MessageType, NodeId};
use crate::time::sleep_or_cancel;
use crate::transport::Transport;

/// Upper bound on a single receive while listening
const LISTEN_STEP: std::time::Duration = std::time::Duration::from_millis(500);

/// Discovery states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Broadcasting,
    Listening,
    Validating,
    Done,
}

/// Check that every discovered node is configured
pub fn validate(discovered: &[NodeId], calibration: &CalibrationTable) -> Result<(), DiscoveryError> {
    let unknown: Vec<NodeId> = discovered
        .iter()
        .filter(|node| !calibration.is_configured(node))
        .cloned()
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(DiscoveryError::UnknownNodes(unknown))
    }
}

/// Runs discovery and node configuration over a transport
#[derive(Debug)]
pub struct DiscoveryEngine {
    calibration: Arc<CalibrationTable>,
    config: CollectionConfig,
    state: DiscoveryState,
    rounds: u32,
}

impl DiscoveryEngine {
    pub fn new(calibration: Arc<CalibrationTable>, config: CollectionConfig) -> Self {
        Self {
            calibration,
            config,
            state: DiscoveryState::Broadcasting,
            rounds: 0,
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Broadcast rounds run so far
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    fn transition(&mut self, next: DiscoveryState) {
        debug!(from = ?self.state, to = ?next, "Discovery state change");
        self.state = next;
    }

    /// Discover, validate and configure the network.
    ///
    /// Returns `Ok(None)` when cancelled before completion.
    pub async fn run(
        &mut self,
        transport: &mut dyn Transport,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<NodeId>>, DiscoveryError> {
        let discovered = loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            self.transition(DiscoveryState::Broadcasting);
            let Some(found) = self.listen_round(transport, cancel).await? else {
                return Ok(None);
            };
            if !found.is_empty() {
                break found;
            }

            warn!(
                round = self.rounds,
                backoff_secs = self.config.discovery_backoff_secs,
                "No sensors discovered, retrying"
            );
            self.transition(DiscoveryState::Broadcasting);
            if !sleep_or_cancel(cancel, self.config.discovery_backoff()).await {
                return Ok(None);
            }
        };

        self.transition(DiscoveryState::Validating);
        validate(&discovered, &self.calibration)?;
        self.transition(DiscoveryState::Done);
        info!(nodes = ?discovered.iter().map(NodeId::as_str).collect::<Vec<_>>(), "Discovery complete");

        self.configure_nodes(transport, &discovered, cancel).await?;
        Ok(Some(discovered))
    }

    /// One broadcast and its listening window
    async fn listen_round(
        &mut self,
        transport: &mut dyn Transport,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<NodeId>>, DiscoveryError> {
        self.rounds += 1;
        let window = transport.kind().discovery_window(self.config.max_nodes);
        info!(round = self.rounds, window_secs = window.as_secs(), "Broadcasting discovery request");

        transport
            .send(&NodeId::broadcast(), MessageType::IdnReq, "", window)
            .await?;
        self.transition(DiscoveryState::Listening);

        let deadline = Instant::now() + window;
        let mut discovered: Vec<NodeId> = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let step = (deadline - now).min(LISTEN_STEP);
            let received = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                received = transport.receive(step) => received?,
            };
            let Some(frame) = received else { continue };

            if frame.sender.is_reserved() {
                debug!(sender = %frame.sender, "Ignoring frame from reserved id");
            } else if discovered.contains(&frame.sender) {
                warn!(node = %frame.sender, "Node answered discovery more than once");
            } else {
                info!(node = %frame.sender, "Sensor discovered");
                discovered.push(frame.sender);
            }
        }
        Ok(Some(discovered))
    }

    /// Send the collection granularity to every node.
    ///
    /// A missing acknowledgement is only logged.
    pub async fn configure_nodes(
        &self,
        transport: &mut dyn Transport,
        nodes: &[NodeId],
        cancel: &CancellationToken,
    ) -> Result<(), DiscoveryError> {
        let payload = self.config.config_payload();
        let ack_timeout = self.config.config_ack_timeout();

        for node in nodes {
            if cancel.is_cancelled() {
                break;
            }
            transport
                .send(node, MessageType::Config, &payload, ack_timeout)
                .await?;
            match transport.receive(ack_timeout).await? {
                Some(frame) if frame.sender == *node && frame.msg_type == MessageType::CfgAck => {
                    info!(node = %node, payload = %payload, "Node configured");
                }
                Some(frame) => {
                    warn!(node = %node, frame = %frame, "Unexpected reply to configuration");
                }
                None => warn!(node = %node, "No configuration acknowledgement"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationEntry;
    use crate::measurement::Tag;
    use crate::protocol::Frame;
    use crate::transport::MemoryTransport;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn calibration(nodes: &[&str]) -> Arc<CalibrationTable> {
        let mut table = CalibrationTable::new();
        for id in nodes {
            let entry = CalibrationEntry {
                position: "lab".into(),
                measured_item: "temperature".into(),
                unit: "C".into(),
                offset: 0.0,
                multiplier: 1.0,
            };
            table.insert(node(id), Tag::new("TE").unwrap(), entry).unwrap();
        }
        Arc::new(table)
    }

    fn answers(ids: &'static [&'static str]) -> impl FnMut(&Frame) -> Vec<Frame> + Send {
        move |cmd| match cmd.msg_type {
            MessageType::IdnReq => ids
                .iter()
                .map(|id| Frame::new(node(id), NodeId::control(), MessageType::Other("IDNRES".into()), ""))
                .collect(),
            MessageType::Config => vec![Frame::new(cmd.dest.clone(), NodeId::control(), MessageType::CfgAck, "")],
            _ => Vec::new(),
        }
    }

    #[test]
    fn test_validate_subset() {
        let table = calibration(&["00A", "00B", "00C"]);
        assert!(validate(&[node("00A"), node("00B")], &table).is_ok());
        match validate(&[node("00A"), node("00D")], &table) {
            Err(DiscoveryError::UnknownNodes(unknown)) => assert_eq!(unknown, vec![node("00D")]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_and_configuration() {
        let mut transport = MemoryTransport::new().with_responder(answers(&["00A", "00B", "00A"]));
        let mut engine = DiscoveryEngine::new(calibration(&["00A", "00B", "00C"]), CollectionConfig::default());
        let cancel = CancellationToken::new();

        let nodes = engine.run(&mut transport, &cancel).await.unwrap().unwrap();
        assert_eq!(nodes, vec![node("00A"), node("00B")]);
        assert_eq!(engine.state(), DiscoveryState::Done);

        let configs = transport.sent_of(&MessageType::Config);
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].data, "TG1");
        assert_eq!(configs[1].dest, node("00B"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_node_is_fatal() {
        let mut transport = MemoryTransport::new().with_responder(answers(&["00A", "00D"]));
        let mut engine = DiscoveryEngine::new(calibration(&["00A", "00B", "00C"]), CollectionConfig::default());
        let err = engine
            .run(&mut transport, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownNodes(_)));
        assert!(transport.sent_of(&MessageType::Config).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_round_backs_off_and_retries() {
        let mut round = 0;
        let mut transport = MemoryTransport::new().with_responder(move |cmd| {
            if cmd.msg_type == MessageType::IdnReq {
                round += 1;
                if round >= 2 {
                    return vec![Frame::new(node("00C"), NodeId::control(), MessageType::Other("IDNRES".into()), "")];
                }
            }
            Vec::new()
        });
        let mut engine = DiscoveryEngine::new(calibration(&["00C"]), CollectionConfig::default());

        let start = Instant::now();
        let nodes = engine
            .run(&mut transport, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(nodes, vec![node("00C")]);
        assert_eq!(engine.rounds(), 2);
        // two 32 s windows plus one 60 s backoff
        assert!(start.elapsed() >= std::time::Duration::from_secs(124));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let mut transport = MemoryTransport::new();
        let mut engine = DiscoveryEngine::new(calibration(&["00A"]), CollectionConfig::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(40)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        assert!(engine.run(&mut transport, &cancel).await.unwrap().is_none());
        assert!(start.elapsed() < std::time::Duration::from_secs(41));
    }
}
