// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Publish/subscribe messaging
//!
//! The relayed transport and the relay bridge only need to publish a string
//! on a topic and receive the strings published on another. [`MqttBroker`]
//! does that over MQTT; [`MemoryBroker`] does it in process.

mod mqtt;

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub use mqtt::MqttBroker;

/// Topic-based messaging
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a payload on a topic
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError>;

    /// Receive every payload published on `topic` from now on
    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<String>, TransportError>;
}

/// In-process broker
#[derive(Debug, Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on a topic
    pub fn subscribers(&self, topic: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PubSub for MemoryBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|sub| sub.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<String>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_broker_routes_by_topic() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("clen/serial").await.unwrap();
        let mut b = broker.subscribe("clen/reply/x").await.unwrap();

        broker.publish("clen/serial", "one".into()).await.unwrap();
        broker.publish("clen/reply/x", "two".into()).await.unwrap();
        broker.publish("nobody", "lost".into()).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), "one");
        assert_eq!(b.recv().await.unwrap(), "two");
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let broker = MemoryBroker::new();
        let rx = broker.subscribe("t").await.unwrap();
        assert_eq!(broker.subscribers("t"), 1);
        drop(rx);
        broker.publish("t", "x".into()).await.unwrap();
        assert_eq!(broker.subscribers("t"), 0);
    }
}
