// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! EmonCMS input API

use std::collections::BTreeMap;

use async_trait::async_trait;
use clen::{MeasurementRecord, NodeId, SinkError, TelemetrySink};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{base_url, check_status, default_timeout_secs, http_client, request_error};

#[derive(Debug, Clone, Deserialize)]
pub struct EmonCmsConfig {
    /// Host name, optionally with scheme and port (http by default)
    pub host: String,
    /// Read/write API key
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Posts one input request per node; a batch is accepted only if every
/// node's request answers `ok`
pub struct EmonCmsSink {
    client: reqwest::Client,
    url: String,
    api_key: String,
    connected: bool,
}

impl EmonCmsSink {
    pub fn new(config: EmonCmsConfig) -> Result<Self, SinkError> {
        Ok(Self {
            client: http_client(config.timeout_secs, false)?,
            url: format!("{}/emoncms/input/post.json", base_url("http", &config.host)),
            api_key: config.api_key,
            connected: false,
        })
    }
}

/// Group a batch per node into the `json` object EmonCMS expects
pub(crate) fn node_inputs(batch: &[MeasurementRecord]) -> BTreeMap<NodeId, String> {
    let mut per_node: BTreeMap<NodeId, Map<String, Value>> = BTreeMap::new();
    for r in batch {
        per_node
            .entry(r.node.clone())
            .or_default()
            .insert(r.tag.to_string(), Value::from(r.value));
    }
    per_node
        .into_iter()
        .map(|(node, values)| (node, Value::Object(values).to_string()))
        .collect()
}

/// EmonCMS node ids are integers; "012" is node 12
fn node_param(node: &NodeId) -> String {
    match node.as_str().parse::<u64>() {
        Ok(n) => n.to_string(),
        Err(_) => node.as_str().to_string(),
    }
}

#[async_trait]
impl TelemetrySink for EmonCmsSink {
    fn name(&self) -> &str {
        "emoncms"
    }

    async fn connect(&mut self) -> Result<(), SinkError> {
        self.connected = true;
        Ok(())
    }

    async fn push(&mut self, timestamp: u64, batch: &[MeasurementRecord]) -> Result<(), SinkError> {
        if !self.connected {
            return Err(SinkError::NotConnected);
        }

        for (node, inputs) in node_inputs(batch) {
            let response = self
                .client
                .get(&self.url)
                .query(&[
                    ("apikey", self.api_key.clone()),
                    ("time", timestamp.to_string()),
                    ("node", node_param(&node)),
                    ("json", inputs),
                ])
                .send()
                .await
                .map_err(request_error)?;
            let body = check_status(response)
                .await?
                .text()
                .await
                .map_err(request_error)?;
            if body.trim().trim_matches('"') != "ok" {
                return Err(SinkError::Rejected(format!("node {node}: {}", body.trim())));
            }
            debug!(node = %node, timestamp, "input accepted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clen::Tag;

    fn record(node: &str, tag: &str, value: f64) -> MeasurementRecord {
        MeasurementRecord {
            node: NodeId::new(node).unwrap(),
            tag: Tag::new(tag).unwrap(),
            position: "cellar".to_string(),
            measured_item: "temperature".to_string(),
            unit: "C".to_string(),
            value,
        }
    }

    #[test]
    fn test_node_inputs_grouped() {
        let batch = [
            record("012", "TE", 21.5),
            record("011", "TE", 19.0),
            record("012", "HU", 48.0),
        ];
        let inputs = node_inputs(&batch);
        assert_eq!(inputs.len(), 2);

        let n12: Value = serde_json::from_str(&inputs[&NodeId::new("012").unwrap()]).unwrap();
        assert_eq!(n12["TE"], Value::from(21.5));
        assert_eq!(n12["HU"], Value::from(48.0));
    }

    #[test]
    fn test_node_param() {
        assert_eq!(node_param(&NodeId::new("012").unwrap()), "12");
        assert_eq!(node_param(&NodeId::new("00A").unwrap()), "00A");
    }

    #[test]
    fn test_url() {
        let sink = EmonCmsSink::new(EmonCmsConfig {
            host: "192.168.1.10".to_string(),
            api_key: "k".to_string(),
            timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(sink.url, "http://192.168.1.10/emoncms/input/post.json");
    }

    #[tokio::test]
    async fn test_push_requires_connect() {
        let mut sink = EmonCmsSink::new(EmonCmsConfig {
            host: "127.0.0.1:9".to_string(),
            api_key: "k".to_string(),
            timeout_secs: 1,
        })
        .unwrap();
        let batch = [record("012", "TE", 21.5)];
        assert!(matches!(sink.push(60, &batch).await, Err(SinkError::NotConnected)));

        sink.connect().await.unwrap();
        assert!(matches!(sink.push(60, &batch).await, Err(SinkError::Request(_))));
    }
}
