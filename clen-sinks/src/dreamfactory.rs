// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! DreamFactory REST table API
//!
//! `connect` opens a user session; each batch is inserted as one
//! `resource` array into the configured table.

use async_trait::async_trait;
use clen::{MeasurementRecord, SinkError, TelemetrySink};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{base_url, check_status, default_timeout_secs, http_client, node_number, request_error};

const API_KEY_HEADER: &str = "X-DreamFactory-Api-Key";
const SESSION_HEADER: &str = "X-DreamFactory-Session-Token";

#[derive(Debug, Clone, Deserialize)]
pub struct DreamFactoryConfig {
    /// Host name, optionally with scheme and port (http by default)
    pub host: String,
    pub email: String,
    pub password: String,
    pub api_key: String,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_service() -> String {
    "thcsensors".to_string()
}

fn default_table() -> String {
    "thc_misure".to_string()
}

#[derive(Debug, Deserialize)]
struct Session {
    session_id: String,
}

pub struct DreamFactorySink {
    client: reqwest::Client,
    base: String,
    config: DreamFactoryConfig,
    session: Option<String>,
}

impl DreamFactorySink {
    pub fn new(config: DreamFactoryConfig) -> Result<Self, SinkError> {
        Ok(Self {
            client: http_client(config.timeout_secs, false)?,
            base: base_url("http", &config.host),
            config,
            session: None,
        })
    }

    fn session_url(&self) -> String {
        format!("{}/api/v2/user/session", self.base)
    }

    fn table_url(&self) -> String {
        format!(
            "{}/api/v2/{}/_table/{}",
            self.base, self.config.service, self.config.table
        )
    }
}

/// Table rows for one batch
pub(crate) fn resource_body(timestamp: u64, batch: &[MeasurementRecord]) -> Value {
    let rows: Vec<Value> = batch
        .iter()
        .map(|r| {
            json!({
                "timestamp": timestamp,
                "id_sensore": node_number(&r.node),
                "posizione": r.position,
                "misura": r.measured_item,
                "unita": r.unit,
                "valore": r.value,
            })
        })
        .collect();
    json!({ "resource": rows })
}

#[async_trait]
impl TelemetrySink for DreamFactorySink {
    fn name(&self) -> &str {
        "dreamfactory"
    }

    async fn connect(&mut self) -> Result<(), SinkError> {
        self.session = None;
        let response = self
            .client
            .post(self.session_url())
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(&json!({
                "email": self.config.email,
                "password": self.config.password,
                "remember_me": false,
            }))
            .send()
            .await
            .map_err(request_error)?;
        let session: Session = check_status(response)
            .await?
            .json()
            .await
            .map_err(request_error)?;

        info!(host = %self.base, "DreamFactory session opened");
        self.session = Some(session.session_id);
        Ok(())
    }

    async fn push(&mut self, timestamp: u64, batch: &[MeasurementRecord]) -> Result<(), SinkError> {
        let Some(token) = self.session.as_deref() else {
            return Err(SinkError::NotConnected);
        };
        if batch.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(self.table_url())
            .header(API_KEY_HEADER, &self.config.api_key)
            .header(SESSION_HEADER, token)
            .json(&resource_body(timestamp, batch))
            .send()
            .await
            .map_err(request_error)?;

        match check_status(response).await {
            Ok(_) => {
                debug!(timestamp, records = batch.len(), "rows inserted");
                Ok(())
            }
            Err(e) => {
                // an expired session is renewed by the next connect
                self.session = None;
                Err(e)
            }
        }
    }
}
