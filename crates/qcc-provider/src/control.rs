//! Cell control plane: the calls that drive a delivered cell through its lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use qcc_core::{CellId, ConnectionType, Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::protocol::ControlEnvelope;
use crate::registry::Candidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeRole {
    /// Source side: open the link to the peer.
    Initiate,
    /// Target side: accept an incoming link.
    Accept,
    /// Either side: drop a link established earlier.
    Retract,
}

/// One side of a connection handshake, as seen by the cell receiving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub local: CellId,
    pub peer: CellId,
    pub interface: String,
    #[serde(rename = "type")]
    pub kind: ConnectionType,
    pub role: HandshakeRole,
}

impl Handshake {
    pub fn with_role(&self, role: HandshakeRole) -> Self {
        Self { role, ..self.clone() }
    }
}

/// Control surface of one running cell.
#[async_trait]
pub trait CellControl: Send + Sync {
    async fn initialize(&self, params: &Value) -> Result<()>;
    async fn configure(&self, config: &Value) -> Result<()>;
    async fn connect_to(&self, handshake: &Handshake) -> Result<()>;
    async fn activate(&self) -> Result<()>;
    /// Suspend and return an opaque state snapshot for `resume`.
    async fn suspend(&self) -> Result<Value>;
    async fn resume(&self, snapshot: &Value) -> Result<()>;
    async fn deactivate(&self) -> Result<()>;
    async fn release(&self) -> Result<()>;
}

/// Produces a control handle for a freshly delivered cell.
pub trait CellBinder: Send + Sync {
    fn bind(&self, id: CellId, candidate: &Candidate) -> Result<Arc<dyn CellControl>>;
}

/// Control over HTTP: `POST {control_url}/{method}` returning a [`ControlEnvelope`].
pub struct HttpCellControl {
    client: Client,
    base_url: String,
    cell_id: CellId,
}

impl HttpCellControl {
    pub fn new(client: Client, base_url: impl Into<String>, cell_id: CellId) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cell_id,
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Option<Value>> {
        let url = format!("{}/{}", self.base_url, method);
        debug!("Cell {} <- {}", self.cell_id, method);

        let resp = self
            .client
            .post(&url)
            .json(&json!({ "cell_id": self.cell_id, "params": params }))
            .send()
            .await
            .map_err(|e| Error::Http(format!("{}: {}", url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            // Cells may still send an envelope alongside a failure status.
            let body = resp.text().await.unwrap_or_default();
            if let Ok(envelope) = serde_json::from_str::<ControlEnvelope>(&body) {
                return envelope.into_result();
            }
            return Err(Error::Control {
                code: status.as_u16().to_string(),
                message: body,
            });
        }

        resp.json::<ControlEnvelope>()
            .await
            .map_err(|e| Error::Provider(format!("{}: malformed control response: {}", url, e)))?
            .into_result()
    }
}

#[async_trait]
impl CellControl for HttpCellControl {
    async fn initialize(&self, params: &Value) -> Result<()> {
        self.call("initialize", params.clone()).await.map(|_| ())
    }

    async fn configure(&self, config: &Value) -> Result<()> {
        self.call("configure", config.clone()).await.map(|_| ())
    }

    async fn connect_to(&self, handshake: &Handshake) -> Result<()> {
        let params = json!({
            "target_cell_id": handshake.peer,
            "interface": handshake.interface,
            "type": handshake.kind,
            "role": handshake.role,
        });
        self.call("connectTo", params).await.map(|_| ())
    }

    async fn activate(&self) -> Result<()> {
        self.call("activate", Value::Null).await.map(|_| ())
    }

    async fn suspend(&self) -> Result<Value> {
        Ok(self.call("suspend", Value::Null).await?.unwrap_or(Value::Null))
    }

    async fn resume(&self, snapshot: &Value) -> Result<()> {
        self.call("resume", json!({ "state": snapshot })).await.map(|_| ())
    }

    async fn deactivate(&self) -> Result<()> {
        self.call("deactivate", Value::Null).await.map(|_| ())
    }

    async fn release(&self) -> Result<()> {
        self.call("release", Value::Null).await.map(|_| ())
    }
}

/// Binds cells whose descriptor names a control endpoint.
pub struct HttpCellBinder {
    client: Client,
}

impl HttpCellBinder {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpCellBinder {
    fn default() -> Self {
        Self::new()
    }
}

impl CellBinder for HttpCellBinder {
    fn bind(&self, id: CellId, candidate: &Candidate) -> Result<Arc<dyn CellControl>> {
        let url = candidate.descriptor.control_url.as_deref().ok_or_else(|| Error::Lifecycle {
            capability: candidate.capability.clone(),
            cell_id: id.to_string(),
            reason: format!("cell {} has no control endpoint", candidate.descriptor.cell_id),
        })?;
        Ok(Arc::new(HttpCellControl::new(self.client.clone(), url, id)))
    }
}
