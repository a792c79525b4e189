//! Provider and cell control wire formats (JSON).

use qcc_core::{ConnectionType, Preferences, ResourceBudget};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix every cell and session signature carries.
pub const SIGNATURE_PREFIX: &str = "qc";

/// Request for one cell satisfying one capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellRequest {
    pub request_id: String,
    pub capability: String,
    #[serde(default)]
    pub version: String,
    pub quantum_signature: String,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub preferences: Preferences,
    /// Version a previous successful configuration used; advisory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Success,
    Pending,
    NotFound,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Provider answer to a [`CellRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    #[serde(default)]
    pub request_id: String,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<CellDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ProviderResponse {
    pub fn success(request_id: impl Into<String>, cell: CellDescriptor) -> Self {
        Self {
            request_id: request_id.into(),
            status: RequestStatus::Success,
            cell: Some(cell),
            error: None,
        }
    }

    pub fn not_found(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: RequestStatus::NotFound,
            cell: None,
            error: None,
        }
    }
}

/// An interface a cell requires from a peer, or provides to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ConnectionType,
    /// Optional requirements do not block the `connected` transition.
    #[serde(default)]
    pub optional: bool,
}

impl InterfaceSpec {
    pub fn new(name: impl Into<String>, kind: ConnectionType) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
        }
    }
}

/// Description of a deliverable cell, as returned by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellDescriptor {
    pub cell_id: String,
    pub signature: String,
    pub download_url: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub version: String,
    /// Filled in by the registry client when a provider leaves it empty.
    #[serde(default)]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceBudget>,
    #[serde(default)]
    pub requires: Vec<InterfaceSpec>,
    #[serde(default)]
    pub provides: Vec<InterfaceSpec>,
    /// Control-plane endpoint of the delivered cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_url: Option<String>,
}

impl CellDescriptor {
    /// SHA-256 over the descriptor content a signature must cover, hex encoded.
    pub fn content_digest(&self) -> String {
        let mut capabilities = self.capabilities.clone();
        capabilities.sort();
        let mut dependencies = self.dependencies.clone();
        dependencies.sort();

        let mut hasher = Sha256::new();
        for part in [
            self.cell_id.as_str(),
            self.version.as_str(),
            self.download_url.as_str(),
            &capabilities.join(","),
            &dependencies.join(","),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Signature a provider attaches to an untampered descriptor.
    pub fn expected_signature(&self) -> String {
        format!("{}{}", SIGNATURE_PREFIX, self.content_digest())
    }

    /// Return the descriptor with its signature set to match its content.
    pub fn signed(mut self) -> Self {
        self.signature = self.expected_signature();
        self
    }

    pub fn offers(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlStatus {
    Success,
    Error,
}

/// Envelope every control-plane call returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEnvelope {
    pub status: ControlStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ControlEnvelope {
    pub fn ok(result: Option<serde_json::Value>) -> Self {
        Self {
            status: ControlStatus::Success,
            result,
            error: None,
        }
    }

    /// Convert into the call result, mapping an error envelope to [`qcc_core::Error::Control`].
    pub fn into_result(self) -> qcc_core::Result<Option<serde_json::Value>> {
        match self.status {
            ControlStatus::Success => Ok(self.result),
            ControlStatus::Error => {
                let body = self.error.unwrap_or(ErrorBody {
                    code: "unknown".into(),
                    message: "cell reported an error without details".into(),
                });
                Err(qcc_core::Error::Control {
                    code: body.code,
                    message: body.message,
                })
            }
        }
    }
}
