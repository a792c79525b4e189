//! Error types for QCC.
//!
//! Fatal assembly failures collapse into one variant carrying the offending
//! capability or cell id, so callers see a single structured error.

use serde::Serialize;
use thiserror::Error;

use crate::resources::ResourceBudget;
use crate::types::LifecycleState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Capability unavailable: {capability} ({reason})")]
    CapabilityUnavailable { capability: String, reason: String },

    #[error("Verification failed for {capability} (cell {cell_id}): {reason}")]
    VerificationFailed {
        capability: String,
        cell_id: String,
        reason: String,
    },

    #[error("Resource exhaustion: requested {requested}, available {available}")]
    ResourceExhausted {
        requested: ResourceBudget,
        available: ResourceBudget,
    },

    #[error("Lifecycle error for {capability} (cell {cell_id}): {reason}")]
    Lifecycle {
        capability: String,
        cell_id: String,
        reason: String,
    },

    #[error("Lifecycle timeout for {capability} (cell {cell_id}): {operation} exceeded {timeout_ms}ms")]
    LifecycleTimeout {
        capability: String,
        cell_id: String,
        operation: String,
        timeout_ms: u64,
    },

    #[error("Invalid transition for cell {cell_id}: {from} -> {to}")]
    InvalidTransition {
        cell_id: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Wiring error {source_cell} -> {target_cell}: {reason}")]
    Wiring {
        source_cell: String,
        target_cell: String,
        reason: String,
    },

    #[error("Ledger unavailable: {0}")]
    Ledger(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Cell control error [{code}]: {message}")]
    Control { code: String, message: String },

    #[error("Assembly cancelled")]
    Cancelled,

    #[error("Assembly deadline of {0}ms exceeded")]
    DeadlineExceeded(u64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable classification of an [`Error`], used on the wire and in trail outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CapabilityUnavailable,
    VerificationFailure,
    ResourceExhaustion,
    Lifecycle,
    Wiring,
    LedgerUnavailable,
    Provider,
    Cancelled,
    DeadlineExceeded,
    InvalidRequest,
    NotFound,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CapabilityUnavailable { .. } => ErrorKind::CapabilityUnavailable,
            Self::VerificationFailed { .. } => ErrorKind::VerificationFailure,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhaustion,
            Self::Lifecycle { .. } | Self::LifecycleTimeout { .. } | Self::InvalidTransition { .. } => {
                ErrorKind::Lifecycle
            }
            Self::Wiring { .. } => ErrorKind::Wiring,
            Self::Ledger(_) => ErrorKind::LedgerUnavailable,
            Self::Provider(_) | Self::Control { .. } | Self::Http(_) => ErrorKind::Provider,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            Self::InvalidRequest(_) | Self::Config(_) => ErrorKind::InvalidRequest,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a failed cell may be replaced by an alternate from another provider.
    pub fn allows_substitution(&self) -> bool {
        matches!(
            self,
            Self::Lifecycle { .. } | Self::LifecycleTimeout { .. } | Self::Control { .. }
        )
    }
}
