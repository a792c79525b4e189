//! Trail record and configuration hint types.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use qcc_core::{CellId, ContextDigest, SolutionId};
use serde::{Deserialize, Serialize};

/// Capability-level wiring: source capability -> target capabilities.
pub type ConnectionPattern = BTreeMap<String, Vec<String>>;

/// Which cell type filled a capability in a recorded configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSpec {
    pub capability: String,
    pub provider: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Assembled,
    Released,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Assembly,
    Update,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembly_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_usage_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<u64>,
}

/// One append-only ledger entry. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailRecord {
    pub record_id: String,
    pub signature: String,
    pub kind: RecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_id: Option<SolutionId>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub cell_ids: Vec<CellId>,
    #[serde(default)]
    pub cells: Vec<CellSpec>,
    #[serde(default)]
    pub connection_pattern: ConnectionPattern,
    #[serde(default)]
    pub context: ContextDigest,
    #[serde(default)]
    pub metrics: PerformanceMetrics,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
}

/// Payload of a `record assembly` call, written once a solution is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyRecord {
    pub signature: String,
    pub solution_id: SolutionId,
    pub capabilities: BTreeSet<String>,
    pub cell_ids: Vec<CellId>,
    pub cells: Vec<CellSpec>,
    pub connection_pattern: ConnectionPattern,
    pub context: ContextDigest,
    pub metrics: PerformanceMetrics,
}

/// Payload of an `update record` call. `timestamp` makes retries idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_id: Option<SolutionId>,
    pub outcome: Outcome,
    pub metrics: PerformanceMetrics,
    pub timestamp: DateTime<Utc>,
}

/// A previously recorded configuration similar to the current request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationHint {
    pub signature: String,
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub cells: Vec<CellSpec>,
    #[serde(default)]
    pub connection_pattern: ConnectionPattern,
    /// Capability-set overlap plus context proximity, in `[0, 1]`.
    pub similarity_score: f64,
    #[serde(default)]
    pub performance_score: f64,
    pub success_rate: f64,
    pub last_used: DateTime<Utc>,
    /// Context the configuration was recorded with; used when re-ranking.
    #[serde(default)]
    pub context: ContextDigest,
}

impl ConfigurationHint {
    pub fn cell_for(&self, capability: &str) -> Option<&CellSpec> {
        self.cells.iter().find(|c| c.capability == capability)
    }
}
