//! Core domain types: requirements, cell instances, solutions, connections.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resources::ResourceBudget;

// ---------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------

/// Identity of one cell instance. Freshly generated per instance, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(Uuid);

impl CellId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CellId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SolutionId(Uuid);

impl SolutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SolutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SolutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SolutionId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidRequest(format!("invalid solution id {}: {}", s, e)))
    }
}

// ---------------------------------------------------------------
// Requirements
// ---------------------------------------------------------------

/// Security level a requirement asks the verification gate to enforce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Standard,
    High,
    Maximum,
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::High => write!(f, "high"),
            Self::Maximum => write!(f, "maximum"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationPriority {
    #[default]
    Balanced,
    Performance,
    Memory,
    Latency,
}

/// Optional hints forwarded to providers alongside a capability request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_level: Option<SecurityLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization: Option<OptimizationPriority>,
}

/// One capability a solution needs. Immutable once an assembly starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRequirement {
    pub name: String,
    /// Semver constraint such as `*`, `=1.2.0`, `>=1.2, <2`, `~1.2` or `^1`.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub preferences: Preferences,
}

fn default_version() -> String {
    "*".into()
}

impl CapabilityRequirement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            preferences: Preferences::default(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_security(mut self, level: SecurityLevel) -> Self {
        self.preferences.security_level = Some(level);
        self
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.preferences.security_level.unwrap_or_default()
    }

    /// Parse the version constraint. `*`, `latest` and an empty string accept any release.
    pub fn version_req(&self) -> crate::Result<VersionReq> {
        parse_constraint(&self.version).map_err(|e| {
            crate::Error::InvalidRequest(format!("{}: bad version constraint {:?}: {}", self.name, self.version, e))
        })
    }

    /// Check a delivered version against this requirement's constraint.
    pub fn accepts_version(&self, version: &str) -> bool {
        version_matches(&self.version, version)
    }
}

fn parse_constraint(constraint: &str) -> std::result::Result<VersionReq, semver::Error> {
    match constraint.trim() {
        "" | "latest" => Ok(VersionReq::STAR),
        c => VersionReq::parse(c),
    }
}

/// Evaluate a version constraint against a concrete version string.
///
/// An unparsable constraint or version never matches.
pub fn version_matches(constraint: &str, version: &str) -> bool {
    let Ok(req) = parse_constraint(constraint) else {
        return false;
    };
    match Version::parse(version.trim().trim_start_matches('v')) {
        Ok(v) => req.matches(&v),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------

/// Lifecycle state of one cell instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Requested,
    Initialized,
    Configured,
    Connected,
    Active,
    Suspended,
    Deactivated,
    Released,
    /// Sink for a failed or timed-out transition. Never re-entered.
    Failed,
}

impl LifecycleState {
    /// Whether the lifecycle graph has an edge from `self` to `next`.
    ///
    /// Forced release during rollback is not an edge here; the lifecycle
    /// manager handles it separately.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Requested, Initialized)
                | (Initialized, Configured)
                | (Configured, Connected)
                | (Connected, Active)
                | (Active, Suspended)
                | (Suspended, Active)
                | (Active, Deactivated)
                | (Suspended, Deactivated)
                | (Deactivated, Released)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::Failed)
    }

    /// Position along the forward path; `None` for the terminal and failure states.
    fn rank(self) -> Option<u8> {
        match self {
            Self::Requested => Some(0),
            Self::Initialized => Some(1),
            Self::Configured => Some(2),
            Self::Connected => Some(3),
            Self::Active | Self::Suspended => Some(4),
            Self::Deactivated => Some(5),
            Self::Released | Self::Failed => None,
        }
    }

    /// True for `Configured` and every live state after it.
    pub fn is_configured_or_later(self) -> bool {
        self.rank().is_some_and(|r| (2..=4).contains(&r))
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Active | Self::Suspended)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Initialized => "initialized",
            Self::Configured => "configured",
            Self::Connected => "connected",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Deactivated => "deactivated",
            Self::Released => "released",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolutionState {
    Assembling,
    Active,
    Suspended,
    Error,
    Released,
}

// ---------------------------------------------------------------
// Connections
// ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Message,
    Event,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Established,
    Retracted,
    Closed,
}

/// A directed link from a source cell to an interface on a target cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub source: CellId,
    pub target: CellId,
    pub interface: String,
    #[serde(rename = "type")]
    pub kind: ConnectionType,
    pub status: ConnectionStatus,
}

impl Connection {
    pub fn pending(
        source: CellId,
        target: CellId,
        interface: impl Into<String>,
        kind: ConnectionType,
    ) -> Self {
        Self {
            source,
            target,
            interface: interface.into(),
            kind,
            status: ConnectionStatus::Pending,
        }
    }

    /// Identity of a connection within a graph: endpoints plus interface.
    pub fn same_link(&self, other: &Connection) -> bool {
        self.source == other.source
            && self.target == other.target
            && self.interface == other.interface
    }
}

/// Cell id adjacency: which targets each source must be wired to.
pub type ConnectionMap = BTreeMap<CellId, Vec<CellId>>;

// ---------------------------------------------------------------
// Cells and solutions
// ---------------------------------------------------------------

/// One running (or formerly running) cell, owned by exactly one solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellInstance {
    pub id: CellId,
    pub capability: String,
    pub provider: String,
    pub signature: String,
    pub version: String,
    pub state: LifecycleState,
    /// Granted budget; zero until the allocator commits it.
    pub budget: ResourceBudget,
    pub connections: Vec<Connection>,
    pub created_at: DateTime<Utc>,
}

impl CellInstance {
    pub fn requested(
        capability: impl Into<String>,
        provider: impl Into<String>,
        signature: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: CellId::new(),
            capability: capability.into(),
            provider: provider.into(),
            signature: signature.into(),
            version: version.into(),
            state: LifecycleState::Requested,
            budget: ResourceBudget::ZERO,
            connections: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Snapshot of an assembled solution as handed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solution {
    pub id: SolutionId,
    pub state: SolutionState,
    pub cells: Vec<CellInstance>,
    pub connections: Vec<Connection>,
    pub resource_usage: ResourceBudget,
    pub quantum_signature: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assembly_time_ms: Option<u64>,
}

impl Solution {
    pub fn cell(&self, id: CellId) -> Option<&CellInstance> {
        self.cells.iter().find(|c| c.id == id)
    }

    pub fn cell_for_capability(&self, capability: &str) -> Option<&CellInstance> {
        self.cells.iter().find(|c| c.capability == capability)
    }

    /// Adjacency keyed by source cell: `(target, interface)` pairs.
    pub fn adjacency(&self) -> BTreeMap<CellId, Vec<(CellId, String)>> {
        let mut adjacency: BTreeMap<CellId, Vec<(CellId, String)>> = BTreeMap::new();
        for conn in &self.connections {
            adjacency
                .entry(conn.source)
                .or_default()
                .push((conn.target, conn.interface.clone()));
        }
        adjacency
    }
}

// ---------------------------------------------------------------
// Context
// ---------------------------------------------------------------

/// Caller context produced by intent interpretation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyContext {
    /// Numeric features used for context proximity (device memory, cores, ...).
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
    /// Free-form attributes forwarded to providers and cells.
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Capability-level wiring: source capability -> target capabilities.
    #[serde(default)]
    pub required_connections: BTreeMap<String, Vec<String>>,
    /// Consult the trail for similar configurations before requesting cells.
    #[serde(default = "default_use_trail")]
    pub use_trail: bool,
}

fn default_use_trail() -> bool {
    true
}

impl Default for AssemblyContext {
    fn default() -> Self {
        Self {
            features: BTreeMap::new(),
            attributes: serde_json::Map::new(),
            required_connections: BTreeMap::new(),
            use_trail: true,
        }
    }
}

impl AssemblyContext {
    pub fn with_feature(mut self, key: impl Into<String>, value: f64) -> Self {
        self.features.insert(key.into(), value);
        self
    }

    pub fn with_connection(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.required_connections
            .entry(source.into())
            .or_default()
            .push(target.into());
        self
    }

    pub fn digest(&self) -> ContextDigest {
        ContextDigest {
            features: self.features.clone(),
        }
    }
}

/// The part of a context the trail compares for proximity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextDigest {
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_edges() {
        use LifecycleState::*;
        assert!(Requested.can_transition_to(Initialized));
        assert!(Configured.can_transition_to(Connected));
        assert!(!Configured.can_transition_to(Active));
        assert!(Active.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Active));
        assert!(!Suspended.can_transition_to(Released));
        assert!(Deactivated.can_transition_to(Released));
        assert!(!Released.can_transition_to(Requested));
        assert!(!Failed.can_transition_to(Initialized));
        assert!(Released.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn test_configured_or_later() {
        use LifecycleState::*;
        assert!(!Initialized.is_configured_or_later());
        assert!(Configured.is_configured_or_later());
        assert!(Suspended.is_configured_or_later());
        assert!(!Deactivated.is_configured_or_later());
        assert!(!Failed.is_configured_or_later());
    }

    #[test]
    fn test_version_constraints() {
        assert!(version_matches("*", "0.1.0"));
        assert!(version_matches("", "2.0.0"));
        assert!(version_matches("latest", "3.1.4"));
        assert!(version_matches(">=1.2", "1.10.0"));
        assert!(!version_matches(">=1.2", "1.1.9"));
        assert!(version_matches("^1.2", "1.4.0"));
        assert!(!version_matches("^1.2", "2.0.0"));
        assert!(version_matches("=1.0", "1.0.0"));
        assert!(version_matches("~1.2", "1.2.5"));
        assert!(!version_matches("~1.2", "1.3.0"));
        assert!(version_matches("<2.0", "1.5.0"));
        assert!(!version_matches("<2.0", "2.0.0"));
    }

    #[test]
    fn test_version_ranges_and_prereleases() {
        assert!(version_matches(">=1.2, <1.5", "1.4.9"));
        assert!(!version_matches(">=1.2, <1.5", "1.5.0"));
        assert!(version_matches("^0.2", "0.2.7"));
        assert!(!version_matches("^0.2", "0.3.0"));
        assert!(!version_matches("=1.0.0", "1.0.0-beta"));
        assert!(version_matches("1.0.0", "v1.0.0"));
        assert!(!version_matches("^1", "not-a-version"));
    }

    #[test]
    fn test_bad_version_constraint_is_invalid_request() {
        let req = CapabilityRequirement::new("file_operations").with_version(">>1");
        assert!(matches!(req.version_req(), Err(crate::Error::InvalidRequest(_))));
        assert!(!req.accepts_version("1.0.0"));
        assert!(CapabilityRequirement::new("ui").version_req().is_ok());
    }

    #[test]
    fn test_requirement_serde_defaults() {
        let req: CapabilityRequirement =
            serde_json::from_value(serde_json::json!({ "name": "file_operations" })).unwrap();
        assert_eq!(req.version, "*");
        assert_eq!(req.security_level(), SecurityLevel::Standard);
    }

    #[test]
    fn test_context_defaults() {
        let ctx: AssemblyContext = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(ctx.use_trail);
        let ctx = ctx
            .with_feature("memory_gb", 8.0)
            .with_connection("user_interface", "file_operations");
        assert_eq!(ctx.digest().features["memory_gb"], 8.0);
        assert_eq!(ctx.required_connections["user_interface"], vec!["file_operations"]);
    }

    #[test]
    fn test_solution_id_parse() {
        let id = SolutionId::new();
        let parsed: SolutionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<SolutionId>().is_err());
    }
}
