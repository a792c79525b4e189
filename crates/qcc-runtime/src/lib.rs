//! Assembly runtime: turns capability requirements into a running solution.
//!
//! The `Assembler` drives the pipeline (trail lookup, cell acquisition and
//! verification, batch reservation, initialize/configure, wiring,
//! activation) and rolls everything back on any fatal error. The
//! `LifecycleManager`, `ConnectionOrchestrator` and `ResourceAllocator` are
//! usable on their own.

pub mod allocator;
pub mod connector;
pub mod graph;
pub mod guard;
pub mod lifecycle;
pub mod orchestrator;
pub mod solution;
pub mod types;

pub use allocator::{GrantId, ResourceAllocator, ResourceGrant};
pub use connector::ConnectionOrchestrator;
pub use graph::{ConnectionGraph, GraphStats};
pub use guard::{Interrupt, StageGuard};
pub use lifecycle::{LifecycleManager, ManagedCell};
pub use orchestrator::{AssemblyHandle, Assembler, Components};
pub use types::*;
