//! Runtime types.

use qcc_core::ResourceBudget;
use serde::Serialize;

/// Assembler status information.
#[derive(Debug, Clone, Serialize)]
pub struct AssemblerStatus {
    pub assembler_id: String,
    pub uptime_secs: u64,
    /// Assembled solutions not yet released.
    pub active_solutions: usize,
    /// Assemblies still running.
    pub in_flight: usize,
    pub total_assemblies: u64,
    pub failed_assemblies: u64,
    pub total_cells_requested: u64,
    pub committed: ResourceBudget,
    pub capacity: ResourceBudget,
    pub providers: Vec<String>,
}
