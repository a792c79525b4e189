//! Per-solution state owned by the assembler.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use qcc_core::{
    AssemblyContext, CapabilityRequirement, ResourceBudget, Solution, SolutionId, SolutionState,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::graph::ConnectionGraph;
use crate::lifecycle::ManagedCell;

/// Everything the assembler tracks for one solution. Guarded by one mutex per solution.
pub struct SolutionEntry {
    pub id: SolutionId,
    pub state: SolutionState,
    pub signature: String,
    pub requirements: Vec<CapabilityRequirement>,
    pub context: AssemblyContext,
    pub cells: Vec<ManagedCell>,
    pub graph: ConnectionGraph,
    pub created_at: DateTime<Utc>,
    pub assembly_time_ms: Option<u64>,
    /// Set when the solution first became active; used for usage time.
    pub activated_at: Option<Instant>,
    /// Pending trail write for the assembly; release updates wait on it.
    pub record_task: Option<JoinHandle<()>>,
}

impl SolutionEntry {
    pub fn new(
        id: SolutionId,
        signature: String,
        requirements: Vec<CapabilityRequirement>,
        context: AssemblyContext,
    ) -> Self {
        Self {
            id,
            state: SolutionState::Assembling,
            signature,
            requirements,
            context,
            cells: Vec::new(),
            graph: ConnectionGraph::new(),
            created_at: Utc::now(),
            assembly_time_ms: None,
            activated_at: None,
            record_task: None,
        }
    }

    /// Resources currently held by this solution's cells.
    pub fn resource_usage(&self) -> ResourceBudget {
        self.cells
            .iter()
            .filter(|c| c.grant.is_some())
            .map(|c| c.instance.budget)
            .sum()
    }

    pub fn snapshot(&self) -> Solution {
        Solution {
            id: self.id,
            state: self.state,
            cells: self.cells.iter().map(|c| c.instance.clone()).collect(),
            connections: self.graph.connections(),
            resource_usage: self.resource_usage(),
            quantum_signature: self.signature.clone(),
            created_at: self.created_at,
            assembly_time_ms: self.assembly_time_ms,
        }
    }

    /// What is kept once the solution holds no cells.
    pub fn tombstone(&self) -> Tombstone {
        Tombstone {
            id: self.id,
            state: self.state,
            signature: self.signature.clone(),
            created_at: self.created_at,
            assembly_time_ms: self.assembly_time_ms,
        }
    }
}

/// A finished solution: released, or failed before it ever became active.
#[derive(Debug, Clone)]
pub struct Tombstone {
    pub id: SolutionId,
    pub state: SolutionState,
    pub signature: String,
    pub created_at: DateTime<Utc>,
    pub assembly_time_ms: Option<u64>,
}

impl Tombstone {
    pub fn solution(&self) -> Solution {
        Solution {
            id: self.id,
            state: self.state,
            cells: Vec::new(),
            connections: Vec::new(),
            resource_usage: ResourceBudget::ZERO,
            quantum_signature: self.signature.clone(),
            created_at: self.created_at,
            assembly_time_ms: self.assembly_time_ms,
        }
    }
}

/// Bounded set of tombstones. Inserting past capacity evicts the oldest.
pub struct RetiredSolutions {
    capacity: usize,
    order: VecDeque<SolutionId>,
    entries: HashMap<SolutionId, Tombstone>,
}

impl RetiredSolutions {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, id: &SolutionId) -> Option<&Tombstone> {
        self.entries.get(id)
    }

    /// Insert or replace; a replaced tombstone keeps its age.
    pub fn insert(&mut self, tombstone: Tombstone) {
        let id = tombstone.id;
        if self.entries.insert(id, tombstone).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
