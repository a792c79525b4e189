//! Connection graph of one solution, using petgraph with cell-id indexing.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use qcc_core::{CellId, Connection, ConnectionMap, ConnectionStatus, Error, Result};
use serde::{Deserialize, Serialize};

/// Directed multigraph of cells and the connections between them.
///
/// Cycles are ordinary data here; self-loops and duplicate links are rejected.
#[derive(Debug, Clone, Default)]
pub struct ConnectionGraph {
    graph: DiGraph<CellId, Connection>,
    node_index: HashMap<CellId, NodeIndex>,
}

impl ConnectionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cell node, returning the existing index if present.
    pub fn add_cell(&mut self, id: CellId) -> NodeIndex {
        if let Some(&idx) = self.node_index.get(&id) {
            return idx;
        }
        let idx = self.graph.add_node(id);
        self.node_index.insert(id, idx);
        idx
    }

    pub fn add_connection(&mut self, conn: Connection) -> Result<()> {
        if conn.source == conn.target {
            return Err(Error::Wiring {
                source_cell: conn.source.to_string(),
                target_cell: conn.target.to_string(),
                reason: "self-loop".into(),
            });
        }
        if self.graph.edge_weights().any(|c| c.same_link(&conn)) {
            return Err(Error::Wiring {
                source_cell: conn.source.to_string(),
                target_cell: conn.target.to_string(),
                reason: format!("duplicate connection on interface {}", conn.interface),
            });
        }
        let a = self.add_cell(conn.source);
        let b = self.add_cell(conn.target);
        self.graph.add_edge(a, b, conn);
        Ok(())
    }

    /// Update the status of the edge matching `conn`'s endpoints and interface.
    pub fn set_status(&mut self, conn: &Connection, status: ConnectionStatus) -> bool {
        match self.graph.edge_weights_mut().find(|c| c.same_link(conn)) {
            Some(edge) => {
                edge.status = status;
                true
            }
            None => false,
        }
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.graph.edge_weights().cloned().collect()
    }

    pub fn established(&self) -> Vec<Connection> {
        self.graph
            .edge_weights()
            .filter(|c| c.status == ConnectionStatus::Established)
            .cloned()
            .collect()
    }

    /// Established targets per source cell.
    pub fn adjacency(&self) -> ConnectionMap {
        let mut map = ConnectionMap::new();
        for edge in self.graph.edge_references() {
            if edge.weight().status != ConnectionStatus::Established {
                continue;
            }
            map.entry(self.graph[edge.source()])
                .or_default()
                .push(self.graph[edge.target()]);
        }
        map
    }

    pub fn is_cyclic(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            node_count: self.graph.node_count(),
            edge_count: self.graph.edge_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStats {
    pub node_count: usize,
    pub edge_count: usize,
}
