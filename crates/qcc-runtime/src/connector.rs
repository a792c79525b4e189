//! Connection orchestrator: resolves interfaces and runs wiring handshakes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use qcc_core::{CellId, Connection, ConnectionMap, ConnectionStatus, ConnectionType, Error, Result};
use qcc_provider::{CellControl, Handshake, HandshakeRole};
use tracing::{debug, info, warn};

use crate::graph::ConnectionGraph;
use crate::guard::{Interrupt, StageGuard};
use crate::lifecycle::ManagedCell;

/// Why one link's handshake failed.
enum LinkFailure {
    Refused(String),
    Interrupted(Interrupt),
}

pub struct ConnectionOrchestrator {
    handshake_timeout: Duration,
}

impl ConnectionOrchestrator {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }

    /// Pick the interface for a `source -> target` link.
    ///
    /// The first non-satisfied requirement of the source that the target
    /// provides (same name and type) wins. A source declaring no
    /// requirements links to the target's first provided interface, or to
    /// an implicit message interface named after the target's capability
    /// when the target declares none either.
    fn resolve(source: &ManagedCell, target: &ManagedCell) -> Result<(String, ConnectionType)> {
        let provides = &target.descriptor.provides;
        if source.descriptor.requires.is_empty() {
            return Ok(match provides.first() {
                Some(p) => (p.name.clone(), p.kind),
                None => (target.instance.capability.clone(), ConnectionType::Message),
            });
        }

        let mut candidates = source
            .descriptor
            .requires
            .iter()
            .filter(|req| provides.iter().any(|p| p.name == req.name && p.kind == req.kind));
        let first = candidates.clone().next();
        candidates
            .find(|req| !source.registered.contains(&req.name))
            .or(first)
            .map(|req| (req.name.clone(), req.kind))
            .ok_or_else(|| Error::Wiring {
                source_cell: source.instance.id.to_string(),
                target_cell: target.instance.id.to_string(),
                reason: format!(
                    "{} provides no interface {} requires",
                    target.instance.capability, source.instance.capability
                ),
            })
    }

    /// Wire every link in `map`; all or nothing.
    ///
    /// Every endpoint must be `Configured` or later. Handshakes run
    /// concurrently: the source initiates, then the target accepts. If any
    /// link fails, every link established so far is retracted on both
    /// sides and the first failure is returned.
    pub async fn wire(
        &self,
        cells: &mut [ManagedCell],
        map: &ConnectionMap,
        guard: &StageGuard,
    ) -> Result<ConnectionGraph> {
        let index: HashMap<CellId, usize> = cells
            .iter()
            .enumerate()
            .map(|(i, c)| (c.instance.id, i))
            .collect();

        let mut graph = ConnectionGraph::new();
        for cell in cells.iter() {
            graph.add_cell(cell.instance.id);
        }

        let mut planned: Vec<Connection> = Vec::new();
        for (source, targets) in map {
            for target in targets {
                let wiring_err = |reason: &str| Error::Wiring {
                    source_cell: source.to_string(),
                    target_cell: target.to_string(),
                    reason: reason.to_string(),
                };
                let (Some(&si), Some(&ti)) = (index.get(source), index.get(target)) else {
                    return Err(wiring_err("unknown cell"));
                };
                if si == ti {
                    return Err(wiring_err("self-loop"));
                }
                let (src, tgt) = (&cells[si], &cells[ti]);
                if !src.state().is_configured_or_later() || !tgt.state().is_configured_or_later() {
                    return Err(wiring_err(&format!(
                        "endpoints must be configured (source {}, target {})",
                        src.state(),
                        tgt.state()
                    )));
                }
                let (interface, kind) = Self::resolve(src, tgt)?;
                let conn = Connection::pending(*source, *target, interface, kind);
                if planned.iter().any(|p| p.same_link(&conn)) {
                    continue;
                }
                graph.add_connection(conn.clone())?;
                planned.push(conn);
            }
        }

        let controls: HashMap<CellId, Arc<dyn CellControl>> = cells
            .iter()
            .map(|c| (c.instance.id, c.control.clone()))
            .collect();

        let results = join_all(planned.iter().map(|conn| {
            let source = controls[&conn.source].clone();
            let target = controls[&conn.target].clone();
            self.handshake(conn, source, target, guard)
        }))
        .await;

        let mut first_failure: Option<(usize, LinkFailure)> = None;
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(()) => {
                    planned[i].status = ConnectionStatus::Established;
                    graph.set_status(&planned[i], ConnectionStatus::Established);
                }
                Err(failure) => {
                    if first_failure.is_none() {
                        first_failure = Some((i, failure));
                    }
                }
            }
        }

        if let Some((i, failure)) = first_failure {
            let established: Vec<Connection> = planned
                .iter()
                .filter(|c| c.status == ConnectionStatus::Established)
                .cloned()
                .collect();
            warn!(
                "Wiring failed, retracting {} established connections",
                established.len()
            );
            self.retract_all(&established, &controls).await;

            let conn = &planned[i];
            return Err(match failure {
                LinkFailure::Refused(reason) => Error::Wiring {
                    source_cell: conn.source.to_string(),
                    target_cell: conn.target.to_string(),
                    reason,
                },
                LinkFailure::Interrupted(interrupt) => guard.error(interrupt, "handshake"),
            });
        }

        for conn in &planned {
            let (si, ti) = (index[&conn.source], index[&conn.target]);
            cells[si].registered.insert(conn.interface.clone());
            cells[si].instance.connections.push(conn.clone());
            cells[ti].instance.connections.push(conn.clone());
        }
        info!("Wired {} connections across {} cells", planned.len(), cells.len());
        Ok(graph)
    }

    /// Retract every established connection on both ends and mark it closed.
    pub async fn teardown(&self, cells: &mut [ManagedCell], graph: &mut ConnectionGraph) {
        let established = graph.established();
        if established.is_empty() {
            return;
        }
        let controls: HashMap<CellId, Arc<dyn CellControl>> = cells
            .iter()
            .map(|c| (c.instance.id, c.control.clone()))
            .collect();
        self.retract_all(&established, &controls).await;

        for conn in &established {
            graph.set_status(conn, ConnectionStatus::Closed);
        }
        for cell in cells.iter_mut() {
            for conn in cell.instance.connections.iter_mut() {
                conn.status = ConnectionStatus::Closed;
            }
            cell.registered.clear();
        }
        debug!("Tore down {} connections", established.len());
    }

    async fn handshake(
        &self,
        conn: &Connection,
        source: Arc<dyn CellControl>,
        target: Arc<dyn CellControl>,
        guard: &StageGuard,
    ) -> std::result::Result<(), LinkFailure> {
        let initiate = Handshake {
            local: conn.source,
            peer: conn.target,
            interface: conn.interface.clone(),
            kind: conn.kind,
            role: HandshakeRole::Initiate,
        };
        self.step(&source, &initiate, guard).await?;

        let accept = Handshake {
            local: conn.target,
            peer: conn.source,
            role: HandshakeRole::Accept,
            ..initiate.clone()
        };
        if let Err(failure) = self.step(&target, &accept, guard).await {
            // The source registered the link; take it back.
            let retract = initiate.with_role(HandshakeRole::Retract);
            if let Err(e) = self.best_effort(&source, &retract).await {
                warn!("Retract of {} -> {} failed: {}", conn.source, conn.target, e);
            }
            return Err(failure);
        }
        Ok(())
    }

    async fn step(
        &self,
        control: &Arc<dyn CellControl>,
        handshake: &Handshake,
        guard: &StageGuard,
    ) -> std::result::Result<(), LinkFailure> {
        match guard.run(self.handshake_timeout, control.connect_to(handshake)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LinkFailure::Refused(format!(
                "{:?} on {} refused: {}",
                handshake.role, handshake.interface, e
            ))),
            Err(Interrupt::Timeout(limit)) => Err(LinkFailure::Refused(format!(
                "{:?} on {} unacknowledged after {}ms",
                handshake.role,
                handshake.interface,
                limit.as_millis()
            ))),
            Err(interrupt) => Err(LinkFailure::Interrupted(interrupt)),
        }
    }

    async fn best_effort(&self, control: &Arc<dyn CellControl>, handshake: &Handshake) -> Result<()> {
        match tokio::time::timeout(self.handshake_timeout, control.connect_to(handshake)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Internal("retract timed out".into())),
        }
    }

    async fn retract_all(&self, conns: &[Connection], controls: &HashMap<CellId, Arc<dyn CellControl>>) {
        join_all(conns.iter().map(|conn| async move {
            let at_source = Handshake {
                local: conn.source,
                peer: conn.target,
                interface: conn.interface.clone(),
                kind: conn.kind,
                role: HandshakeRole::Retract,
            };
            let at_target = Handshake {
                local: conn.target,
                peer: conn.source,
                ..at_source.clone()
            };
            for (id, hs) in [(conn.source, at_source), (conn.target, at_target)] {
                if let Some(control) = controls.get(&id) {
                    if let Err(e) = self.best_effort(control, &hs).await {
                        warn!("Retract on cell {} ({}) failed: {}", id, hs.interface, e);
                    }
                }
            }
        }))
        .await;
    }
}
