//! Lifecycle manager: drives one cell through its state machine.
//!
//! Every transition that calls into the cell is bounded by the transition
//! timeout. A failed or timed-out call moves the cell to `Failed`; it is
//! never retried in place.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use qcc_core::{CellInstance, Error, LifecycleState, ResourceBudget, Result};
use qcc_provider::{CellControl, CellDescriptor};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::allocator::{GrantId, ResourceAllocator, ResourceGrant};
use crate::guard::{Interrupt, StageGuard};

/// A cell instance together with its control handle and runtime bookkeeping.
pub struct ManagedCell {
    pub instance: CellInstance,
    pub descriptor: CellDescriptor,
    pub control: Arc<dyn CellControl>,
    /// Budget to reserve for this cell.
    pub requested: ResourceBudget,
    /// Opaque state captured by the last `suspend`.
    pub snapshot: Option<Value>,
    pub grant: Option<GrantId>,
    /// Required interfaces the connection orchestrator has registered.
    pub registered: BTreeSet<String>,
    /// A failed cell whose release has already been attempted.
    retired: bool,
}

impl ManagedCell {
    pub fn new(instance: CellInstance, descriptor: CellDescriptor, control: Arc<dyn CellControl>) -> Self {
        let requested = descriptor
            .resources
            .unwrap_or_else(|| ResourceBudget::default_for_capability(&instance.capability));
        Self {
            instance,
            descriptor,
            control,
            requested,
            snapshot: None,
            grant: None,
            registered: BTreeSet::new(),
            retired: false,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.instance.state
    }

    /// Attach an allocator grant; the cell now holds those resources.
    pub fn attach_grant(&mut self, grant: ResourceGrant) {
        self.grant = Some(grant.id);
        self.instance.budget = grant.budget;
    }

    /// Non-optional required interfaces not yet registered.
    pub fn unmet_requirements(&self) -> Vec<String> {
        self.descriptor
            .requires
            .iter()
            .filter(|r| !r.optional && !self.registered.contains(&r.name))
            .map(|r| r.name.clone())
            .collect()
    }
}

pub struct LifecycleManager {
    allocator: Arc<ResourceAllocator>,
    transition_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(allocator: Arc<ResourceAllocator>, transition_timeout: Duration) -> Self {
        Self {
            allocator,
            transition_timeout,
        }
    }

    pub async fn initialize(&self, cell: &mut ManagedCell, params: &Value, guard: &StageGuard) -> Result<()> {
        self.transition(cell, LifecycleState::Initialized, "initialize", guard, |c| async move {
            c.initialize(params).await
        })
        .await
    }

    pub async fn configure(&self, cell: &mut ManagedCell, config: &Value, guard: &StageGuard) -> Result<()> {
        self.transition(cell, LifecycleState::Configured, "configure", guard, |c| async move {
            c.configure(config).await
        })
        .await
    }

    /// `Configured -> Connected`, once every required interface is registered.
    pub fn connect(&self, cell: &mut ManagedCell) -> Result<()> {
        let from = cell.state();
        if !from.can_transition_to(LifecycleState::Connected) {
            return Err(invalid(cell, LifecycleState::Connected));
        }
        let unmet = cell.unmet_requirements();
        if !unmet.is_empty() {
            cell.instance.state = LifecycleState::Failed;
            return Err(Error::Lifecycle {
                capability: cell.instance.capability.clone(),
                cell_id: cell.instance.id.to_string(),
                reason: format!("required interfaces not connected: {}", unmet.join(", ")),
            });
        }
        cell.instance.state = LifecycleState::Connected;
        debug!("Cell {} ({}) connected", cell.instance.id, cell.instance.capability);
        Ok(())
    }

    pub async fn activate(&self, cell: &mut ManagedCell, guard: &StageGuard) -> Result<()> {
        self.transition(cell, LifecycleState::Active, "activate", guard, |c| async move {
            c.activate().await
        })
        .await
    }

    /// `Active -> Suspended`, keeping the cell's snapshot for `resume`.
    pub async fn suspend(&self, cell: &mut ManagedCell, guard: &StageGuard) -> Result<()> {
        let snapshot = self
            .transition(cell, LifecycleState::Suspended, "suspend", guard, |c| async move {
                c.suspend().await
            })
            .await?;
        cell.snapshot = Some(snapshot);
        Ok(())
    }

    pub async fn resume(&self, cell: &mut ManagedCell, guard: &StageGuard) -> Result<()> {
        let snapshot = cell.snapshot.clone().unwrap_or(Value::Null);
        self.transition(cell, LifecycleState::Active, "resume", guard, |c| async move {
            c.resume(&snapshot).await
        })
        .await?;
        cell.snapshot = None;
        Ok(())
    }

    pub async fn deactivate(&self, cell: &mut ManagedCell, guard: &StageGuard) -> Result<()> {
        self.transition(cell, LifecycleState::Deactivated, "deactivate", guard, |c| async move {
            c.deactivate().await
        })
        .await
    }

    /// Release the cell and return its grant exactly once.
    ///
    /// From `Deactivated` this is the normal edge. With `force`, any
    /// non-terminal state is released (rollback). A `Failed` cell gets a
    /// best-effort release call, keeps its `Failed` state and returns its
    /// grant. Releasing a `Released` cell is a no-op.
    pub async fn release(&self, cell: &mut ManagedCell, force: bool) -> Result<()> {
        let from = cell.state();
        match from {
            LifecycleState::Released => return Ok(()),
            LifecycleState::Failed if cell.retired => return Ok(()),
            LifecycleState::Failed | LifecycleState::Deactivated => {}
            _ if force => {}
            _ => return Err(invalid(cell, LifecycleState::Released)),
        }

        let call = tokio::time::timeout(self.transition_timeout, cell.control.release()).await;
        let outcome = match call {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {}ms", self.transition_timeout.as_millis())),
        };

        match (from, outcome) {
            (LifecycleState::Failed, _) => {}
            (_, Ok(())) => cell.instance.state = LifecycleState::Released,
            (_, Err(reason)) => {
                warn!(
                    "Cell {} ({}) release failed: {}",
                    cell.instance.id, cell.instance.capability, reason
                );
                cell.instance.state = LifecycleState::Failed;
            }
        }

        cell.retired = cell.state() == LifecycleState::Failed;
        if let Some(grant) = cell.grant.take() {
            self.allocator.release(&[grant]);
        }
        if force && from != LifecycleState::Deactivated && from != LifecycleState::Failed {
            info!("Cell {} ({}) force-released from {}", cell.instance.id, cell.instance.capability, from);
        } else {
            debug!("Cell {} ({}) released", cell.instance.id, cell.instance.capability);
        }
        Ok(())
    }

    async fn transition<T, F, Fut>(
        &self,
        cell: &mut ManagedCell,
        to: LifecycleState,
        operation: &str,
        guard: &StageGuard,
        call: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn CellControl>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let from = cell.state();
        if !from.can_transition_to(to) {
            return Err(invalid(cell, to));
        }

        let capability = cell.instance.capability.clone();
        let cell_id = cell.instance.id.to_string();
        let result = guard.run(self.transition_timeout, call(cell.control.clone())).await;

        let err = match result {
            Ok(Ok(value)) => {
                cell.instance.state = to;
                debug!("Cell {} ({}) {} -> {}", cell_id, capability, from, to);
                return Ok(value);
            }
            Ok(Err(e)) => Error::Lifecycle {
                capability,
                cell_id,
                reason: format!("{} failed: {}", operation, e),
            },
            Err(Interrupt::Timeout(limit)) => Error::LifecycleTimeout {
                capability,
                cell_id,
                operation: operation.to_string(),
                timeout_ms: limit.as_millis() as u64,
            },
            Err(interrupt) => guard.error(interrupt, operation),
        };

        warn!("Cell {} {} failed: {}", cell.instance.id, operation, err);
        cell.instance.state = LifecycleState::Failed;
        Err(err)
    }
}

fn invalid(cell: &ManagedCell, to: LifecycleState) -> Error {
    Error::InvalidTransition {
        cell_id: cell.instance.id.to_string(),
        from: cell.state(),
        to,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qcc_core::ConnectionType;
    use qcc_provider::{Handshake, InterfaceSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct ScriptedControl {
        fail_on: Option<&'static str>,
        hang_on: Option<&'static str>,
        releases: AtomicUsize,
    }

    impl ScriptedControl {
        async fn step(&self, op: &'static str) -> Result<()> {
            if self.hang_on == Some(op) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.fail_on == Some(op) {
                return Err(Error::Control {
                    code: "E_TEST".into(),
                    message: format!("{} refused", op),
                });
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl CellControl for ScriptedControl {
        async fn initialize(&self, _: &Value) -> Result<()> {
            self.step("initialize").await
        }
        async fn configure(&self, _: &Value) -> Result<()> {
            self.step("configure").await
        }
        async fn connect_to(&self, _: &Handshake) -> Result<()> {
            self.step("connect_to").await
        }
        async fn activate(&self) -> Result<()> {
            self.step("activate").await
        }
        async fn suspend(&self) -> Result<Value> {
            self.step("suspend").await?;
            Ok(serde_json::json!({"cursor": 3}))
        }
        async fn resume(&self, snapshot: &Value) -> Result<()> {
            assert_eq!(snapshot["cursor"], 3);
            self.step("resume").await
        }
        async fn deactivate(&self) -> Result<()> {
            self.step("deactivate").await
        }
        async fn release(&self) -> Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.step("release").await
        }
    }

    fn cell(control: Arc<ScriptedControl>, requires: Vec<InterfaceSpec>) -> ManagedCell {
        let descriptor = CellDescriptor {
            cell_id: "test-cell".into(),
            signature: String::new(),
            download_url: "https://p/test".into(),
            capabilities: vec!["file_operations".into()],
            dependencies: vec![],
            version: "1.0.0".into(),
            provider: "p".into(),
            resources: Some(ResourceBudget::new(10, 5, 0, 0)),
            requires,
            provides: vec![],
            control_url: None,
        };
        let instance = CellInstance::requested("file_operations", "p", "", "1.0.0");
        ManagedCell::new(instance, descriptor, control)
    }

    fn manager() -> (LifecycleManager, Arc<ResourceAllocator>) {
        let alloc = Arc::new(ResourceAllocator::new(ResourceBudget::new(100, 100, 100, 100)));
        (LifecycleManager::new(alloc.clone(), Duration::from_millis(50)), alloc)
    }

    fn guard() -> StageGuard {
        StageGuard::new(CancellationToken::new(), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_full_lifecycle_returns_grant_once() {
        let (mgr, alloc) = manager();
        let control = Arc::new(ScriptedControl::default());
        let mut c = cell(control.clone(), vec![]);
        let grant = alloc.reserve(&[c.requested]).unwrap().remove(0);
        c.attach_grant(grant);
        let g = guard();

        mgr.initialize(&mut c, &Value::Null, &g).await.unwrap();
        mgr.configure(&mut c, &Value::Null, &g).await.unwrap();
        mgr.connect(&mut c).unwrap();
        mgr.activate(&mut c, &g).await.unwrap();
        mgr.suspend(&mut c, &g).await.unwrap();
        assert_eq!(c.state(), LifecycleState::Suspended);
        assert_eq!(alloc.committed().memory_mb, 10, "suspend keeps the grant");
        mgr.resume(&mut c, &g).await.unwrap();
        mgr.deactivate(&mut c, &g).await.unwrap();
        mgr.release(&mut c, false).await.unwrap();
        assert_eq!(c.state(), LifecycleState::Released);
        assert_eq!(alloc.committed(), ResourceBudget::ZERO);

        mgr.release(&mut c, false).await.unwrap();
        assert_eq!(control.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_edges_rejected() {
        let (mgr, _) = manager();
        let mut c = cell(Arc::new(ScriptedControl::default()), vec![]);
        let err = mgr.activate(&mut c, &guard()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: LifecycleState::Requested,
                to: LifecycleState::Active,
                ..
            }
        ));
        assert_eq!(c.state(), LifecycleState::Requested);
        assert!(mgr.release(&mut c, false).await.is_err());
    }

    #[tokio::test]
    async fn test_error_and_timeout_move_to_failed() {
        let (mgr, _) = manager();
        let mut c = cell(
            Arc::new(ScriptedControl {
                fail_on: Some("initialize"),
                ..Default::default()
            }),
            vec![],
        );
        let err = mgr.initialize(&mut c, &Value::Null, &guard()).await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle { .. }));
        assert_eq!(c.state(), LifecycleState::Failed);
        assert!(mgr.initialize(&mut c, &Value::Null, &guard()).await.is_err());

        let mut c = cell(
            Arc::new(ScriptedControl {
                hang_on: Some("initialize"),
                ..Default::default()
            }),
            vec![],
        );
        let err = mgr.initialize(&mut c, &Value::Null, &guard()).await.unwrap_err();
        assert!(matches!(err, Error::LifecycleTimeout { timeout_ms: 50, .. }));
        assert_eq!(c.state(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_connect_requires_registered_interfaces() {
        let (mgr, _) = manager();
        let g = guard();
        let mut optional = InterfaceSpec::new("metrics", ConnectionType::Event);
        optional.optional = true;
        let mut c = cell(
            Arc::new(ScriptedControl::default()),
            vec![InterfaceSpec::new("files", ConnectionType::Message), optional],
        );
        mgr.initialize(&mut c, &Value::Null, &g).await.unwrap();
        mgr.configure(&mut c, &Value::Null, &g).await.unwrap();
        c.registered.insert("files".into());
        mgr.connect(&mut c).unwrap();
        assert_eq!(c.state(), LifecycleState::Connected);

        let mut c = cell(
            Arc::new(ScriptedControl::default()),
            vec![InterfaceSpec::new("files", ConnectionType::Message)],
        );
        mgr.initialize(&mut c, &Value::Null, &g).await.unwrap();
        mgr.configure(&mut c, &Value::Null, &g).await.unwrap();
        assert!(mgr.connect(&mut c).is_err());
    }

    #[tokio::test]
    async fn test_forced_release_and_failed_release() {
        let (mgr, alloc) = manager();
        let g = guard();

        let mut c = cell(Arc::new(ScriptedControl::default()), vec![]);
        let grant = alloc.reserve(&[c.requested]).unwrap().remove(0);
        c.attach_grant(grant);
        mgr.initialize(&mut c, &Value::Null, &g).await.unwrap();
        mgr.release(&mut c, true).await.unwrap();
        assert_eq!(c.state(), LifecycleState::Released);

        let control = Arc::new(ScriptedControl {
            fail_on: Some("configure"),
            ..Default::default()
        });
        let mut c = cell(control.clone(), vec![]);
        let grant = alloc.reserve(&[c.requested]).unwrap().remove(0);
        c.attach_grant(grant);
        mgr.initialize(&mut c, &Value::Null, &g).await.unwrap();
        assert!(mgr.configure(&mut c, &Value::Null, &g).await.is_err());
        mgr.release(&mut c, false).await.unwrap();
        assert_eq!(c.state(), LifecycleState::Failed);
        assert_eq!(control.releases.load(Ordering::SeqCst), 1);
        assert_eq!(alloc.committed(), ResourceBudget::ZERO);

        // A rollback pass over the same failed cell does not call it again.
        mgr.release(&mut c, true).await.unwrap();
        assert_eq!(control.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_fails_the_cell() {
        let (mgr, _) = manager();
        let token = CancellationToken::new();
        let g = StageGuard::new(token.clone(), Duration::from_secs(10));
        let mut c = cell(Arc::new(ScriptedControl::default()), vec![]);
        token.cancel();
        let err = mgr.initialize(&mut c, &Value::Null, &g).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(c.state(), LifecycleState::Failed);
    }
}
