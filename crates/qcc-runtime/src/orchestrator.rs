//! Assembly orchestrator.
//!
//! Pipeline per request: trail lookup, concurrent acquire + verify per
//! capability, batch reservation, concurrent initialize + configure, wiring,
//! connect, concurrent activation. A failed lifecycle call at any stage gets
//! one alternate substitution per capability; after an activation
//! substitution the solution is wired again. Any fatal error rolls back
//! every cell acquired so far and returns all granted resources before the
//! error is surfaced.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use qcc_core::{
    AssemblyContext, AssemblyPolicy, CapabilityRequirement, CellInstance, ConnectionMap,
    DeviceResources, Error, LifecycleState, QccConfig, ResourceBudget, Result, Solution,
    SolutionId, SolutionState, TimeoutConfig,
};
use qcc_provider::{
    Candidate, CapabilityProvider, CellBinder, HttpCellBinder, HttpProvider, RegistryClient,
    RequestHint, SignatureGate, Verifier,
};
use qcc_trail::{
    generate_signature, AssemblyRecord, CellSpec, ConfigurationHint, ConnectionPattern,
    HttpTrailClient, InMemoryTrail, Outcome, PerformanceMetrics, RecordUpdate, TrailClient,
};
use serde_json::{json, Value};
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::allocator::ResourceAllocator;
use crate::connector::ConnectionOrchestrator;
use crate::graph::ConnectionGraph;
use crate::guard::{Interrupt, StageGuard};
use crate::lifecycle::{LifecycleManager, ManagedCell};
use crate::solution::{RetiredSolutions, SolutionEntry, Tombstone};
use crate::types::AssemblerStatus;

/// Collaborators the assembler talks to. Swappable for tests.
pub struct Components {
    pub registry: RegistryClient,
    pub verifier: Arc<dyn Verifier>,
    pub binder: Arc<dyn CellBinder>,
    pub trail: Arc<dyn TrailClient>,
}

struct InFlight {
    token: CancellationToken,
    signature: String,
    created_at: DateTime<Utc>,
}

struct Inner {
    assembler_id: String,
    user_id: String,
    timeouts: TimeoutConfig,
    policy: AssemblyPolicy,
    registry: RegistryClient,
    verifier: Arc<dyn Verifier>,
    binder: Arc<dyn CellBinder>,
    trail: Arc<dyn TrailClient>,
    allocator: Arc<ResourceAllocator>,
    lifecycle: LifecycleManager,
    connector: ConnectionOrchestrator,
    workers: Semaphore,
    solutions: RwLock<HashMap<SolutionId, Arc<Mutex<SolutionEntry>>>>,
    retired: RwLock<RetiredSolutions>,
    in_flight: RwLock<HashMap<SolutionId, InFlight>>,
    total_assemblies: AtomicU64,
    failed_assemblies: AtomicU64,
    cells_requested: AtomicU64,
    active_solutions: AtomicUsize,
    started_at: Instant,
}

/// Assembles, tracks and releases solutions. Cheap to clone.
#[derive(Clone)]
pub struct Assembler {
    inner: Arc<Inner>,
}

/// A running assembly. Dropping the handle does not cancel it.
pub struct AssemblyHandle {
    id: SolutionId,
    token: CancellationToken,
    task: JoinHandle<Result<Solution>>,
}

impl AssemblyHandle {
    pub fn id(&self) -> SolutionId {
        self.id
    }

    /// Request cancellation; the assembly rolls back and reports `Cancelled`.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub async fn join(self) -> Result<Solution> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("assembly task failed: {}", e)))?
    }
}

impl Assembler {
    pub fn new(config: &QccConfig, capacity: ResourceBudget, components: Components) -> Self {
        let allocator = Arc::new(ResourceAllocator::new(capacity));
        let assembler_id = format!("qcc-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        info!(
            "Assembler {} ready: capacity {}, {} providers, concurrency {}",
            assembler_id,
            capacity,
            components.registry.provider_ids().len(),
            config.assembly.max_concurrency
        );

        Self {
            inner: Arc::new(Inner {
                assembler_id,
                user_id: config.user_id.clone(),
                timeouts: config.timeouts.clone(),
                policy: config.assembly.clone(),
                registry: components.registry,
                verifier: components.verifier,
                binder: components.binder,
                trail: components.trail,
                lifecycle: LifecycleManager::new(allocator.clone(), config.timeouts.transition()),
                connector: ConnectionOrchestrator::new(config.timeouts.handshake()),
                allocator,
                workers: Semaphore::new(config.assembly.max_concurrency.max(1)),
                solutions: RwLock::new(HashMap::new()),
                retired: RwLock::new(RetiredSolutions::new(config.assembly.retained_solutions)),
                in_flight: RwLock::new(HashMap::new()),
                total_assemblies: AtomicU64::new(0),
                failed_assemblies: AtomicU64::new(0),
                cells_requested: AtomicU64::new(0),
                active_solutions: AtomicUsize::new(0),
                started_at: Instant::now(),
            }),
        }
    }

    /// HTTP providers, signature gate, HTTP cell binder and the configured trail.
    pub fn from_config(config: &QccConfig) -> Result<Self> {
        config.validate()?;

        let providers: Vec<Arc<dyn CapabilityProvider>> = config
            .provider_urls
            .iter()
            .map(|url| Arc::new(HttpProvider::new(url.clone())) as Arc<dyn CapabilityProvider>)
            .collect();

        let trail: Arc<dyn TrailClient> = match (&config.trail_url, &config.trail_file) {
            (Some(url), _) => Arc::new(HttpTrailClient::new(url.clone())),
            (None, Some(path)) => Arc::new(InMemoryTrail::with_file(path)),
            (None, None) => Arc::new(InMemoryTrail::new()),
        };

        let capacity = DeviceResources::discover().capacity(config.device_capacity);
        let components = Components {
            registry: RegistryClient::new(providers, config.timeouts.request()),
            verifier: Arc::new(SignatureGate::new(config.trusted_providers.clone())),
            binder: Arc::new(HttpCellBinder::new()),
            trail,
        };
        Ok(Self::new(config, capacity, components))
    }

    pub fn allocator(&self) -> Arc<ResourceAllocator> {
        self.inner.allocator.clone()
    }

    // ---------------------------------------------------------------
    // Assemble
    // ---------------------------------------------------------------

    /// Assemble and wait for the result.
    pub async fn assemble(
        &self,
        requirements: Vec<CapabilityRequirement>,
        context: AssemblyContext,
    ) -> Result<Solution> {
        self.spawn(requirements, context)?.join().await
    }

    /// Start an assembly in the background. The solution id is known at once.
    pub fn spawn(
        &self,
        requirements: Vec<CapabilityRequirement>,
        context: AssemblyContext,
    ) -> Result<AssemblyHandle> {
        validate_requirements(&requirements)?;

        let id = SolutionId::new();
        let names: Vec<&str> = requirements.iter().map(|r| r.name.as_str()).collect();
        let signature = generate_signature(&self.inner.user_id, &names, Utc::now());

        let entry = SolutionEntry::new(id, signature.clone(), requirements, context);
        let created_at = entry.created_at;
        let entry = Arc::new(Mutex::new(entry));
        let locked = entry
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::Internal(format!("solution {} locked before start", id)))?;

        let token = CancellationToken::new();
        self.inner.solutions.write().insert(id, entry);
        self.inner.in_flight.write().insert(
            id,
            InFlight {
                token: token.clone(),
                signature,
                created_at,
            },
        );
        self.inner.total_assemblies.fetch_add(1, Ordering::Relaxed);

        let guard = StageGuard::new(token.clone(), self.inner.timeouts.assembly_deadline());
        let this = self.clone();
        let task = tokio::spawn(async move { this.execute(locked, guard).await });

        Ok(AssemblyHandle { id, token, task })
    }

    async fn execute(&self, mut entry: OwnedMutexGuard<SolutionEntry>, guard: StageGuard) -> Result<Solution> {
        let started = Instant::now();
        let id = entry.id;
        let requirements = entry.requirements.clone();
        let context = entry.context.clone();
        let signature = entry.signature.clone();
        info!(
            "Assembling solution {} [{}]",
            id,
            requirements.iter().map(|r| r.name.as_str()).collect::<Vec<_>>().join(", ")
        );

        let mut cells: Vec<ManagedCell> = Vec::new();
        let mut graph = ConnectionGraph::new();
        let outcome = self
            .pipeline(&requirements, &context, &signature, &guard, &mut cells, &mut graph)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                entry.cells = cells;
                entry.graph = graph;
                entry.state = SolutionState::Active;
                entry.assembly_time_ms = Some(elapsed_ms);
                entry.activated_at = Some(Instant::now());
                let solution = entry.snapshot();
                entry.record_task = Some(self.spawn_record(&solution, &context));
                self.inner.active_solutions.fetch_add(1, Ordering::Relaxed);
                self.inner.in_flight.write().remove(&id);
                drop(entry);

                info!(
                    "Solution {} active: {} cells, {} connections in {}ms",
                    id,
                    solution.cells.len(),
                    solution.connections.len(),
                    elapsed_ms
                );
                Ok(solution)
            }
            Err(err) => {
                warn!("Assembly {} failed after {}ms: {}", id, elapsed_ms, err);
                self.rollback(&mut cells, &mut graph).await;
                entry.cells = cells;
                entry.graph = graph;
                entry.state = SolutionState::Error;
                entry.assembly_time_ms = Some(elapsed_ms);
                self.inner.failed_assemblies.fetch_add(1, Ordering::Relaxed);
                // Rolled back: nothing is held, so only the tombstone stays.
                self.retire(&entry);
                self.inner.in_flight.write().remove(&id);
                drop(entry);
                Err(err)
            }
        }
    }

    async fn pipeline(
        &self,
        requirements: &[CapabilityRequirement],
        context: &AssemblyContext,
        signature: &str,
        guard: &StageGuard,
        cells: &mut Vec<ManagedCell>,
        graph: &mut ConnectionGraph,
    ) -> Result<()> {
        let inner = &self.inner;

        let hint = if context.use_trail {
            self.lookup_hint(requirements, context, guard).await?
        } else {
            None
        };

        // Acquire and verify one cell per capability.
        guard.check()?;
        let ctx_value = serde_json::to_value(context)?;
        let hints: Vec<Option<RequestHint>> = requirements
            .iter()
            .map(|req| {
                hint.as_ref().and_then(|h| h.cell_for(&req.name)).map(|spec| RequestHint {
                    provider: Some(spec.provider.clone()),
                    version: Some(spec.version.clone()),
                })
            })
            .collect();
        let acquired = join_all(requirements.iter().zip(hints.iter()).map(|(req, req_hint)| {
            let ctx_value = &ctx_value;
            async move {
                let mut exclude = HashSet::new();
                let candidate = self
                    .acquire(req, signature, ctx_value, &mut exclude, req_hint.as_ref(), guard)
                    .await?;
                Ok::<_, Error>((candidate, exclude))
            }
        }))
        .await;

        let mut candidates = Vec::with_capacity(requirements.len());
        let mut excludes = Vec::with_capacity(requirements.len());
        for result in acquired {
            let (candidate, exclude) = result?;
            candidates.push(candidate);
            excludes.push(exclude);
        }

        for candidate in &candidates {
            cells.push(self.bind(candidate)?);
        }
        inner.cells_requested.fetch_add(cells.len() as u64, Ordering::Relaxed);

        // Reserve everything at once; partial grants never exist.
        guard.check()?;
        let budgets: Vec<ResourceBudget> = cells.iter().map(|c| c.requested).collect();
        let grants = inner.allocator.reserve(&budgets)?;
        for (cell, grant) in cells.iter_mut().zip(grants) {
            cell.attach_grant(grant);
        }

        guard.check()?;
        let mut substitutions = vec![0u32; requirements.len()];
        let results = join_all(
            cells
                .iter_mut()
                .zip(requirements.iter())
                .zip(excludes.iter_mut())
                .zip(substitutions.iter_mut())
                .map(|(((cell, req), exclude), used)| {
                    self.bring_up(cell, req, exclude, used, signature, &ctx_value, guard)
                }),
        )
        .await;
        for result in results {
            result?;
        }

        loop {
            // Wiring: explicit connections win over the trail's pattern.
            guard.check()?;
            let map = if !context.required_connections.is_empty() {
                connection_map(&context.required_connections, cells, true)?
            } else if let Some(h) = &hint {
                connection_map(&h.connection_pattern, cells, false)?
            } else {
                ConnectionMap::new()
            };
            *graph = inner.connector.wire(cells, &map, guard).await?;

            for cell in cells.iter_mut().filter(|c| c.state() == LifecycleState::Configured) {
                inner.lifecycle.connect(cell)?;
            }

            guard.check()?;
            let results = join_all(
                cells
                    .iter_mut()
                    .enumerate()
                    .filter(|(_, c)| c.state() == LifecycleState::Connected)
                    .map(|(i, cell)| async move {
                        let outcome = match self.permit(guard).await {
                            Ok(_permit) => self.inner.lifecycle.activate(cell, guard).await,
                            Err(e) => Err(e),
                        };
                        (i, outcome)
                    }),
            )
            .await;
            let mut failed: Vec<(usize, Error)> = results
                .into_iter()
                .filter_map(|(i, outcome)| outcome.err().map(|e| (i, e)))
                .collect();
            if failed.is_empty() {
                return Ok(());
            }
            let fatal = failed.iter().position(|(i, e)| {
                !e.allows_substitution() || substitutions[*i] >= inner.policy.alternate_substitutions
            });
            if let Some(pos) = fatal {
                return Err(failed.swap_remove(pos).1);
            }

            // Replace every cell that failed to activate, then wire again.
            inner.connector.teardown(cells, graph).await;
            for (i, err) in failed {
                substitutions[i] += 1;
                let req = &requirements[i];
                let cell = &mut cells[i];
                warn!(
                    "{} cell {} from {} failed to activate: {}; substituting",
                    req.name, cell.instance.id, cell.instance.provider, err
                );
                self.substitute(cell, req, &mut excludes[i], signature, &ctx_value, guard, err)
                    .await?;
                self.init_configure(cell, req, signature, &ctx_value, guard).await?;
            }
            for cell in cells.iter_mut() {
                cell.instance.connections.clear();
            }
        }
    }

    /// Best previous configuration, if the trail has one above the success threshold.
    async fn lookup_hint(
        &self,
        requirements: &[CapabilityRequirement],
        context: &AssemblyContext,
        guard: &StageGuard,
    ) -> Result<Option<ConfigurationHint>> {
        let policy = &self.inner.policy;
        let capabilities: BTreeSet<String> = requirements.iter().map(|r| r.name.clone()).collect();
        let digest = context.digest();
        let lookup = self
            .inner
            .trail
            .find_similar(&capabilities, &digest, policy.similarity_threshold);

        match guard.run(self.inner.timeouts.trail(), lookup).await {
            Ok(Ok(hints)) => {
                let hint = hints
                    .into_iter()
                    .find(|h| h.success_rate >= policy.success_rate_threshold);
                if let Some(h) = &hint {
                    info!(
                        "Reusing trail configuration {} (similarity {:.2}, success rate {:.2})",
                        h.signature, h.similarity_score, h.success_rate
                    );
                }
                Ok(hint)
            }
            Ok(Err(e)) => {
                warn!("Trail lookup failed, assembling without hints: {}", e);
                Ok(None)
            }
            Err(Interrupt::Timeout(limit)) => {
                warn!("Trail lookup timed out after {}ms, assembling without hints", limit.as_millis());
                Ok(None)
            }
            Err(interrupt) => Err(guard.error(interrupt, "trail lookup")),
        }
    }

    /// One verified candidate for `req`. Rejected providers are added to `exclude`.
    async fn acquire(
        &self,
        req: &CapabilityRequirement,
        signature: &str,
        ctx_value: &Value,
        exclude: &mut HashSet<String>,
        hint: Option<&RequestHint>,
        guard: &StageGuard,
    ) -> Result<Candidate> {
        let _permit = self.permit(guard).await?;
        let level = req.security_level();
        let mut rejected: Option<Error> = None;
        let mut attempts = 0u32;

        loop {
            let found = guard
                .watch(self.inner.registry.find_candidate(req, signature, ctx_value, exclude, hint))
                .await
                .map_err(|i| guard.error(i, "capability request"))?;
            let candidate = match (found, rejected.take()) {
                (Ok(candidate), _) => candidate,
                // Every remaining provider declined; the rejection is the real cause.
                (Err(Error::CapabilityUnavailable { .. }), Some(last)) => return Err(last),
                (Err(e), _) => return Err(e),
            };

            let verdict = guard
                .watch(self.inner.verifier.verify(&candidate, level))
                .await
                .map_err(|i| guard.error(i, "verification"))?;
            match verdict {
                Ok(()) => {
                    debug!(
                        "Verified {} cell {} from {}",
                        req.name, candidate.descriptor.cell_id, candidate.provider
                    );
                    return Ok(candidate);
                }
                Err(e @ Error::VerificationFailed { .. }) => {
                    attempts += 1;
                    exclude.insert(candidate.provider.clone());
                    if attempts > self.inner.policy.max_verification_retries {
                        return Err(e);
                    }
                    warn!("{} (attempt {}), requesting an alternate", e, attempts);
                    rejected = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn bind(&self, candidate: &Candidate) -> Result<ManagedCell> {
        let descriptor = &candidate.descriptor;
        let instance = CellInstance::requested(
            &candidate.capability,
            &candidate.provider,
            &descriptor.signature,
            &descriptor.version,
        );
        let control = self.inner.binder.bind(instance.id, candidate)?;
        Ok(ManagedCell::new(instance, descriptor.clone(), control))
    }

    /// Initialize and configure one cell, substituting an alternate on lifecycle failure.
    #[allow(clippy::too_many_arguments)]
    async fn bring_up(
        &self,
        cell: &mut ManagedCell,
        req: &CapabilityRequirement,
        exclude: &mut HashSet<String>,
        substitutions: &mut u32,
        signature: &str,
        ctx_value: &Value,
        guard: &StageGuard,
    ) -> Result<()> {
        loop {
            let err = match self.init_configure(cell, req, signature, ctx_value, guard).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if !err.allows_substitution() || *substitutions >= self.inner.policy.alternate_substitutions {
                return Err(err);
            }
            *substitutions += 1;
            warn!(
                "{} cell {} from {} failed: {}; substituting",
                req.name, cell.instance.id, cell.instance.provider, err
            );
            self.substitute(cell, req, exclude, signature, ctx_value, guard, err).await?;
        }
    }

    /// Release `cell` and put a freshly reserved alternate from another
    /// provider in its place. Without an alternate, `cause` is returned.
    #[allow(clippy::too_many_arguments)]
    async fn substitute(
        &self,
        cell: &mut ManagedCell,
        req: &CapabilityRequirement,
        exclude: &mut HashSet<String>,
        signature: &str,
        ctx_value: &Value,
        guard: &StageGuard,
        cause: Error,
    ) -> Result<()> {
        let inner = &self.inner;
        inner.lifecycle.release(cell, true).await?;
        exclude.insert(cell.instance.provider.clone());

        let candidate = match self.acquire(req, signature, ctx_value, exclude, None, guard).await {
            Ok(candidate) => candidate,
            Err(alt @ (Error::Cancelled | Error::DeadlineExceeded(_))) => return Err(alt),
            Err(alt) => {
                warn!("No alternate for {}: {}", req.name, alt);
                return Err(cause);
            }
        };
        let mut replacement = self.bind(&candidate)?;
        let grant = inner
            .allocator
            .reserve(&[replacement.requested])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Internal("allocator returned no grant".into()))?;
        replacement.attach_grant(grant);
        inner.cells_requested.fetch_add(1, Ordering::Relaxed);
        *cell = replacement;
        Ok(())
    }

    async fn init_configure(
        &self,
        cell: &mut ManagedCell,
        req: &CapabilityRequirement,
        signature: &str,
        ctx_value: &Value,
        guard: &StageGuard,
    ) -> Result<()> {
        let _permit = self.permit(guard).await?;
        let params = json!({
            "capability": req.name,
            "quantum_signature": signature,
            "context": ctx_value,
        });
        self.inner.lifecycle.initialize(cell, &params, guard).await?;

        let config = json!({
            "preferences": req.preferences,
            "resources": cell.instance.budget,
        });
        self.inner.lifecycle.configure(cell, &config, guard).await
    }

    async fn permit(&self, guard: &StageGuard) -> Result<SemaphorePermit<'_>> {
        match guard.watch(self.inner.workers.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Error::Internal("worker pool closed".into())),
            Err(interrupt) => Err(guard.error(interrupt, "worker pool")),
        }
    }

    /// Undo a partial assembly. Never fails; every grant is returned.
    async fn rollback(&self, cells: &mut [ManagedCell], graph: &mut ConnectionGraph) {
        if cells.is_empty() {
            return;
        }
        self.inner.connector.teardown(cells, graph).await;
        self.shutdown_cells(cells).await;
        debug!("Rolled back {} cells", cells.len());
    }

    /// Deactivate running cells, then force-release every cell.
    async fn shutdown_cells(&self, cells: &mut [ManagedCell]) {
        let lifecycle = &self.inner.lifecycle;
        let unbounded = StageGuard::unbounded();
        join_all(cells.iter_mut().map(|cell| {
            let guard = &unbounded;
            async move {
                if cell.state().is_running() {
                    if let Err(e) = lifecycle.deactivate(cell, guard).await {
                        warn!("Deactivate {} failed: {}", cell.instance.id, e);
                    }
                }
                if let Err(e) = lifecycle.release(cell, true).await {
                    error!("Release {} failed: {}", cell.instance.id, e);
                }
            }
        }))
        .await;
    }

    // ---------------------------------------------------------------
    // Solution operations
    // ---------------------------------------------------------------

    fn entry(&self, id: SolutionId) -> Result<Arc<Mutex<SolutionEntry>>> {
        self.inner
            .solutions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("solution {}", id)))
    }

    /// Release a solution and all its resources. Idempotent.
    ///
    /// An assembly still in flight is cancelled first and this call waits
    /// for its rollback.
    pub async fn release(&self, id: SolutionId) -> Result<()> {
        let entry = match self.entry(id) {
            Ok(entry) => entry,
            Err(e) => {
                let mut retired = self.inner.retired.write();
                let Some(tombstone) = retired.get(&id).cloned() else {
                    return Err(e);
                };
                if tombstone.state != SolutionState::Released {
                    retired.insert(Tombstone {
                        state: SolutionState::Released,
                        ..tombstone
                    });
                }
                debug!("Solution {} already released", id);
                return Ok(());
            }
        };
        let in_flight = self.inner.in_flight.read().get(&id).map(|f| f.token.clone());
        if let Some(token) = in_flight {
            info!("Cancelling in-flight assembly {}", id);
            token.cancel();
        }

        let mut entry = entry.lock().await;
        if entry.state == SolutionState::Released {
            debug!("Solution {} already released", id);
            return Ok(());
        }

        let prior = entry.state;
        let usage = entry.resource_usage();
        let entry = &mut *entry;
        self.inner.connector.teardown(&mut entry.cells, &mut entry.graph).await;
        self.shutdown_cells(&mut entry.cells).await;
        entry.state = SolutionState::Released;

        if let Some(activated_at) = entry.activated_at {
            self.inner.active_solutions.fetch_sub(1, Ordering::Relaxed);
            let outcome = if prior == SolutionState::Error {
                Outcome::Failed
            } else {
                Outcome::Released
            };
            let update = RecordUpdate {
                signature: entry.signature.clone(),
                solution_id: Some(id),
                outcome,
                metrics: PerformanceMetrics {
                    assembly_time_ms: entry.assembly_time_ms,
                    total_usage_time_ms: Some(activated_at.elapsed().as_millis() as u64),
                    memory_mb: Some(usage.memory_mb),
                    cpu_percent: Some(usage.cpu_percent),
                },
                timestamp: Utc::now(),
            };
            self.spawn_update(update, entry.record_task.take());
        }

        info!("Solution {} released ({} cells)", id, entry.cells.len());
        self.retire(entry);
        Ok(())
    }

    /// Suspend every active cell. Suspending a suspended solution is a no-op.
    pub async fn suspend(&self, id: SolutionId) -> Result<Solution> {
        self.transition_all(id, SolutionState::Suspended).await
    }

    /// Resume every suspended cell. Resuming an active solution is a no-op.
    pub async fn resume(&self, id: SolutionId) -> Result<Solution> {
        self.transition_all(id, SolutionState::Active).await
    }

    async fn transition_all(&self, id: SolutionId, target: SolutionState) -> Result<Solution> {
        let entry = match self.entry(id) {
            Ok(entry) => entry,
            Err(e) => {
                let retired = self.inner.retired.read().get(&id).map(|t| t.state);
                return Err(match retired {
                    Some(state) => Error::InvalidRequest(format!(
                        "solution {} is {:?}, cannot move to {:?}",
                        id, state, target
                    )),
                    None => e,
                });
            }
        };
        let mut entry = entry.lock().await;
        let (from, cell_from) = match target {
            SolutionState::Suspended => (SolutionState::Active, LifecycleState::Active),
            _ => (SolutionState::Suspended, LifecycleState::Suspended),
        };
        if entry.state == target {
            return Ok(entry.snapshot());
        }
        if entry.state != from {
            return Err(Error::InvalidRequest(format!(
                "solution {} is {:?}, cannot move to {:?}",
                id, entry.state, target
            )));
        }

        let lifecycle = &self.inner.lifecycle;
        let guard = StageGuard::unbounded();
        let entry = &mut *entry;
        let results = join_all(
            entry
                .cells
                .iter_mut()
                .filter(|c| c.state() == cell_from)
                .map(|cell| {
                    let guard = &guard;
                    async move {
                        match target {
                            SolutionState::Suspended => lifecycle.suspend(cell, guard).await,
                            _ => lifecycle.resume(cell, guard).await,
                        }
                    }
                }),
        )
        .await;

        if let Some(err) = results.into_iter().find_map(|r| r.err()) {
            warn!("Solution {} failed to move to {:?}: {}", id, target, err);
            entry.state = SolutionState::Error;
            return Err(err);
        }
        entry.state = target;
        info!("Solution {} is now {:?}", id, target);
        Ok(entry.snapshot())
    }

    /// Current view of a solution. In-flight assemblies report `Assembling`.
    pub async fn status(&self, id: SolutionId) -> Result<Solution> {
        let entry = match self.entry(id) {
            Ok(entry) => entry,
            Err(e) => {
                let retired = self.inner.retired.read().get(&id).map(|t| t.solution());
                return retired.ok_or(e);
            }
        };
        if let Ok(entry) = entry.try_lock() {
            return Ok(entry.snapshot());
        }
        let placeholder = self.inner.in_flight.read().get(&id).map(|flight| Solution {
            id,
            state: SolutionState::Assembling,
            cells: Vec::new(),
            connections: Vec::new(),
            resource_usage: ResourceBudget::ZERO,
            quantum_signature: flight.signature.clone(),
            created_at: flight.created_at,
            assembly_time_ms: None,
        });
        if let Some(solution) = placeholder {
            return Ok(solution);
        }
        let entry = entry.lock().await;
        Ok(entry.snapshot())
    }

    /// Swap a finished entry for its tombstone. The tombstone goes in first
    /// so lookups never miss the solution in between.
    fn retire(&self, entry: &SolutionEntry) {
        self.inner.retired.write().insert(entry.tombstone());
        self.inner.solutions.write().remove(&entry.id);
    }

    /// Solutions still holding cells or still assembling.
    pub fn solution_ids(&self) -> Vec<SolutionId> {
        self.inner.solutions.read().keys().copied().collect()
    }

    pub fn assembler_status(&self) -> AssemblerStatus {
        let inner = &self.inner;
        AssemblerStatus {
            assembler_id: inner.assembler_id.clone(),
            uptime_secs: inner.started_at.elapsed().as_secs(),
            active_solutions: inner.active_solutions.load(Ordering::Relaxed),
            in_flight: inner.in_flight.read().len(),
            total_assemblies: inner.total_assemblies.load(Ordering::Relaxed),
            failed_assemblies: inner.failed_assemblies.load(Ordering::Relaxed),
            total_cells_requested: inner.cells_requested.load(Ordering::Relaxed),
            committed: inner.allocator.committed(),
            capacity: inner.allocator.capacity(),
            providers: inner.registry.provider_ids(),
        }
    }

    // ---------------------------------------------------------------
    // Trail writes (fire-and-forget)
    // ---------------------------------------------------------------

    fn spawn_record(&self, solution: &Solution, context: &AssemblyContext) -> JoinHandle<()> {
        let record = AssemblyRecord {
            signature: solution.quantum_signature.clone(),
            solution_id: solution.id,
            capabilities: solution.cells.iter().map(|c| c.capability.clone()).collect(),
            cell_ids: solution.cells.iter().map(|c| c.id).collect(),
            cells: solution
                .cells
                .iter()
                .map(|c| CellSpec {
                    capability: c.capability.clone(),
                    provider: c.provider.clone(),
                    version: c.version.clone(),
                })
                .collect(),
            connection_pattern: capability_pattern(solution),
            context: context.digest(),
            metrics: PerformanceMetrics {
                assembly_time_ms: solution.assembly_time_ms,
                total_usage_time_ms: None,
                memory_mb: Some(solution.resource_usage.memory_mb),
                cpu_percent: Some(solution.resource_usage.cpu_percent),
            },
        };

        let trail = self.inner.trail.clone();
        let limit = self.inner.timeouts.trail();
        tokio::spawn(async move {
            match tokio::time::timeout(limit, trail.record_assembly(record)).await {
                Ok(Ok(record_id)) => debug!("Trail record {} written", record_id),
                Ok(Err(e)) => warn!("Trail record failed (ignored): {}", e),
                Err(_) => warn!("Trail record timed out after {}ms (ignored)", limit.as_millis()),
            }
        })
    }

    fn spawn_update(&self, update: RecordUpdate, record_task: Option<JoinHandle<()>>) {
        let trail = self.inner.trail.clone();
        let limit = self.inner.timeouts.trail();
        tokio::spawn(async move {
            if let Some(task) = record_task {
                let _ = task.await;
            }
            match tokio::time::timeout(limit, trail.update_record(update)).await {
                Ok(Ok(())) => debug!("Trail record updated"),
                Ok(Err(e)) => warn!("Trail update failed (ignored): {}", e),
                Err(_) => warn!("Trail update timed out after {}ms (ignored)", limit.as_millis()),
            }
        });
    }
}

fn validate_requirements(requirements: &[CapabilityRequirement]) -> Result<()> {
    if requirements.is_empty() {
        return Err(Error::InvalidRequest("no capabilities requested".into()));
    }
    let mut seen = HashSet::new();
    for req in requirements {
        if req.name.trim().is_empty() {
            return Err(Error::InvalidRequest("empty capability name".into()));
        }
        if !seen.insert(req.name.as_str()) {
            return Err(Error::InvalidRequest(format!("capability {} requested twice", req.name)));
        }
        req.version_req()?;
    }
    Ok(())
}

/// Resolve a capability-level pattern to cell ids.
///
/// With `strict`, a capability outside this assembly is a wiring error;
/// otherwise (trail patterns) such links are skipped.
fn connection_map(pattern: &ConnectionPattern, cells: &[ManagedCell], strict: bool) -> Result<ConnectionMap> {
    let by_capability: HashMap<&str, qcc_core::CellId> = cells
        .iter()
        .map(|c| (c.instance.capability.as_str(), c.instance.id))
        .collect();

    let mut map = ConnectionMap::new();
    for (source, targets) in pattern {
        for target in targets {
            match (by_capability.get(source.as_str()), by_capability.get(target.as_str())) {
                (Some(&s), Some(&t)) => {
                    let links = map.entry(s).or_default();
                    if !links.contains(&t) {
                        links.push(t);
                    }
                }
                _ if strict => {
                    return Err(Error::Wiring {
                        source_cell: source.clone(),
                        target_cell: target.clone(),
                        reason: "capability is not part of this assembly".into(),
                    });
                }
                _ => debug!("Skipping trail link {} -> {}", source, target),
            }
        }
    }
    Ok(map)
}

/// The solution's connections expressed between capabilities.
fn capability_pattern(solution: &Solution) -> ConnectionPattern {
    let mut pattern = ConnectionPattern::new();
    for conn in &solution.connections {
        let (Some(source), Some(target)) = (solution.cell(conn.source), solution.cell(conn.target)) else {
            continue;
        };
        let targets = pattern.entry(source.capability.clone()).or_default();
        if !targets.contains(&target.capability) {
            targets.push(target.capability.clone());
        }
    }
    pattern
}
