//! In-process providers, cells and trails for assembler tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use qcc_core::{
    CellId, ConnectionType, ContextDigest, Error, QccConfig, ResourceBudget, Result, TimeoutConfig,
};
use qcc_provider::{
    Candidate, CapabilityProvider, CellBinder, CellControl, CellDescriptor, CellRequest, Handshake,
    InterfaceSpec, ProviderResponse, RegistryClient, SignatureGate,
};
use qcc_runtime::{Assembler, Components};
use qcc_trail::{AssemblyRecord, ConfigurationHint, RecordUpdate, TrailClient, TrailRecord};
use serde_json::{json, Value};

pub const MB_PER_CELL: u64 = 100;

pub fn budget(memory_mb: u64) -> ResourceBudget {
    ResourceBudget::new(memory_mb, 10, 10, 0)
}

pub fn files() -> InterfaceSpec {
    InterfaceSpec::new("files", ConnectionType::Message)
}

// ---------------------------------------------------------------
// Providers
// ---------------------------------------------------------------

#[derive(Clone)]
pub struct Offer {
    pub capability: String,
    pub version: String,
    pub resources: ResourceBudget,
    pub requires: Vec<InterfaceSpec>,
    pub provides: Vec<InterfaceSpec>,
}

impl Offer {
    pub fn new(capability: &str) -> Self {
        Self {
            capability: capability.to_string(),
            version: "1.0.0".into(),
            resources: budget(MB_PER_CELL),
            requires: Vec::new(),
            provides: Vec::new(),
        }
    }

    pub fn memory(mut self, memory_mb: u64) -> Self {
        self.resources = budget(memory_mb);
        self
    }

    pub fn requires(mut self, spec: InterfaceSpec) -> Self {
        self.requires.push(spec);
        self
    }

    pub fn provides(mut self, spec: InterfaceSpec) -> Self {
        self.provides.push(spec);
        self
    }
}

/// Delivers signed descriptors for its offers; `tampered` breaks every signature.
pub struct FakeProvider {
    id: String,
    offers: Vec<Offer>,
    tampered: bool,
    calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            offers: Vec::new(),
            tampered: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn offer(mut self, offer: Offer) -> Self {
        self.offers.push(offer);
        self
    }

    pub fn tampered(mut self) -> Self {
        self.tampered = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityProvider for FakeProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn request_cell(&self, request: &CellRequest) -> Result<ProviderResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(offer) = self.offers.iter().find(|o| o.capability == request.capability) else {
            return Ok(ProviderResponse::not_found(request.request_id.clone()));
        };

        let mut cell = CellDescriptor {
            cell_id: format!("{}-{}-{}", self.id, offer.capability, n),
            signature: String::new(),
            download_url: format!("https://{}.test/cells/{}", self.id, offer.capability),
            capabilities: vec![offer.capability.clone()],
            dependencies: Vec::new(),
            version: offer.version.clone(),
            provider: self.id.clone(),
            resources: Some(offer.resources),
            requires: offer.requires.clone(),
            provides: offer.provides.clone(),
            control_url: None,
        }
        .signed();
        if self.tampered {
            cell.signature = format!("qc{}", "0".repeat(64));
        }
        Ok(ProviderResponse::success(request.request_id.clone(), cell))
    }
}

// ---------------------------------------------------------------
// Cells
// ---------------------------------------------------------------

/// How cells from one provider behave.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Control method that returns an error.
    pub fail_on: Option<&'static str>,
    /// Control method that sleeps before answering.
    pub slow_on: Option<&'static str>,
    pub delay: Duration,
}

impl Behavior {
    pub fn failing(method: &'static str) -> Self {
        Self {
            fail_on: Some(method),
            ..Self::default()
        }
    }

    pub fn slow(method: &'static str, delay: Duration) -> Self {
        Self {
            slow_on: Some(method),
            delay,
            ..Self::default()
        }
    }
}

pub struct FakeControl {
    pub id: CellId,
    pub provider: String,
    pub capability: String,
    behavior: Behavior,
    calls: Mutex<Vec<String>>,
}

impl FakeControl {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn called(&self, method: &str) -> bool {
        self.calls.lock().iter().any(|c| c.starts_with(method))
    }

    async fn step(&self, call: String) -> Result<()> {
        let method = call.split(':').next().unwrap_or_default().to_string();
        if self.behavior.slow_on == Some(method.as_str()) {
            tokio::time::sleep(self.behavior.delay).await;
        }
        self.calls.lock().push(call);
        if self.behavior.fail_on == Some(method.as_str()) {
            return Err(Error::Control {
                code: "cell_error".into(),
                message: format!("{} refused", method),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CellControl for FakeControl {
    async fn initialize(&self, _params: &Value) -> Result<()> {
        self.step("initialize".into()).await
    }
    async fn configure(&self, _config: &Value) -> Result<()> {
        self.step("configure".into()).await
    }
    async fn connect_to(&self, hs: &Handshake) -> Result<()> {
        self.step(format!("connectTo:{:?}:{}", hs.role, hs.interface)).await
    }
    async fn activate(&self) -> Result<()> {
        self.step("activate".into()).await
    }
    async fn suspend(&self) -> Result<Value> {
        self.step("suspend".into()).await?;
        Ok(json!({ "cursor": 42 }))
    }
    async fn resume(&self, snapshot: &Value) -> Result<()> {
        self.step(format!("resume:{}", snapshot)).await
    }
    async fn deactivate(&self) -> Result<()> {
        self.step("deactivate".into()).await
    }
    async fn release(&self) -> Result<()> {
        self.step("release".into()).await
    }
}

/// Hands out [`FakeControl`]s and keeps every one it created.
#[derive(Default)]
pub struct FakeBinder {
    behaviors: HashMap<String, Behavior>,
    bound: Mutex<Vec<Arc<FakeControl>>>,
}

impl FakeBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behavior for every cell delivered by `provider`.
    pub fn with(mut self, provider: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(provider.to_string(), behavior);
        self
    }

    pub fn bound(&self) -> Vec<Arc<FakeControl>> {
        self.bound.lock().clone()
    }

    pub fn control(&self, id: CellId) -> Option<Arc<FakeControl>> {
        self.bound.lock().iter().find(|c| c.id == id).cloned()
    }

    pub fn from_provider(&self, provider: &str) -> Vec<Arc<FakeControl>> {
        self.bound
            .lock()
            .iter()
            .filter(|c| c.provider == provider)
            .cloned()
            .collect()
    }
}

impl CellBinder for FakeBinder {
    fn bind(&self, id: CellId, candidate: &Candidate) -> Result<Arc<dyn CellControl>> {
        let control = Arc::new(FakeControl {
            id,
            provider: candidate.provider.clone(),
            capability: candidate.capability.clone(),
            behavior: self.behaviors.get(&candidate.provider).cloned().unwrap_or_default(),
            calls: Mutex::new(Vec::new()),
        });
        self.bound.lock().push(control.clone());
        Ok(control)
    }
}

// ---------------------------------------------------------------
// Trails
// ---------------------------------------------------------------

/// A ledger that is never reachable.
#[derive(Default)]
pub struct UnreachableTrail {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TrailClient for UnreachableTrail {
    async fn find_similar(
        &self,
        _capabilities: &BTreeSet<String>,
        _context: &ContextDigest,
        _min_similarity: f64,
    ) -> Result<Vec<ConfigurationHint>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Ledger("connection refused".into()))
    }

    async fn record_assembly(&self, _record: AssemblyRecord) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Ledger("connection refused".into()))
    }

    async fn update_record(&self, _update: RecordUpdate) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Ledger("connection refused".into()))
    }

    async fn history(&self, _signature: &str) -> Result<Vec<TrailRecord>> {
        Err(Error::Ledger("connection refused".into()))
    }
}

// ---------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------

pub fn config() -> QccConfig {
    QccConfig {
        timeouts: TimeoutConfig {
            request_ms: 500,
            transition_ms: 1_000,
            handshake_ms: 500,
            trail_ms: 500,
            assembly_deadline_ms: 5_000,
        },
        ..QccConfig::default()
    }
}

pub fn assembler(
    config: &QccConfig,
    providers: Vec<Arc<dyn CapabilityProvider>>,
    binder: Arc<FakeBinder>,
    trail: Arc<dyn TrailClient>,
    capacity: ResourceBudget,
) -> Assembler {
    let components = Components {
        registry: RegistryClient::new(providers, config.timeouts.request()),
        verifier: Arc::new(SignatureGate::new(Vec::<String>::new())),
        binder,
        trail,
    };
    Assembler::new(config, capacity, components)
}

/// Wait until `check` holds, polling for up to two seconds.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
