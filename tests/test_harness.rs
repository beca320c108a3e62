//! Test harness for dispatcher/container integration tests.
//!
//! Provides a single-process grid (cache + functions + container +
//! dispatcher), scripted invokers for dispatcher behaviour tests, and
//! wait/assert helpers.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use calcgrid::cache::InMemoryCacheSource;
use calcgrid::capability::CapabilitySet;
use calcgrid::config::{ContainerConfig, DispatcherConfig};
use calcgrid::container::{CalculationNodeContainer, JobInvocationReceiver};
use calcgrid::dispatcher::{
    JobDispatcher, JobInvoker, JobInvokerRegister, JobResultReceiver, LocalNodeJobInvoker,
};
use calcgrid::function::{
    ClosureInvoker, FunctionContext, FunctionError, FunctionInputs, FunctionInvoker,
    InMemoryFunctionRepository,
};
use calcgrid::job::{
    CalculationJob, CalculationJobItem, CalculationJobResult, CalculationJobResultItem,
    CalculationJobSpec,
};
use calcgrid::node::{create_node_id, CalculationNode};
use calcgrid::values::{ComputedValue, TargetKind, TargetSpec, ValueSpec};

/// Job spec in a fresh cycle; only the job id matters for dependencies.
pub fn job_spec(job_id: u64) -> CalculationJobSpec {
    CalculationJobSpec::new(Uuid::new_v4(), "Default", Utc::now(), job_id)
}

pub fn target(id: &str) -> TargetSpec {
    TargetSpec::new(TargetKind::Position, id)
}

pub fn vspec(name: &str, function_id: &str) -> ValueSpec {
    ValueSpec::new(name, target("P1"), function_id)
}

/// One-item job producing `output` from `inputs` via `function_id`.
pub fn one_item_job(
    spec: CalculationJobSpec,
    function_id: &str,
    inputs: Vec<ValueSpec>,
    output: ValueSpec,
) -> CalculationJob {
    let item = CalculationJobItem::new(
        function_id,
        serde_json::Value::Null,
        target("P1"),
        inputs,
        vec![output],
    );
    CalculationJob::new(spec, vec![item])
}

/// Registers a function writing `json!(42.0)` to every requested output.
pub fn register_constant(functions: &InMemoryFunctionRepository, function_id: &str) {
    functions.register(
        function_id,
        Arc::new(ClosureInvoker::new(|_ctx, _inputs, _target, outputs| {
            Ok(outputs
                .iter()
                .map(|spec| ComputedValue::data(spec.clone(), serde_json::json!(42.0)))
                .collect())
        })),
    );
}

/// Registers a function that always throws.
pub fn register_failing(functions: &InMemoryFunctionRepository, function_id: &str) {
    functions.register(
        function_id,
        Arc::new(ClosureInvoker::new(|_ctx, _inputs, _target, _outputs| {
            Err(FunctionError::new("SimulatedError", "induced failure"))
        })),
    );
}

/// Function that sleeps before producing outputs; used for concurrency,
/// watchdog and cancellation tests.
pub struct SleepingInvoker {
    pub delay: Duration,
}

#[async_trait]
impl FunctionInvoker for SleepingInvoker {
    async fn execute(
        &self,
        _context: &FunctionContext,
        _inputs: &FunctionInputs,
        _target: &TargetSpec,
        desired_outputs: &[ValueSpec],
    ) -> Result<Vec<ComputedValue>, FunctionError> {
        tokio::time::sleep(self.delay).await;
        Ok(desired_outputs
            .iter()
            .map(|spec| ComputedValue::data(spec.clone(), serde_json::json!(1.0)))
            .collect())
    }
}

/// Job that fails at the job level: its item's output keys arrive as
/// unresolved numeric identifiers, which the node rejects before running
/// anything.
pub fn job_level_failing_job(spec: CalculationJobSpec) -> CalculationJob {
    let mut item = CalculationJobItem::new(
        "fn-any",
        serde_json::Value::Null,
        target("P1"),
        vec![],
        vec![],
    );
    item.outputs = calcgrid::job::ValueIdents::Ids(vec![7]);
    CalculationJob::new(spec, vec![item])
}

/// Result receiver that collects everything it is given.
#[derive(Default)]
pub struct CollectingReceiver {
    results: Mutex<Vec<CalculationJobResult>>,
}

impl CollectingReceiver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub fn results(&self) -> Vec<CalculationJobResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn result_for(&self, job_id: u64) -> Option<CalculationJobResult> {
        self.results
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.spec.job_id == job_id)
            .cloned()
    }
}

impl JobResultReceiver for CollectingReceiver {
    fn result_received(&self, result: CalculationJobResult) {
        self.results.lock().unwrap().push(result);
    }
}

/// Invocation receiver (container-level callback) that collects outcomes.
#[derive(Default)]
pub struct CollectingInvocationReceiver {
    pub completed: Mutex<Vec<CalculationJobResult>>,
    pub failed: Mutex<Vec<(u64, String)>>,
}

impl CollectingInvocationReceiver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn completed_count(&self) -> usize {
        self.completed.lock().unwrap().len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.lock().unwrap().len()
    }
}

impl JobInvocationReceiver for CollectingInvocationReceiver {
    fn job_completed(&self, result: CalculationJobResult) {
        self.completed.lock().unwrap().push(result);
    }

    fn job_failed(&self, job: &CalculationJob, _node_id: &str, error: &str) {
        self.failed
            .lock()
            .unwrap()
            .push((job.spec.job_id, error.to_string()));
    }
}

/// A dispatcher wired to a local container, everything in-process.
pub struct LocalGrid {
    pub cache_source: Arc<InMemoryCacheSource>,
    pub functions: Arc<InMemoryFunctionRepository>,
    pub container: Arc<CalculationNodeContainer>,
    pub dispatcher: JobDispatcher,
}

pub async fn local_grid(node_count: usize, config: DispatcherConfig) -> LocalGrid {
    let cache_source = Arc::new(InMemoryCacheSource::new());
    let functions = Arc::new(InMemoryFunctionRepository::new());
    let nodes = (0..node_count)
        .map(|_| CalculationNode::new(create_node_id(), cache_source.clone(), functions.clone()))
        .collect();
    let container = CalculationNodeContainer::new(
        nodes,
        ContainerConfig::default().with_node_count(node_count),
    );
    let dispatcher = JobDispatcher::new(config);
    dispatcher
        .register_job_invoker(Arc::new(LocalNodeJobInvoker::new(
            container.clone(),
            "local",
        )))
        .await;
    LocalGrid {
        cache_source,
        functions,
        container,
        dispatcher,
    }
}

/// Builds a bare container (no dispatcher) over the given collaborators.
pub fn container_with(
    node_count: usize,
    cache_source: Arc<InMemoryCacheSource>,
    functions: Arc<InMemoryFunctionRepository>,
    config: ContainerConfig,
) -> Arc<CalculationNodeContainer> {
    let nodes = (0..node_count)
        .map(|_| CalculationNode::new(create_node_id(), cache_source.clone(), functions.clone()))
        .collect();
    CalculationNodeContainer::new(nodes, config)
}

/// Invoker with scripted behaviour: fails the first `fail_first` invocations
/// at the job level, then completes jobs synthetically.
pub struct ScriptedInvoker {
    id: String,
    capabilities: CapabilitySet,
    fail_first: AtomicUsize,
    invocations: AtomicUsize,
    refuse: AtomicUsize,
    stored_register: Mutex<Option<Arc<dyn JobInvokerRegister>>>,
}

impl ScriptedInvoker {
    pub fn new(id: &str) -> Arc<Self> {
        Self::with_capabilities(id, CapabilitySet::new())
    }

    pub fn with_capabilities(id: &str, capabilities: CapabilitySet) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            capabilities,
            fail_first: AtomicUsize::new(0),
            invocations: AtomicUsize::new(0),
            refuse: AtomicUsize::new(0),
            stored_register: Mutex::new(None),
        })
    }

    /// Fail the next `n` invocations at the job level.
    pub fn fail_next(&self, n: usize) {
        self.fail_first.store(n, Ordering::SeqCst);
    }

    /// Refuse the next `n` invocations (at capacity).
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Fires the availability callback stored by `notify_when_available`.
    pub fn announce_available(&self, invoker: Arc<dyn JobInvoker>) {
        if let Some(register) = self.stored_register.lock().unwrap().take() {
            register.register_job_invoker(invoker);
        }
    }

    pub fn has_stored_register(&self) -> bool {
        self.stored_register.lock().unwrap().is_some()
    }
}

#[async_trait]
impl JobInvoker for ScriptedInvoker {
    fn invoker_id(&self) -> Option<String> {
        Some(self.id.clone())
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    async fn invoke(&self, job: &CalculationJob, receiver: Arc<dyn JobInvocationReceiver>) -> bool {
        if self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return false;
        }
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            receiver.job_failed(job, &self.id, "induced failure");
            return true;
        }
        for entry in job.flatten() {
            let items = vec![CalculationJobResultItem::success(); entry.items.len()];
            receiver.job_completed(CalculationJobResult::new(
                entry.spec.clone(),
                Duration::from_millis(1),
                items,
                &self.id,
            ));
        }
        true
    }

    async fn cancel(&self, _jobs: &[CalculationJobSpec]) {}

    async fn is_alive(&self, _jobs: &[CalculationJobSpec]) -> bool {
        true
    }

    fn notify_when_available(&self, register: Arc<dyn JobInvokerRegister>) -> bool {
        if self.refuse.load(Ordering::SeqCst) == 0 {
            return true;
        }
        *self.stored_register.lock().unwrap() = Some(register);
        false
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
