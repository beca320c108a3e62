//! Function repository collaborator.
//!
//! Domain logic lives behind [`FunctionInvoker`]: given resolved inputs and a
//! target, produce named output values. The dispatch core looks functions up
//! by unique identifier and treats an unknown identifier as a deployment
//! error (version skew between dispatcher and node host), never retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::values::{ComputedValue, TargetSpec, ValueSpec};

/// Context one invocation runs in.
#[derive(Debug, Clone)]
pub struct FunctionContext {
    pub calc_config: String,
    pub valuation_time: DateTime<Utc>,
    /// Opaque per-item parameters from the job item.
    pub parameters: serde_json::Value,
}

/// Inputs gathered from the value cache for one invocation.
#[derive(Debug, Clone, Default)]
pub struct FunctionInputs {
    pub values: Vec<ComputedValue>,
    /// Declared inputs that were absent from the cache. Only populated for
    /// invokers that tolerate missing inputs; otherwise the item fails
    /// before invocation.
    pub missing: Vec<ValueSpec>,
}

impl FunctionInputs {
    pub fn value(&self, spec: &ValueSpec) -> Option<&crate::values::CalcValue> {
        self.values
            .iter()
            .find(|v| &v.spec == spec)
            .map(|v| &v.value)
    }
}

/// Failure raised by domain logic. The class name travels into the per-item
/// result so callers can distinguish failure modes.
#[derive(Debug, Clone)]
pub struct FunctionError {
    pub class: String,
    pub message: String,
}

impl FunctionError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FunctionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for FunctionError {}

#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    /// Whether the function can run with some declared inputs absent.
    fn can_handle_missing_inputs(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        context: &FunctionContext,
        inputs: &FunctionInputs,
        target: &TargetSpec,
        desired_outputs: &[ValueSpec],
    ) -> Result<Vec<ComputedValue>, FunctionError>;
}

/// Resolves function identifiers to invokers. Implementations must be safe
/// for concurrent use by all nodes of a container.
pub trait FunctionRepository: Send + Sync {
    fn invoker(&self, function_id: &str) -> Option<Arc<dyn FunctionInvoker>>;

    /// Version identifier of the currently loaded function set. The remote
    /// handshake compares this against the dispatcher's expectation.
    fn init_id(&self) -> u64;

    /// Re-initializes to the given version. Called when the dispatcher's
    /// `Init` message carries a different identifier than [`Self::init_id`].
    fn reinitialize(&self, init_id: u64);
}

/// Invoker wrapping a plain closure. Used by tests and the demo functions.
pub struct ClosureInvoker<F> {
    function: F,
    handles_missing: bool,
}

impl<F> ClosureInvoker<F>
where
    F: Fn(
            &FunctionContext,
            &FunctionInputs,
            &TargetSpec,
            &[ValueSpec],
        ) -> Result<Vec<ComputedValue>, FunctionError>
        + Send
        + Sync,
{
    pub fn new(function: F) -> Self {
        Self {
            function,
            handles_missing: false,
        }
    }

    pub fn handling_missing_inputs(mut self) -> Self {
        self.handles_missing = true;
        self
    }
}

#[async_trait]
impl<F> FunctionInvoker for ClosureInvoker<F>
where
    F: Fn(
            &FunctionContext,
            &FunctionInputs,
            &TargetSpec,
            &[ValueSpec],
        ) -> Result<Vec<ComputedValue>, FunctionError>
        + Send
        + Sync,
{
    fn can_handle_missing_inputs(&self) -> bool {
        self.handles_missing
    }

    async fn execute(
        &self,
        context: &FunctionContext,
        inputs: &FunctionInputs,
        target: &TargetSpec,
        desired_outputs: &[ValueSpec],
    ) -> Result<Vec<ComputedValue>, FunctionError> {
        (self.function)(context, inputs, target, desired_outputs)
    }
}

/// Repository backed by a map, registered at process start-up.
#[derive(Default)]
pub struct InMemoryFunctionRepository {
    functions: RwLock<HashMap<String, Arc<dyn FunctionInvoker>>>,
    init_id: AtomicU64,
}

impl InMemoryFunctionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, function_id: impl Into<String>, invoker: Arc<dyn FunctionInvoker>) {
        self.functions
            .write()
            .expect("function repository poisoned")
            .insert(function_id.into(), invoker);
    }
}

impl FunctionRepository for InMemoryFunctionRepository {
    fn invoker(&self, function_id: &str) -> Option<Arc<dyn FunctionInvoker>> {
        self.functions
            .read()
            .expect("function repository poisoned")
            .get(function_id)
            .cloned()
    }

    fn init_id(&self) -> u64 {
        self.init_id.load(Ordering::SeqCst)
    }

    fn reinitialize(&self, init_id: u64) {
        tracing::info!(init_id, "Reinitializing function repository");
        self.init_id.store(init_id, Ordering::SeqCst);
    }
}
