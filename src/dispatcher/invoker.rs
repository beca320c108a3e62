use std::sync::Arc;

use async_trait::async_trait;

use crate::capability::{CapabilitySet, NODE_COUNT};
use crate::container::{CalculationNodeContainer, JobInvocationReceiver};
use crate::job::{CalculationJob, CalculationJobSpec};

/// Uniform handle the dispatcher uses to submit work, independent of whether
/// the nodes sit in this process or behind a connection.
#[async_trait]
pub trait JobInvoker: Send + Sync {
    /// Stable identifier, used for retry exclusion. `None` once the invoker
    /// is permanently retired (e.g. its connection is gone); retired
    /// invokers are dropped from the rotation on sight.
    fn invoker_id(&self) -> Option<String>;

    fn capabilities(&self) -> CapabilitySet;

    /// Submits a job and its tail for execution. Returns false if the
    /// invoker is at capacity, in which case nothing was submitted and the
    /// dispatcher must not route further work here until the invoker calls
    /// back through the register passed to
    /// [`JobInvoker::notify_when_available`].
    async fn invoke(&self, job: &CalculationJob, receiver: Arc<dyn JobInvocationReceiver>) -> bool;

    async fn cancel(&self, jobs: &[CalculationJobSpec]);

    /// Best-effort liveness check; true means every given job is believed to
    /// still be executing.
    async fn is_alive(&self, jobs: &[CalculationJobSpec]) -> bool;

    /// Asks to be re-registered once capacity frees up. Returns true if
    /// capacity is already available, in which case the callback is not
    /// retained and the caller keeps the invoker in its rotation.
    fn notify_when_available(&self, register: Arc<dyn JobInvokerRegister>) -> bool;
}

/// Callback through which an invoker re-enters the dispatcher's rotation.
pub trait JobInvokerRegister: Send + Sync {
    fn register_job_invoker(&self, invoker: Arc<dyn JobInvoker>);
}

/// Invoker backed by a container in the same process. The container queues
/// runnable jobs itself, so invocation is never refused.
pub struct LocalNodeJobInvoker {
    container: Arc<CalculationNodeContainer>,
    invoker_id: String,
    capabilities: CapabilitySet,
}

impl LocalNodeJobInvoker {
    pub fn new(container: Arc<CalculationNodeContainer>, invoker_id: impl Into<String>) -> Self {
        let capabilities = CapabilitySet::new().with(NODE_COUNT, container.node_count() as f64);
        Self {
            container,
            invoker_id: invoker_id.into(),
            capabilities,
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }
}

#[async_trait]
impl JobInvoker for LocalNodeJobInvoker {
    fn invoker_id(&self) -> Option<String> {
        Some(self.invoker_id.clone())
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    async fn invoke(&self, job: &CalculationJob, receiver: Arc<dyn JobInvocationReceiver>) -> bool {
        self.container.add_job_tree(job, receiver);
        true
    }

    async fn cancel(&self, jobs: &[CalculationJobSpec]) {
        for spec in jobs {
            self.container.cancel(spec);
        }
    }

    async fn is_alive(&self, jobs: &[CalculationJobSpec]) -> bool {
        jobs.iter().all(|spec| self.container.is_alive(spec))
    }

    fn notify_when_available(&self, _register: Arc<dyn JobInvokerRegister>) -> bool {
        true
    }
}
