use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::blacklist::{BlacklistMaintainer, DiscardingBlacklistMaintainer};
use crate::capability::{CapabilityRequirementsProvider, NoRequirements};
use crate::config::DispatcherConfig;
use crate::dispatcher::dispatchable::{DispatchReceiver, DispatchableJob};
use crate::dispatcher::invoker::{JobInvoker, JobInvokerRegister};
use crate::dispatcher::JobResultReceiver;
use crate::job::{CalculationJob, CalculationJobSpec};

/// Routes jobs to capability-matching invokers, retries failures and reports
/// each root/tail outcome to the caller exactly once. Clones share the same
/// dispatcher.
pub struct JobDispatcher {
    core: Arc<DispatcherCore>,
}

impl Clone for JobDispatcher {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl JobDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(NoRequirements),
            Arc::new(DiscardingBlacklistMaintainer),
        )
    }

    pub fn with_collaborators(
        config: DispatcherConfig,
        requirements: Arc<dyn CapabilityRequirementsProvider>,
        blacklist: Arc<dyn BlacklistMaintainer>,
    ) -> Self {
        Self {
            core: Arc::new(DispatcherCore {
                config,
                requirements,
                blacklist,
                invokers: tokio::sync::Mutex::new(VecDeque::new()),
                pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Adds an invoker to the rotation and retries anything pending.
    pub async fn register_job_invoker(&self, invoker: Arc<dyn JobInvoker>) {
        tracing::info!(
            invoker = invoker.invoker_id().as_deref().unwrap_or("-"),
            "Registering job invoker"
        );
        self.core.register_invoker(invoker).await;
    }

    /// Dispatches a job tree. The receiver is called exactly once for the
    /// root and once for every tail job, with either a real result or a
    /// dispatcher-synthesized abort result. The returned handle cancels the
    /// whole tree.
    pub async fn dispatch(
        &self,
        job: CalculationJob,
        receiver: Arc<dyn JobResultReceiver>,
    ) -> DispatchHandle {
        let djob = DispatchableJob::new(self.core.clone(), job, receiver);
        self.core.clone().dispatch_dispatchable(djob.clone()).await;
        DispatchHandle { job: djob }
    }

    /// Number of jobs waiting for an invoker.
    pub fn pending_jobs(&self) -> usize {
        self.core.pending.lock().expect("dispatcher poisoned").len()
    }

    /// The register handle invokers call back through when capacity frees.
    pub fn register_handle(&self) -> Arc<dyn JobInvokerRegister> {
        Arc::new(CoreRegister(self.core.clone()))
    }
}

/// Cancellation handle for one dispatched job tree.
pub struct DispatchHandle {
    job: Arc<DispatchableJob>,
}

impl DispatchHandle {
    pub fn spec(&self) -> &CalculationJobSpec {
        &self.job.job().spec
    }

    /// Cancels the job tree. Idempotent; false when the job already reached
    /// a terminal state (including a previous cancel).
    pub async fn cancel(&self) -> bool {
        self.job.cancel().await
    }

    /// True once the job reached any terminal state.
    pub fn is_terminal(&self) -> bool {
        self.job.is_terminal()
    }
}

pub(crate) struct DispatcherCore {
    config: DispatcherConfig,
    requirements: Arc<dyn CapabilityRequirementsProvider>,
    blacklist: Arc<dyn BlacklistMaintainer>,
    /// Active rotation. The scan pops from the front and pushes accepting
    /// invokers to the back for round-robin fairness.
    invokers: tokio::sync::Mutex<VecDeque<Arc<dyn JobInvoker>>>,
    pending: Mutex<VecDeque<Arc<DispatchableJob>>>,
}

impl DispatcherCore {
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn blacklist(&self) -> &dyn BlacklistMaintainer {
        self.blacklist.as_ref()
    }

    pub async fn register_invoker(self: &Arc<Self>, invoker: Arc<dyn JobInvoker>) {
        self.invokers.lock().await.push_back(invoker);
        self.retry_pending().await;
    }

    async fn retry_pending(self: &Arc<Self>) {
        let pending: Vec<Arc<DispatchableJob>> = {
            let mut pending = self.pending.lock().expect("dispatcher poisoned");
            pending.drain(..).collect()
        };
        for djob in pending {
            self.clone().dispatch_dispatchable(djob).await;
        }
    }

    /// One scan over the rotation: skip invokers excluded for this job or
    /// with unsatisfied capabilities, take the first acceptor, rotate it to
    /// the back and arm its timeout. Refusing invokers leave the rotation
    /// until they call back through the register. The second pass
    /// reconsiders excluded invokers so a lone invoker can host a retry; a
    /// second failure there aborts the job deterministically.
    pub async fn dispatch_dispatchable(self: Arc<Self>, djob: Arc<DispatchableJob>) {
        if djob.is_terminal() {
            return;
        }
        let requirements = self.requirements.requirements(djob.job());
        let excluded = djob.excluded_snapshot();
        let mut invokers = self.invokers.lock().await;
        for pass in 0..2 {
            if pass == 1 && excluded.is_empty() {
                break;
            }
            let mut remaining = invokers.len();
            while remaining > 0 {
                remaining -= 1;
                let Some(invoker) = invokers.pop_front() else {
                    break;
                };
                let Some(invoker_id) = invoker.invoker_id() else {
                    tracing::info!("Dropping retired invoker from the rotation");
                    continue;
                };
                if pass == 0 && excluded.contains(&invoker_id) {
                    invokers.push_back(invoker);
                    continue;
                }
                if !requirements.satisfied_by(&invoker.capabilities()) {
                    invokers.push_back(invoker);
                    continue;
                }
                let seq = djob.begin_attempt(invoker.clone());
                if invoker
                    .invoke(djob.job(), Arc::new(DispatchReceiver(djob.clone())))
                    .await
                {
                    djob.start_timeout(seq, invoker.clone());
                    invokers.push_back(invoker);
                    tracing::debug!(
                        job = %djob.job().spec,
                        invoker = %invoker_id,
                        "Job dispatched"
                    );
                    return;
                }
                djob.rollback_attempt();
                tracing::debug!(
                    invoker = %invoker_id,
                    "Invoker at capacity, removed from rotation until available"
                );
                if invoker.notify_when_available(Arc::new(CoreRegister(self.clone()))) {
                    invokers.push_back(invoker);
                }
            }
        }
        // Queue while still holding the registry lock so a concurrent
        // registration cannot drain the pending queue between the failed
        // scan and this push.
        self.pending
            .lock()
            .expect("dispatcher poisoned")
            .push_back(djob.clone());
        drop(invokers);
        tracing::debug!(job = %djob.job().spec, "No invoker accepted the job, queued pending");
    }
}

/// [`JobInvokerRegister`] implementation handed to invokers; re-registration
/// is spawned so an invoker may call it from any context.
struct CoreRegister(Arc<DispatcherCore>);

impl JobInvokerRegister for CoreRegister {
    fn register_job_invoker(&self, invoker: Arc<dyn JobInvoker>) {
        let core = self.0.clone();
        tokio::spawn(async move {
            core.register_invoker(invoker).await;
        });
    }
}
