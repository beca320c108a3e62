use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::ContainerConfig;
use crate::container::execution::{BlockOutcome, JobExecution};
use crate::container::JobInvocationReceiver;
use crate::job::{CalculationJob, CalculationJobSpec};
use crate::node::CalculationNode;

/// Pool of calculation nodes multiplexed against a runnable-job queue.
///
/// Jobs are submitted in dependency order, parents before children; a job
/// whose `required_job_ids` name still-running jobs waits until they
/// complete, and fails immediately (and transitively) when any of them
/// fails. A required id absent from the bookkeeping is treated as already
/// completed — completed executions are removed, and only failures are kept,
/// for a bounded retention window.
pub struct CalculationNodeContainer {
    config: ContainerConfig,
    total_nodes: usize,
    sched: Mutex<Sched>,
    executions: Mutex<HashMap<u64, Arc<JobExecution>>>,
    failures: Mutex<HashMap<u64, Instant>>,
    failure_count: AtomicUsize,
}

struct Sched {
    idle: VecDeque<CalculationNode>,
    runnable: VecDeque<Arc<JobExecution>>,
}

impl CalculationNodeContainer {
    pub fn new(nodes: Vec<CalculationNode>, config: ContainerConfig) -> Arc<Self> {
        let total_nodes = nodes.len();
        Arc::new(Self {
            config,
            total_nodes,
            sched: Mutex::new(Sched {
                idle: nodes.into(),
                runnable: VecDeque::new(),
            }),
            executions: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            failure_count: AtomicUsize::new(0),
        })
    }

    /// Number of nodes in the pool; advertised as invoker capacity.
    pub fn node_count(&self) -> usize {
        self.total_nodes
    }

    /// Submits one job. The receiver is called exactly once, on completion
    /// or failure, possibly before this method returns if a requirement has
    /// already failed.
    pub fn add_job(
        self: &Arc<Self>,
        job: CalculationJob,
        receiver: Arc<dyn JobInvocationReceiver>,
    ) {
        let job_id = job.spec.job_id;
        let exec = Arc::new(JobExecution::new(job, receiver));
        {
            let mut executions = self.executions.lock().expect("container poisoned");
            if executions.insert(job_id, exec.clone()).is_some() {
                tracing::warn!(job_id, "Job resubmitted while still executing");
            }
        }

        let mut requirement_failed = false;
        if let Some(required) = exec.job.required_job_ids.clone() {
            for required_id in required {
                if required_id == job_id {
                    continue;
                }
                if self
                    .failures
                    .lock()
                    .expect("container poisoned")
                    .contains_key(&required_id)
                {
                    requirement_failed = true;
                    continue;
                }
                let parent = self
                    .executions
                    .lock()
                    .expect("container poisoned")
                    .get(&required_id)
                    .cloned();
                match parent {
                    Some(parent) => match parent.add_blocked(&exec) {
                        BlockOutcome::Registered => {
                            tracing::debug!(job_id, required_id, "Job blocked on requirement")
                        }
                        BlockOutcome::RequirementFailed => requirement_failed = true,
                        BlockOutcome::AlreadyCompleted => {}
                    },
                    // Absent from both maps: already completed.
                    None => {}
                }
            }
        }

        if requirement_failed {
            self.fail_execution(&exec, "container", "required job failed");
            return;
        }
        // Return the submitter's reservation; spawns unless still blocked.
        if exec.release() {
            self.spawn_or_queue(exec);
        }
    }

    /// Submits a job and its whole tail subtree, parents before children.
    pub fn add_job_tree(
        self: &Arc<Self>,
        job: &CalculationJob,
        receiver: Arc<dyn JobInvocationReceiver>,
    ) {
        for entry in job.flatten() {
            let mut single = entry.clone();
            single.tail.clear();
            self.add_job(single, receiver.clone());
        }
    }

    /// Cancels a job: raises its cancel flag, which interrupts the current
    /// item invocation and stops the node between items. The job surfaces
    /// through the failure callback once the executing task observes the
    /// flag; a queued-but-unstarted job fails on pickup.
    pub fn cancel(&self, spec: &CalculationJobSpec) {
        let exec = self
            .executions
            .lock()
            .expect("container poisoned")
            .get(&spec.job_id)
            .cloned();
        if let Some(exec) = exec {
            tracing::info!(job = %spec, "Cancelling job in container");
            exec.job.cancel();
        }
    }

    /// A job is alive while its execution is still tracked as running.
    pub fn is_alive(&self, spec: &CalculationJobSpec) -> bool {
        self.executions
            .lock()
            .expect("container poisoned")
            .contains_key(&spec.job_id)
    }

    /// Number of jobs currently tracked as running or queued.
    pub fn active_jobs(&self) -> usize {
        self.executions.lock().expect("container poisoned").len()
    }

    fn spawn_or_queue(self: &Arc<Self>, exec: Arc<JobExecution>) {
        let node = {
            let mut sched = self.sched.lock().expect("container poisoned");
            match sched.idle.pop_front() {
                Some(node) => node,
                None => {
                    sched.runnable.push_back(exec);
                    return;
                }
            }
        };
        let container = self.clone();
        tokio::spawn(async move {
            container.run_worker(node, exec).await;
        });
    }

    /// Runs jobs on one node until the runnable queue drains, then parks the
    /// node back in the idle pool. Executing a wave of ready jobs on the
    /// same task avoids a pool round-trip per job.
    async fn run_worker(self: Arc<Self>, node: CalculationNode, mut exec: Arc<JobExecution>) {
        loop {
            match node.execute_job(&exec.job).await {
                Ok(result) => self.complete_execution(&exec, result),
                Err(error) => {
                    tracing::warn!(
                        job = %exec.job.spec,
                        node_id = node.node_id(),
                        error = %error,
                        "Job execution failed"
                    );
                    self.fail_execution(&exec, node.node_id(), &error.to_string());
                }
            }

            let mut sched = self.sched.lock().expect("container poisoned");
            match sched.runnable.pop_front() {
                Some(next) => {
                    drop(sched);
                    exec = next;
                }
                None => {
                    sched.idle.push_back(node);
                    return;
                }
            }
        }
    }

    fn complete_execution(
        self: &Arc<Self>,
        exec: &Arc<JobExecution>,
        result: crate::job::CalculationJobResult,
    ) {
        if !exec.mark_completed() {
            tracing::debug!(job = %exec.job.spec, "Late completion for a finished job, dropped");
            return;
        }
        self.executions
            .lock()
            .expect("container poisoned")
            .remove(&exec.job_id());
        exec.receiver.job_completed(result);
        for child in exec.take_blocked() {
            if child.release() && !child.is_failed() {
                self.spawn_or_queue(child);
            }
        }
    }

    fn fail_execution(self: &Arc<Self>, exec: &Arc<JobExecution>, node_id: &str, error: &str) {
        if !exec.mark_failed() {
            tracing::debug!(job = %exec.job.spec, "Late failure for a finished job, dropped");
            return;
        }
        self.executions
            .lock()
            .expect("container poisoned")
            .remove(&exec.job_id());
        self.record_failure(exec.job_id());
        exec.receiver.job_failed(&exec.job, node_id, error);
        for child in exec.take_blocked() {
            self.fail_execution(&child, node_id, "required job failed");
        }
    }

    fn record_failure(&self, job_id: u64) {
        self.failures
            .lock()
            .expect("container poisoned")
            .insert(job_id, Instant::now());
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        let interval = self.config.failure_sweep_interval.max(1);
        if count % interval == 0 {
            self.sweep_failures();
        }
    }

    fn sweep_failures(&self) {
        let retention = self.config.failure_retention;
        let mut failures = self.failures.lock().expect("container poisoned");
        let before = failures.len();
        failures.retain(|_, failed_at| failed_at.elapsed() <= retention);
        if before > failures.len() {
            tracing::debug!(
                evicted = before - failures.len(),
                retained = failures.len(),
                "Evicted aged entries from the failure map"
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn failure_map_len(&self) -> usize {
        self.failures.lock().expect("container poisoned").len()
    }
}
