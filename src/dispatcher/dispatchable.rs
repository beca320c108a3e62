use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::blacklist::BlacklistMaintainer;
use crate::container::JobInvocationReceiver;
use crate::dispatcher::dispatcher::DispatcherCore;
use crate::dispatcher::invoker::JobInvoker;
use crate::dispatcher::JobResultReceiver;
use crate::job::{
    CalculationJob, CalculationJobResult, CalculationJobResultItem, CalculationJobSpec,
};

const ACTIVE: u8 = 0;
const FINISHED: u8 = 1;
const CANCELLED: u8 = 2;

const ERROR_ABORTED: &str = "DispatchAbortedError";

struct PendingResult {
    receiver: Arc<dyn JobResultReceiver>,
    item_count: usize,
}

struct AttemptState {
    seq: u64,
    failed: bool,
    invoker: Option<Arc<dyn JobInvoker>>,
}

/// Dispatcher-side state machine for one submitted job tree.
///
/// `PENDING → DISPATCHED → {COMPLETED | FAILED → PENDING (retry) | ABORTED |
/// CANCELLED}`. One caller receiver is tracked per root/tail specification;
/// entries leave the map as results arrive, which makes delivery exactly-once
/// and lets duplicates from a retried attempt be recognised and dropped. The
/// `terminal` atomic arbitrates the race between completion, failure, timeout
/// and explicit cancellation: exactly one transition wins.
///
/// A job whose retry budget is spent turns into a watched job: if it has
/// exactly one item, that item is reported to the blacklist maintainer before
/// the abort. Splitting a multi-item watched job to isolate the poison item
/// is not supported; such jobs abort whole.
pub(crate) struct DispatchableJob {
    core: Arc<DispatcherCore>,
    job: CalculationJob,
    receivers: Mutex<HashMap<CalculationJobSpec, PendingResult>>,
    /// Invoker ids this job has failed on. A second failure on the same
    /// invoker aborts the job.
    excluded: Mutex<HashSet<String>>,
    attempts: AtomicUsize,
    terminal: AtomicU8,
    attempt: Mutex<AttemptState>,
    timeout: Mutex<Option<JoinHandle<()>>>,
    watched: AtomicBool,
}

impl DispatchableJob {
    pub fn new(
        core: Arc<DispatcherCore>,
        job: CalculationJob,
        receiver: Arc<dyn JobResultReceiver>,
    ) -> Arc<Self> {
        let receivers = job
            .flatten()
            .into_iter()
            .map(|entry| {
                (
                    entry.spec.clone(),
                    PendingResult {
                        receiver: receiver.clone(),
                        item_count: entry.items.len(),
                    },
                )
            })
            .collect();
        Arc::new(Self {
            core,
            job,
            receivers: Mutex::new(receivers),
            excluded: Mutex::new(HashSet::new()),
            attempts: AtomicUsize::new(0),
            terminal: AtomicU8::new(ACTIVE),
            attempt: Mutex::new(AttemptState {
                seq: 0,
                failed: false,
                invoker: None,
            }),
            timeout: Mutex::new(None),
            watched: AtomicBool::new(false),
        })
    }

    pub fn job(&self) -> &CalculationJob {
        &self.job
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::SeqCst) != ACTIVE
    }

    pub fn excluded_snapshot(&self) -> HashSet<String> {
        self.excluded.lock().expect("dispatch job poisoned").clone()
    }

    /// Records the invoker about to receive this attempt. Done before the
    /// invoke call so a result arriving immediately still finds consistent
    /// bookkeeping.
    pub fn begin_attempt(&self, invoker: Arc<dyn JobInvoker>) -> u64 {
        let mut attempt = self.attempt.lock().expect("dispatch job poisoned");
        attempt.seq += 1;
        attempt.failed = false;
        attempt.invoker = Some(invoker);
        attempt.seq
    }

    /// Undoes [`DispatchableJob::begin_attempt`] after a refused invoke.
    pub fn rollback_attempt(&self) {
        self.attempt.lock().expect("dispatch job poisoned").invoker = None;
    }

    fn attempt_seq(&self) -> u64 {
        self.attempt.lock().expect("dispatch job poisoned").seq
    }

    fn attempt_is_current(&self, seq: u64) -> bool {
        let attempt = self.attempt.lock().expect("dispatch job poisoned");
        attempt.seq == seq && !attempt.failed
    }

    /// Arms the execution timeout for the attempt `seq`. The task only ever
    /// performs the liveness query or a failure transition; any retry it
    /// triggers is spawned separately by [`DispatchableJob::fail`].
    pub fn start_timeout(self: &Arc<Self>, seq: u64, invoker: Arc<dyn JobInvoker>) {
        let djob = self.clone();
        let max = self.core.config().max_job_execution_time;
        let query = self.core.config().max_job_execution_time_query;
        let handle = tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + max;
            loop {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    break;
                }
                tokio::time::sleep(query.min(deadline - now)).await;
                if djob.attempt_seq() != seq || djob.is_terminal() {
                    return;
                }
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                if !invoker.is_alive(&[djob.job.spec.clone()]).await {
                    tracing::warn!(job = %djob.job.spec, "Invoker no longer executing the job");
                    break;
                }
            }
            if djob.attempt_seq() != seq || djob.is_terminal() {
                return;
            }
            tracing::warn!(job = %djob.job.spec, "Maximum job execution time exceeded");
            invoker
                .cancel(&djob.job.flatten().iter().map(|j| j.spec.clone()).collect::<Vec<_>>())
                .await;
            djob.fail("maximum job execution time exceeded");
        });
        // The invoke call can fail or finish synchronously before we get
        // here; never arm a timeout for a dead attempt or displace a newer
        // attempt's timeout.
        if !self.attempt_is_current(seq) || self.is_terminal() {
            handle.abort();
            return;
        }
        let previous = self
            .timeout
            .lock()
            .expect("dispatch job poisoned")
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn cancel_timeout(&self) {
        if let Some(handle) = self.timeout.lock().expect("dispatch job poisoned").take() {
            handle.abort();
        }
    }

    /// Delivers one root/tail result to the caller, exactly once per spec.
    pub fn job_completed(&self, result: CalculationJobResult) {
        if self.terminal.load(Ordering::SeqCst) == CANCELLED {
            tracing::debug!(job = %result.spec, "Result for a cancelled job, dropped");
            return;
        }
        let (pending, now_empty) = {
            let mut receivers = self.receivers.lock().expect("dispatch job poisoned");
            let pending = receivers.remove(&result.spec);
            (pending, receivers.is_empty())
        };
        match pending {
            None => tracing::debug!(job = %result.spec, "Duplicate or late result, dropped"),
            Some(pending) => {
                pending.receiver.result_received(result);
                if now_empty {
                    self.finish();
                }
            }
        }
    }

    fn finish(&self) {
        if self
            .terminal
            .compare_exchange(ACTIVE, FINISHED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.cancel_timeout();
            self.attempt.lock().expect("dispatch job poisoned").invoker = None;
            tracing::debug!(job = %self.job.spec, "Job tree finished");
        }
    }

    /// Job-level failure of the current attempt: retry with exclusion, or
    /// abort once the budget is spent or the same invoker failed twice.
    /// Idempotent per attempt, so several tail failures collapse into one
    /// retry.
    pub fn fail(self: &Arc<Self>, error: &str) {
        if self.is_terminal() {
            tracing::debug!(job = %self.job.spec, "Failure for a finished job, dropped");
            return;
        }
        let invoker = {
            let mut attempt = self.attempt.lock().expect("dispatch job poisoned");
            if attempt.failed {
                return;
            }
            attempt.failed = true;
            attempt.invoker.take()
        };
        self.cancel_timeout();

        let invoker_id = invoker.as_ref().and_then(|i| i.invoker_id());
        let repeat_failure = match &invoker_id {
            Some(id) => !self
                .excluded
                .lock()
                .expect("dispatch job poisoned")
                .insert(id.clone()),
            None => false,
        };
        let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if repeat_failure {
            tracing::warn!(
                job = %self.job.spec,
                invoker = invoker_id.as_deref().unwrap_or("-"),
                "Invoker failed the job twice, aborting"
            );
            self.abort(error);
        } else if attempts >= self.core.config().max_job_attempts {
            tracing::warn!(job = %self.job.spec, attempts, "Job attempt budget exhausted, aborting");
            self.abort(error);
        } else {
            tracing::info!(job = %self.job.spec, attempts, error, "Retrying job");
            let core = self.core.clone();
            let djob = self.clone();
            tokio::spawn(async move {
                core.dispatch_dispatchable(djob).await;
            });
        }
    }

    /// Terminal abort: the watched disposition, then one synthesized failure
    /// result per root/tail spec still awaiting delivery.
    fn abort(self: &Arc<Self>, reason: &str) {
        if !self.watched.swap(true, Ordering::SeqCst) {
            match self.job.items.len() {
                1 => self.core.blacklist().failed_job_item(&self.job.items[0]),
                n if n > 1 => tracing::error!(
                    job = %self.job.spec,
                    items = n,
                    "Watched job has multiple items; job splitting is not supported"
                ),
                _ => {}
            }
        }
        if self
            .terminal
            .compare_exchange(ACTIVE, FINISHED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let drained: Vec<(CalculationJobSpec, PendingResult)> = self
            .receivers
            .lock()
            .expect("dispatch job poisoned")
            .drain()
            .collect();
        tracing::warn!(job = %self.job.spec, receivers = drained.len(), reason, "Aborting job tree");
        for (spec, pending) in drained {
            let items = vec![
                CalculationJobResultItem::function_threw(ERROR_ABORTED, reason);
                pending.item_count
            ];
            let result = CalculationJobResult::new(spec, Duration::ZERO, items, "dispatcher");
            pending.receiver.result_received(result);
        }
    }

    /// Cancels the job tree. False when it already reached a terminal state,
    /// in which case nothing changes and no callback is produced.
    pub async fn cancel(self: &Arc<Self>) -> bool {
        if self
            .terminal
            .compare_exchange(ACTIVE, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.cancel_timeout();
        self.job.cancel();
        self.receivers.lock().expect("dispatch job poisoned").clear();
        let invoker = self
            .attempt
            .lock()
            .expect("dispatch job poisoned")
            .invoker
            .take();
        if let Some(invoker) = invoker {
            let specs: Vec<CalculationJobSpec> =
                self.job.flatten().iter().map(|j| j.spec.clone()).collect();
            invoker.cancel(&specs).await;
        }
        tracing::info!(job = %self.job.spec, "Job cancelled");
        true
    }
}

/// The receiver handed to invokers; adapts invocation callbacks onto the
/// dispatchable job's state machine.
pub(crate) struct DispatchReceiver(pub(crate) Arc<DispatchableJob>);

impl JobInvocationReceiver for DispatchReceiver {
    fn job_completed(&self, result: CalculationJobResult) {
        self.0.job_completed(result);
    }

    fn job_failed(&self, job: &CalculationJob, node_id: &str, error: &str) {
        tracing::info!(job = %job.spec, node_id, error, "Job failed on invoker");
        self.0.fail(error);
    }
}
