use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::container::JobInvocationReceiver;
use crate::job::CalculationJob;

/// Result of trying to block a job on a requirement.
pub(crate) enum BlockOutcome {
    /// The requirement is running; the job has been registered and one unit
    /// of its counter reserved.
    Registered,
    /// The requirement already failed; the job must fail too.
    RequirementFailed,
    /// The requirement finished between the map lookup and this call; the
    /// job does not need to wait for it.
    AlreadyCompleted,
}

/// Scheduler bookkeeping for one submitted job.
///
/// An execution lives in the container's active map while RUNNING and moves
/// to the bounded failure map on failure; completed executions are removed
/// entirely, so absence from both maps reads as success. All terminal
/// transitions and the blocked list share one monitor, so a job can never
/// register as blocked on an execution whose blocked list has already been
/// drained.
pub(crate) struct JobExecution {
    pub job: CalculationJob,
    pub receiver: Arc<dyn JobInvocationReceiver>,
    /// Reserve/release counter for dependency blocking. Starts at 1 (the
    /// submitter's reservation) and gains one unit per RUNNING requirement;
    /// the job becomes runnable when it reaches zero.
    blocked_count: AtomicUsize,
    state: Mutex<ExecState>,
}

struct ExecState {
    terminal: bool,
    failed: bool,
    /// Executions blocked on this one, released or failed when it finishes.
    blocked: Vec<Arc<JobExecution>>,
}

impl JobExecution {
    pub fn new(job: CalculationJob, receiver: Arc<dyn JobInvocationReceiver>) -> Self {
        Self {
            job,
            receiver,
            blocked_count: AtomicUsize::new(1),
            state: Mutex::new(ExecState {
                terminal: false,
                failed: false,
                blocked: Vec::new(),
            }),
        }
    }

    pub fn job_id(&self) -> u64 {
        self.job.spec.job_id
    }

    /// Registers `child` as blocked on this execution, reserving one unit of
    /// the child's counter, unless this execution has already finished.
    pub fn add_blocked(&self, child: &Arc<JobExecution>) -> BlockOutcome {
        let mut state = self.state.lock().expect("execution poisoned");
        if state.failed {
            return BlockOutcome::RequirementFailed;
        }
        if state.terminal {
            return BlockOutcome::AlreadyCompleted;
        }
        child.reserve();
        state.blocked.push(child.clone());
        BlockOutcome::Registered
    }

    fn reserve(&self) {
        self.blocked_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Releases one unit of the counter. Returns true when the counter hits
    /// zero, i.e. every requirement (and the submitter's scan) is done.
    pub fn release(&self) -> bool {
        self.blocked_count.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Claims the terminal completion transition. False if failure or
    /// another completion got there first.
    pub fn mark_completed(&self) -> bool {
        let mut state = self.state.lock().expect("execution poisoned");
        if state.terminal {
            return false;
        }
        state.terminal = true;
        true
    }

    /// Claims the terminal failure transition and records the failed status
    /// for late blocking attempts.
    pub fn mark_failed(&self) -> bool {
        let mut state = self.state.lock().expect("execution poisoned");
        if state.terminal {
            return false;
        }
        state.terminal = true;
        state.failed = true;
        true
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().expect("execution poisoned").failed
    }

    /// Removes and returns everything blocked on this execution.
    pub fn take_blocked(&self) -> Vec<Arc<JobExecution>> {
        std::mem::take(&mut self.state.lock().expect("execution poisoned").blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CalculationJobResult, CalculationJobSpec};
    use chrono::Utc;
    use uuid::Uuid;

    struct NullReceiver;

    impl JobInvocationReceiver for NullReceiver {
        fn job_completed(&self, _result: CalculationJobResult) {}
        fn job_failed(&self, _job: &CalculationJob, _node_id: &str, _error: &str) {}
    }

    fn execution(job_id: u64) -> Arc<JobExecution> {
        let spec = CalculationJobSpec::new(Uuid::new_v4(), "Default", Utc::now(), job_id);
        Arc::new(JobExecution::new(
            CalculationJob::new(spec, vec![]),
            Arc::new(NullReceiver),
        ))
    }

    #[test]
    fn release_fires_only_when_all_reservations_are_returned() {
        let parent_a = execution(1);
        let parent_b = execution(2);
        let child = execution(3);

        assert!(matches!(parent_a.add_blocked(&child), BlockOutcome::Registered));
        assert!(matches!(parent_b.add_blocked(&child), BlockOutcome::Registered));

        // Submitter's reservation plus two parents: three units out.
        assert!(!child.release());
        assert!(!child.release());
        assert!(child.release());
    }

    #[test]
    fn terminal_transition_is_exclusive() {
        let exec = execution(1);
        assert!(exec.mark_failed());
        assert!(!exec.mark_completed());
        assert!(!exec.mark_failed());
        assert!(exec.is_failed());
    }

    #[test]
    fn blocking_on_a_failed_execution_is_refused() {
        let parent = execution(1);
        let child = execution(2);
        parent.mark_failed();
        assert!(matches!(
            parent.add_blocked(&child),
            BlockOutcome::RequirementFailed
        ));
        // No reservation was taken, so the submitter's release makes it runnable.
        assert!(child.release());
    }

    #[test]
    fn blocking_on_a_completed_execution_is_a_no_op() {
        let parent = execution(1);
        let child = execution(2);
        parent.mark_completed();
        assert!(matches!(
            parent.add_blocked(&child),
            BlockOutcome::AlreadyCompleted
        ));
        assert!(child.release());
    }
}
