//! Receiver-side execution container: a pool of calculation nodes, a
//! runnable-job queue, and the dependency bookkeeping that sequences jobs
//! submitted as a batch.

mod execution;

#[allow(clippy::module_inception)]
mod container;

pub use container::CalculationNodeContainer;

use crate::job::{CalculationJob, CalculationJobResult};

/// Callback for one submitted job's outcome. Invoked exactly once per job by
/// the container (or by whatever stands in for it on the dispatcher side of
/// a remote connection).
pub trait JobInvocationReceiver: Send + Sync {
    fn job_completed(&self, result: CalculationJobResult);

    fn job_failed(&self, job: &CalculationJob, node_id: &str, error: &str);
}
