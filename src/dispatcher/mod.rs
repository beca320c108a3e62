//! Sender-side scheduling: the invoker registry, the per-job state machine
//! and the dispatcher that ties them together.

mod dispatchable;
mod invoker;

#[allow(clippy::module_inception)]
mod dispatcher;

pub use dispatcher::{DispatchHandle, JobDispatcher};
pub use invoker::{JobInvoker, JobInvokerRegister, LocalNodeJobInvoker};

use crate::job::CalculationJobResult;

/// Caller-facing result callback: fired exactly once per dispatched root or
/// tail job, with either the real result or a synthesized abort result.
pub trait JobResultReceiver: Send + Sync {
    fn result_received(&self, result: CalculationJobResult);
}

impl JobResultReceiver for tokio::sync::mpsc::UnboundedSender<CalculationJobResult> {
    fn result_received(&self, result: CalculationJobResult) {
        if self.send(result).is_err() {
            tracing::debug!("Result receiver dropped before delivery");
        }
    }
}
