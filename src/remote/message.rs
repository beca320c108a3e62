use serde::{Deserialize, Serialize};

use crate::job::{CalculationJob, CalculationJobResult, CalculationJobSpec};
use crate::stats::InvocationStatistics;

/// Messages exchanged between a dispatcher and a remote node host.
///
/// One connection carries an ordered stream of these in both directions;
/// correlation is by job specification. `Cancel` is only meaningful after
/// the `Execute` it targets, which the per-connection ordering guarantees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteNodeMessage {
    /// Dispatcher → host: version handshake. The host reinitializes its
    /// function repository if the identifier differs from its own.
    Init { function_init_id: u64 },
    /// Host → dispatcher: advertises execution capacity. Sent on connect
    /// and whenever capacity changes.
    Ready { capacity: usize, host_id: String },
    /// Dispatcher → host: run this job. Tail jobs travel as separate
    /// `Execute` messages after their parent, on the same connection.
    Execute { job: CalculationJob },
    /// Host → dispatcher: a job completed. `ready` optionally re-advertises
    /// capacity.
    Result {
        result: CalculationJobResult,
        ready: Option<usize>,
    },
    /// Host → dispatcher: a job failed at the job level (node error,
    /// cancellation, or an `IsAlive` probe for a job the host no longer
    /// tracks).
    Failure {
        spec: CalculationJobSpec,
        message: String,
        node_id: String,
        ready: Option<usize>,
    },
    /// Dispatcher → host: cancel these jobs.
    Cancel { jobs: Vec<CalculationJobSpec> },
    /// Dispatcher → host: liveness probe. The host answers with `Failure`
    /// messages for any job it is not executing; silence means alive.
    IsAlive { jobs: Vec<CalculationJobSpec> },
    /// Host → dispatcher: informational note that a tail job was accepted
    /// without a dispatcher-side submission of its own.
    Busy { spec: CalculationJobSpec },
    /// Host → dispatcher: accumulated cost-model samples. Not
    /// correctness-critical.
    Invocations {
        statistics: Vec<InvocationStatistics>,
    },
}
