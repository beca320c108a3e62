//! Invocation and job statistics collaborators.
//!
//! Nodes record per-invocation cost samples (latency, data sizes) and
//! per-job outcomes. The remote node host forwards aggregated samples to the
//! dispatcher as cost-model feedback; none of it is correctness-critical.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-function invocation samples, recorded by calculation nodes.
pub trait FunctionInvocationStatisticsGatherer: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn function_invoked(
        &self,
        calc_config: &str,
        function_id: &str,
        invocations: u64,
        execution: Duration,
        input_bytes: usize,
        output_bytes: usize,
    );
}

/// Per-job outcomes, recorded by the node host for capacity feedback.
pub trait NodeStatisticsGatherer: Send + Sync {
    fn job_completed(&self, node_id: &str, item_count: usize, execution: Duration);
    fn job_failed(&self, node_id: &str, duration: Duration);
}

/// Gatherer that drops all samples.
#[derive(Debug, Default)]
pub struct DiscardingStatistics;

impl FunctionInvocationStatisticsGatherer for DiscardingStatistics {
    fn function_invoked(&self, _: &str, _: &str, _: u64, _: Duration, _: usize, _: usize) {}
}

impl NodeStatisticsGatherer for DiscardingStatistics {
    fn job_completed(&self, _: &str, _: usize, _: Duration) {}
    fn job_failed(&self, _: &str, _: Duration) {}
}

/// One function's accumulated cost sample, as sent in `Invocations` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationStatistics {
    pub calc_config: String,
    pub function_id: String,
    pub invocations: u64,
    pub execution_nanos: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
}

/// Gatherer that totals samples per (configuration, function) and can drain
/// them for transmission.
#[derive(Debug, Default)]
pub struct TotallingStatistics {
    samples: Mutex<HashMap<(String, String), InvocationStatistics>>,
}

impl TotallingStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns all accumulated samples.
    pub fn drain(&self) -> Vec<InvocationStatistics> {
        let mut samples = self.samples.lock().expect("statistics poisoned");
        samples.drain().map(|(_, v)| v).collect()
    }
}

impl FunctionInvocationStatisticsGatherer for TotallingStatistics {
    fn function_invoked(
        &self,
        calc_config: &str,
        function_id: &str,
        invocations: u64,
        execution: Duration,
        input_bytes: usize,
        output_bytes: usize,
    ) {
        let mut samples = self.samples.lock().expect("statistics poisoned");
        let entry = samples
            .entry((calc_config.to_string(), function_id.to_string()))
            .or_insert_with(|| InvocationStatistics {
                calc_config: calc_config.to_string(),
                function_id: function_id.to_string(),
                invocations: 0,
                execution_nanos: 0,
                input_bytes: 0,
                output_bytes: 0,
            });
        entry.invocations += invocations;
        entry.execution_nanos += execution.as_nanos().min(u64::MAX as u128) as u64;
        entry.input_bytes += input_bytes as u64;
        entry.output_bytes += output_bytes as u64;
    }
}
