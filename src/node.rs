//! A calculation node executes the items of a single job, in order, against
//! the function repository and the value cache.
//!
//! One node runs one job at a time; concurrency comes from the container
//! pooling several nodes. Item failures are captured in the per-item result
//! and never escape the node: a failed item writes error sentinels for its
//! outputs so dependent items observe a typed absence. Only cancellation and
//! protocol-level problems fail the job as a whole.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::blacklist::{BlacklistMaintainer, BlacklistQuery, DiscardingBlacklistMaintainer, PermissiveBlacklistQuery};
use crate::cache::{SizeHintSink, TotalSizeSink, ValueCache, ValueCacheSource};
use crate::error::{CalcGridError, Result};
use crate::function::{FunctionContext, FunctionInputs, FunctionInvoker, FunctionRepository};
use crate::job::{CalculationJob, CalculationJobItem, CalculationJobResult, CalculationJobResultItem};
use crate::stats::{DiscardingStatistics, FunctionInvocationStatisticsGatherer};
use crate::values::{CalcValue, ComputedValue, ValueSpec};
use crate::watchdog::ExecutionWatchdog;

const ERROR_BAD_FUNCTION: &str = "InvalidFunctionError";
const ERROR_INVOKING: &str = "InvalidInvocationError";
const ERROR_INTERRUPTED: &str = "InterruptedError";

static NODE_UNIQUE_ID: AtomicU64 = AtomicU64::new(0);

/// Builds a process-unique node identifier, `host/pid/counter`.
pub fn create_node_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!(
        "{}/{}/{}",
        host,
        std::process::id(),
        NODE_UNIQUE_ID.fetch_add(1, Ordering::Relaxed) + 1
    )
}

pub struct CalculationNode {
    node_id: String,
    cache_source: Arc<dyn ValueCacheSource>,
    functions: Arc<dyn FunctionRepository>,
    statistics: Arc<dyn FunctionInvocationStatisticsGatherer>,
    blacklist_query: Arc<dyn BlacklistQuery>,
    blacklist_update: Arc<dyn BlacklistMaintainer>,
    watchdog: Arc<ExecutionWatchdog>,
}

impl CalculationNode {
    pub fn new(
        node_id: impl Into<String>,
        cache_source: Arc<dyn ValueCacheSource>,
        functions: Arc<dyn FunctionRepository>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            cache_source,
            functions,
            statistics: Arc::new(DiscardingStatistics),
            blacklist_query: Arc::new(PermissiveBlacklistQuery),
            blacklist_update: Arc::new(DiscardingBlacklistMaintainer),
            watchdog: Arc::new(ExecutionWatchdog::disabled()),
        }
    }

    pub fn with_statistics(
        mut self,
        statistics: Arc<dyn FunctionInvocationStatisticsGatherer>,
    ) -> Self {
        self.statistics = statistics;
        self
    }

    pub fn with_blacklist_query(mut self, query: Arc<dyn BlacklistQuery>) -> Self {
        self.blacklist_query = query;
        self
    }

    pub fn with_blacklist_update(mut self, update: Arc<dyn BlacklistMaintainer>) -> Self {
        self.blacklist_update = update;
        self
    }

    pub fn with_watchdog(mut self, watchdog: Arc<ExecutionWatchdog>) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Executes all items of the job. Returns `Err(JobCancelled)` if the
    /// job's cancel flag is raised between items; item-level failures are
    /// reported inside the returned result, not as errors.
    pub async fn execute_job(&self, job: &CalculationJob) -> Result<CalculationJobResult> {
        tracing::debug!(job = %job.spec, node_id = %self.node_id, "Executing job");
        let started = Instant::now();
        let cache = self
            .cache_source
            .cache(job.spec.cycle_id, &job.spec.calc_config);

        let mut result_items = Vec::with_capacity(job.items.len());
        for item in &job.items {
            if job.is_cancelled() {
                tracing::info!(job = %job.spec, "Job cancelled mid-flight, aborting");
                return Err(CalcGridError::JobCancelled(job.spec.job_id));
            }
            result_items.push(self.execute_item(job, cache.as_ref(), item).await?);
        }

        let duration = started.elapsed();
        tracing::info!(
            job = %job.spec,
            node_id = %self.node_id,
            duration_us = duration.as_micros() as u64,
            "Executed job"
        );
        Ok(CalculationJobResult::new(
            job.spec.clone(),
            duration,
            result_items,
            &self.node_id,
        ))
    }

    async fn execute_item(
        &self,
        job: &CalculationJob,
        cache: &dyn ValueCache,
        item: &CalculationJobItem,
    ) -> Result<CalculationJobResultItem> {
        let outputs = item.output_specs()?;

        if self.blacklist_query.is_blacklisted(item) {
            post_sentinels(cache, outputs, CalcValue::Suppressed);
            return Ok(CalculationJobResultItem::Suppressed);
        }

        let Some(invoker) = self.functions.invoker(&item.function_id) else {
            post_sentinels(cache, outputs, CalcValue::EvaluationError);
            return Ok(CalculationJobResultItem::function_threw(
                ERROR_BAD_FUNCTION,
                format!(
                    "Unable to locate {} in the function repository",
                    item.function_id
                ),
            ));
        };

        // Gather inputs; cached markers count as missing.
        let mut inputs = FunctionInputs::default();
        let mut input_bytes = 0;
        for (spec, value) in cache.get_values(item.input_specs()?) {
            match value {
                Some(value) if !value.is_missing() => {
                    input_bytes += value.estimate_size();
                    inputs.values.push(ComputedValue::new(spec, value));
                }
                _ => inputs.missing.push(spec),
            }
        }
        if !inputs.missing.is_empty() && !invoker.can_handle_missing_inputs() {
            tracing::info!(
                function_id = %item.function_id,
                missing = inputs.missing.len(),
                "Not able to execute item, inputs missing"
            );
            post_sentinels(cache, outputs, CalcValue::MissingInputs);
            return Ok(CalculationJobResultItem::MissingInputs {
                missing: inputs.missing,
            });
        }

        let context = FunctionContext {
            calc_config: job.spec.calc_config.clone(),
            valuation_time: job.spec.valuation_time,
            parameters: item.parameters.clone(),
        };

        let token = CancellationToken::new();
        let _guard = self
            .watchdog
            .execution_started(&item.function_id, token.clone());
        let invocation_start = Instant::now();
        let outcome = tokio::select! {
            outcome = invoker.execute(&context, &inputs, &item.target, outputs) => outcome,
            _ = token.cancelled() => {
                self.blacklist_update.failed_job_item(item);
                post_sentinels(cache, outputs, CalcValue::EvaluationError);
                return Ok(CalculationJobResultItem::function_threw(
                    ERROR_INTERRUPTED,
                    format!("{} interrupted by the execution watchdog", item.function_id),
                ));
            }
            _ = job.cancel_token().cancelled() => {
                tracing::info!(job = %job.spec, "Job cancelled during item execution");
                return Err(CalcGridError::JobCancelled(job.spec.job_id));
            }
        };
        let execution = invocation_start.elapsed();

        match outcome {
            Ok(produced) => {
                // Keep only requested outputs; anything not produced gets an
                // error sentinel so dependents see a typed absence.
                let mut missing: Vec<ValueSpec> = outputs.to_vec();
                let mut to_store = Vec::with_capacity(outputs.len());
                for value in produced {
                    if let Some(pos) = missing.iter().position(|m| *m == value.spec) {
                        missing.swap_remove(pos);
                        to_store.push(value);
                    } else {
                        tracing::debug!(
                            function_id = %item.function_id,
                            spec = %value.spec,
                            "Function produced a non-requested result"
                        );
                    }
                }
                for spec in &missing {
                    tracing::debug!(
                        function_id = %item.function_id,
                        spec = %spec,
                        "Function did not produce a required result"
                    );
                    to_store.push(ComputedValue::new(spec.clone(), CalcValue::EvaluationError));
                }
                let mut sizes = TotalSizeSink::default();
                cache.put_values(to_store, &mut sizes);
                self.statistics.function_invoked(
                    &job.spec.calc_config,
                    &item.function_id,
                    1,
                    execution,
                    input_bytes,
                    sizes.bytes,
                );
                Ok(CalculationJobResultItem::Success {
                    missing_outputs: missing,
                })
            }
            Err(error) => {
                tracing::warn!(
                    function_id = %item.function_id,
                    error = %error,
                    "Function invocation failed"
                );
                self.blacklist_update.failed_job_item(item);
                post_sentinels(cache, outputs, CalcValue::EvaluationError);
                let class = if error.class.is_empty() {
                    ERROR_INVOKING.to_string()
                } else {
                    error.class
                };
                Ok(CalculationJobResultItem::FunctionThrew {
                    exception_class: class,
                    message: error.message,
                    stack_trace: Vec::new(),
                })
            }
        }
    }
}

fn post_sentinels(cache: &dyn ValueCache, outputs: &[ValueSpec], marker: CalcValue) {
    let values = outputs
        .iter()
        .map(|spec| ComputedValue::new(spec.clone(), marker.clone()))
        .collect();
    let mut sizes = DiscardSizes;
    cache.put_values(values, &mut sizes);
}

struct DiscardSizes;

impl SizeHintSink for DiscardSizes {
    fn value_written(&mut self, _bytes: usize) {}
}
