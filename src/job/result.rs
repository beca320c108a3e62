use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::spec::CalculationJobSpec;
use crate::values::ValueSpec;

/// Outcome of one job item, in the same position as the item in the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalculationJobResultItem {
    Success {
        /// Outputs the function was asked for but did not produce. Error
        /// sentinels have been written to the cache for these.
        missing_outputs: Vec<ValueSpec>,
    },
    FunctionThrew {
        exception_class: String,
        message: String,
        stack_trace: Vec<String>,
    },
    MissingInputs {
        missing: Vec<ValueSpec>,
    },
    /// The item was not run because its function is blacklisted.
    Suppressed,
}

impl CalculationJobResultItem {
    pub fn success() -> Self {
        CalculationJobResultItem::Success {
            missing_outputs: Vec::new(),
        }
    }

    pub fn function_threw(exception_class: impl Into<String>, message: impl Into<String>) -> Self {
        CalculationJobResultItem::FunctionThrew {
            exception_class: exception_class.into(),
            message: message.into(),
            stack_trace: Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        !matches!(self, CalculationJobResultItem::Success { .. })
    }
}

/// Result of executing one job on one node. Items appear in the same order
/// as the job's items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationJobResult {
    pub spec: CalculationJobSpec,
    duration_nanos: u64,
    pub items: Vec<CalculationJobResultItem>,
    pub node_id: String,
}

impl CalculationJobResult {
    pub fn new(
        spec: CalculationJobSpec,
        duration: Duration,
        items: Vec<CalculationJobResultItem>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            spec,
            duration_nanos: duration.as_nanos().min(u64::MAX as u128) as u64,
            items,
            node_id: node_id.into(),
        }
    }

    /// As [`CalculationJobResult::new`] but for durations measured by a
    /// remote clock, which may arrive negative; clamped to zero.
    pub fn with_nanos(
        spec: CalculationJobSpec,
        duration_nanos: i64,
        items: Vec<CalculationJobResultItem>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            spec,
            duration_nanos: duration_nanos.max(0) as u64,
            items,
            node_id: node_id.into(),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.duration_nanos)
    }

    pub fn failed_items(&self) -> usize {
        self.items.iter().filter(|i| i.is_failed()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn spec() -> CalculationJobSpec {
        CalculationJobSpec::new(Uuid::new_v4(), "Default", Utc::now(), 1)
    }

    #[test]
    fn negative_remote_duration_is_clamped() {
        let result = CalculationJobResult::with_nanos(spec(), -250, vec![], "node-1");
        assert_eq!(result.duration(), Duration::ZERO);
    }

    #[test]
    fn failed_items_counts_non_success() {
        let result = CalculationJobResult::new(
            spec(),
            Duration::from_millis(5),
            vec![
                CalculationJobResultItem::success(),
                CalculationJobResultItem::function_threw("InvalidInvocationError", "boom"),
                CalculationJobResultItem::MissingInputs { missing: vec![] },
                CalculationJobResultItem::Suppressed,
            ],
            "node-1",
        );
        assert_eq!(result.failed_items(), 3);
    }
}
