//! Function blacklisting collaborators.
//!
//! A node consults a [`BlacklistQuery`] before running each item and reports
//! items whose functions threw to a [`BlacklistMaintainer`]. The watched-job
//! path also reports the single item of a repeatedly failing job. The
//! permissive defaults blacklist nothing and ignore reports.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::job::CalculationJobItem;

pub trait BlacklistQuery: Send + Sync {
    fn is_blacklisted(&self, item: &CalculationJobItem) -> bool;
}

pub trait BlacklistMaintainer: Send + Sync {
    fn failed_job_item(&self, item: &CalculationJobItem);
}

/// Query that never suppresses anything.
#[derive(Debug, Default)]
pub struct PermissiveBlacklistQuery;

impl BlacklistQuery for PermissiveBlacklistQuery {
    fn is_blacklisted(&self, _item: &CalculationJobItem) -> bool {
        false
    }
}

/// Maintainer that discards reports.
#[derive(Debug, Default)]
pub struct DiscardingBlacklistMaintainer;

impl BlacklistMaintainer for DiscardingBlacklistMaintainer {
    fn failed_job_item(&self, _item: &CalculationJobItem) {}
}

/// Maintainer that remembers reported function ids and answers queries from
/// that set. Suitable for a single process; a shared deployment would put a
/// distributed store behind the same traits.
#[derive(Debug, Default)]
pub struct InMemoryBlacklist {
    functions: Mutex<HashSet<String>>,
}

impl InMemoryBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reported_functions(&self) -> Vec<String> {
        self.functions
            .lock()
            .expect("blacklist poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

impl BlacklistQuery for InMemoryBlacklist {
    fn is_blacklisted(&self, item: &CalculationJobItem) -> bool {
        self.functions
            .lock()
            .expect("blacklist poisoned")
            .contains(&item.function_id)
    }
}

impl BlacklistMaintainer for InMemoryBlacklist {
    fn failed_job_item(&self, item: &CalculationJobItem) {
        tracing::warn!(function_id = %item.function_id, "Job item reported to blacklist");
        self.functions
            .lock()
            .expect("blacklist poisoned")
            .insert(item.function_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::{TargetKind, TargetSpec};

    fn item(function_id: &str) -> CalculationJobItem {
        CalculationJobItem::new(
            function_id,
            serde_json::Value::Null,
            TargetSpec::new(TargetKind::Position, "P1"),
            vec![],
            vec![],
        )
    }

    #[test]
    fn in_memory_blacklist_suppresses_reported_functions() {
        let blacklist = InMemoryBlacklist::new();
        assert!(!blacklist.is_blacklisted(&item("fn-bad")));
        blacklist.failed_job_item(&item("fn-bad"));
        assert!(blacklist.is_blacklisted(&item("fn-bad")));
        assert!(!blacklist.is_blacklisted(&item("fn-good")));
    }
}
