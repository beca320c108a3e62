use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::identifier::IdentifierMap;
use crate::job::item::CalculationJobItem;
use crate::job::spec::CalculationJobSpec;

/// Which cache a job's values should be selected from/written to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheSelectHint {
    #[default]
    AllShared,
    AllPrivate,
}

/// A unit of dispatchable work: an ordered sequence of items to run on one
/// calculation node.
///
/// `required_job_ids` names jobs that must have completed before this one may
/// run. A required id absent from the executing container's bookkeeping is
/// treated as already completed. `tail` jobs are children that must execute
/// on the same invoker as their parent once the parent finishes; they are not
/// part of the serialized job and are walked separately by the dispatcher and
/// the remote adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationJob {
    pub spec: CalculationJobSpec,
    pub required_job_ids: Option<HashSet<u64>>,
    pub items: Vec<CalculationJobItem>,
    pub cache_hint: CacheSelectHint,
    #[serde(skip)]
    pub tail: Vec<CalculationJob>,
    #[serde(skip, default)]
    cancelled: CancellationToken,
}

impl CalculationJob {
    pub fn new(spec: CalculationJobSpec, items: Vec<CalculationJobItem>) -> Self {
        Self {
            spec,
            required_job_ids: None,
            items,
            cache_hint: CacheSelectHint::default(),
            tail: Vec::new(),
            cancelled: CancellationToken::new(),
        }
    }

    pub fn with_required(mut self, required_job_ids: impl IntoIterator<Item = u64>) -> Self {
        self.required_job_ids = Some(required_job_ids.into_iter().collect());
        self
    }

    /// Attach a tail job. The tail's `required_job_ids` must already name
    /// this job for the executing container to sequence them.
    pub fn with_tail(mut self, tail: CalculationJob) -> Self {
        self.tail.push(tail);
        self
    }

    /// Marks the job cancelled. Clones made before the call share the flag,
    /// so a job handed to a container can be cancelled through any copy.
    pub fn cancel(&self) {
        self.cancelled.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// Token raised by [`CalculationJob::cancel`]; nodes select on it to
    /// interrupt an in-flight item invocation.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancelled
    }

    /// The job itself plus its whole tail subtree, parents before children.
    pub fn flatten(&self) -> Vec<&CalculationJob> {
        let mut out = Vec::with_capacity(1 + self.tail.len());
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a CalculationJob>) {
        out.push(self);
        for tail in &self.tail {
            tail.collect(out);
        }
    }

    /// Converts item value specs to numeric identifiers for transmission.
    pub fn convert_identifiers(&mut self, map: &dyn IdentifierMap) {
        for item in &mut self.items {
            item.inputs = map.convert(&item.inputs);
            item.outputs = map.convert(&item.outputs);
        }
    }

    /// Resolves numeric identifiers back to full value specs after receipt.
    pub fn resolve_identifiers(&mut self, map: &dyn IdentifierMap) -> Result<()> {
        for item in &mut self.items {
            item.inputs = map.resolve(&item.inputs)?;
            item.outputs = map.resolve(&item.outputs)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for CalculationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job {} ({} items)", self.spec, self.items.len())
    }
}
