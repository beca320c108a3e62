use serde::{Deserialize, Serialize};

use crate::error::{CalcGridError, Result};
use crate::values::{TargetSpec, ValueSpec};

/// Input or output keys of a job item. In memory the keys are full value
/// specifications; for wire transmission they may be converted to compact
/// numeric identifiers by an identifier map and resolved back on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueIdents {
    Specs(Vec<ValueSpec>),
    Ids(Vec<u64>),
}

impl ValueIdents {
    pub fn specs(&self) -> Result<&[ValueSpec]> {
        match self {
            ValueIdents::Specs(specs) => Ok(specs),
            ValueIdents::Ids(_) => Err(CalcGridError::UnresolvedIdentifiers),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ValueIdents::Specs(specs) => specs.len(),
            ValueIdents::Ids(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One function invocation within a job: which function to run, against which
/// target, with which cached inputs, producing which outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJobItem {
    /// Unique identifier of the function in the function repository.
    pub function_id: String,
    /// Opaque invocation parameters passed through to the function.
    pub parameters: serde_json::Value,
    pub target: TargetSpec,
    pub inputs: ValueIdents,
    pub outputs: ValueIdents,
}

impl CalculationJobItem {
    pub fn new(
        function_id: impl Into<String>,
        parameters: serde_json::Value,
        target: TargetSpec,
        inputs: Vec<ValueSpec>,
        outputs: Vec<ValueSpec>,
    ) -> Self {
        Self {
            function_id: function_id.into(),
            parameters,
            target,
            inputs: ValueIdents::Specs(inputs),
            outputs: ValueIdents::Specs(outputs),
        }
    }

    pub fn input_specs(&self) -> Result<&[ValueSpec]> {
        self.inputs.specs()
    }

    pub fn output_specs(&self) -> Result<&[ValueSpec]> {
        self.outputs.specs()
    }
}
