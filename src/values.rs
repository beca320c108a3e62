//! Value addressing for the computation cache.
//!
//! A [`ValueSpec`] names a single computed value: what it is, which target it
//! was computed for, and which function produced it. Specs are used as cache
//! keys and to correlate job item inputs with outputs, so they are cheap to
//! hash and compare. On the wire they may be replaced by compact numeric
//! identifiers (see [`crate::identifier::IdentifierMap`]).

use serde::{Deserialize, Serialize};

/// What a computation target is: a portfolio node, a single position, a
/// security, or the whole view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetKind {
    Portfolio,
    Position,
    Security,
    Primitive,
}

/// Identifies the object a value was computed for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetSpec {
    pub kind: TargetKind,
    pub id: String,
}

impl TargetSpec {
    pub fn new(kind: TargetKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}~{}", self.kind, self.id)
    }
}

/// Addresses one computed value in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueSpec {
    /// The value name, e.g. `"PresentValue"`.
    pub name: String,
    pub target: TargetSpec,
    /// Unique identifier of the function that produces this value.
    pub function_id: String,
}

impl ValueSpec {
    pub fn new(
        name: impl Into<String>,
        target: TargetSpec,
        function_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            function_id: function_id.into(),
        }
    }
}

impl std::fmt::Display for ValueSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.name, self.target)
    }
}

/// A cache payload: either real data or a typed marker explaining why the
/// value is absent. Dependent jobs observe the marker as a missing input
/// instead of stalling on a value that will never arrive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalcValue {
    Data(serde_json::Value),
    /// The producing item could not run because its own inputs were missing.
    MissingInputs,
    /// The producing function threw.
    EvaluationError,
    /// The producing item was suppressed by a function blacklist.
    Suppressed,
}

impl CalcValue {
    /// True for the marker variants; markers count as missing when gathered
    /// as inputs.
    pub fn is_missing(&self) -> bool {
        !matches!(self, CalcValue::Data(_))
    }

    /// Rough in-memory size used for invocation statistics.
    pub fn estimate_size(&self) -> usize {
        match self {
            CalcValue::Data(v) => estimate_json_size(v),
            _ => 0,
        }
    }
}

fn estimate_json_size(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Null => 4,
        serde_json::Value::Bool(_) => 1,
        serde_json::Value::Number(_) => 8,
        serde_json::Value::String(s) => s.len(),
        serde_json::Value::Array(items) => items.iter().map(estimate_json_size).sum(),
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| k.len() + estimate_json_size(v))
            .sum(),
    }
}

/// A value paired with the spec that addresses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedValue {
    pub spec: ValueSpec,
    pub value: CalcValue,
}

impl ComputedValue {
    pub fn new(spec: ValueSpec, value: CalcValue) -> Self {
        Self { spec, value }
    }

    pub fn data(spec: ValueSpec, value: serde_json::Value) -> Self {
        Self {
            spec,
            value: CalcValue::Data(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ValueSpec {
        ValueSpec::new(
            name,
            TargetSpec::new(TargetKind::Position, "P1"),
            "fn-test",
        )
    }

    #[test]
    fn markers_are_missing() {
        assert!(CalcValue::MissingInputs.is_missing());
        assert!(CalcValue::EvaluationError.is_missing());
        assert!(CalcValue::Suppressed.is_missing());
        assert!(!CalcValue::Data(serde_json::json!(42.0)).is_missing());
    }

    #[test]
    fn spec_equality_is_structural() {
        assert_eq!(spec("PresentValue"), spec("PresentValue"));
        assert_ne!(spec("PresentValue"), spec("Delta"));
    }

    #[test]
    fn size_estimate_counts_data_only() {
        let v = ComputedValue::data(spec("PresentValue"), serde_json::json!([1.0, 2.0, 3.0]));
        assert_eq!(v.value.estimate_size(), 24);
        assert_eq!(CalcValue::EvaluationError.estimate_size(), 0);
    }
}
