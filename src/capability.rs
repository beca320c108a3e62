//! Capability matching between jobs and invokers.
//!
//! An invoker advertises a set of named numeric capabilities (for example
//! `nodeCount=8`). A job carries a set of requirements; the dispatcher only
//! offers the job to invokers whose capabilities satisfy every non-optional
//! requirement. A capability that a non-optional requirement names but the
//! invoker does not advertise fails the match.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Capability advertised by every invoker: how many calculation nodes back it.
pub const NODE_COUNT: &str = "nodeCount";

/// A named set of numeric capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeMap<String, f64>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Predicate applied to a single capability value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    AtLeast(f64),
    AtMost(f64),
    Exactly(f64),
}

impl Constraint {
    fn holds(&self, value: f64) -> bool {
        match *self {
            Constraint::AtLeast(bound) => value >= bound,
            Constraint::AtMost(bound) => value <= bound,
            Constraint::Exactly(expected) => value == expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequirement {
    pub name: String,
    pub constraint: Constraint,
    /// Optional requirements are skipped when the capability is absent but
    /// still enforced when it is present.
    pub optional: bool,
}

/// Requirements a job places on the invoker that may run it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequirements(Vec<CapabilityRequirement>);

impl CapabilityRequirements {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn require(mut self, name: impl Into<String>, constraint: Constraint) -> Self {
        self.0.push(CapabilityRequirement {
            name: name.into(),
            constraint,
            optional: false,
        });
        self
    }

    pub fn prefer(mut self, name: impl Into<String>, constraint: Constraint) -> Self {
        self.0.push(CapabilityRequirement {
            name: name.into(),
            constraint,
            optional: true,
        });
        self
    }

    pub fn satisfied_by(&self, capabilities: &CapabilitySet) -> bool {
        self.0.iter().all(|req| match capabilities.get(&req.name) {
            Some(value) => req.constraint.holds(value),
            None => req.optional,
        })
    }
}

/// Supplies the capability requirements for each job the dispatcher sees.
/// The default implementation places no requirements.
pub trait CapabilityRequirementsProvider: Send + Sync {
    fn requirements(&self, job: &crate::job::CalculationJob) -> CapabilityRequirements;
}

/// Provider that requires nothing of any invoker.
#[derive(Debug, Default)]
pub struct NoRequirements;

impl CapabilityRequirementsProvider for NoRequirements {
    fn requirements(&self, _job: &crate::job::CalculationJob) -> CapabilityRequirements {
        CapabilityRequirements::none()
    }
}
