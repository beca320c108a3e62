//! Spec/identifier conversion for wire compaction.
//!
//! Value specifications are verbose; on the wire a job's input and output
//! keys can be replaced by numeric identifiers agreed between dispatcher and
//! node host. The remote adapters convert before transmission and resolve
//! after receipt; the rest of the system only ever sees full specs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{CalcGridError, Result};
use crate::job::ValueIdents;
use crate::values::ValueSpec;

pub trait IdentifierMap: Send + Sync {
    /// Replaces full specs with identifiers. Specs without an identifier are
    /// passed through unchanged, so conversion never fails.
    fn convert(&self, idents: &ValueIdents) -> ValueIdents;

    /// Replaces identifiers with full specs. An unknown identifier is an
    /// error; it means the two ends disagree about the mapping.
    fn resolve(&self, idents: &ValueIdents) -> Result<ValueIdents>;
}

/// Identifier map that assigns identifiers on first sight. Both ends of a
/// connection derive the same numbering only if fed the same specs in the
/// same order, so this is suitable for tests and single-process setups.
#[derive(Default)]
pub struct InMemoryIdentifierMap {
    next_id: AtomicU64,
    inner: Mutex<MapState>,
}

#[derive(Default)]
struct MapState {
    by_spec: HashMap<ValueSpec, u64>,
    by_id: HashMap<u64, ValueSpec>,
}

impl InMemoryIdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn identifier_for(&self, spec: &ValueSpec) -> u64 {
        let mut state = self.inner.lock().expect("identifier map poisoned");
        if let Some(&id) = state.by_spec.get(spec) {
            return id;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state.by_spec.insert(spec.clone(), id);
        state.by_id.insert(id, spec.clone());
        id
    }
}

impl IdentifierMap for InMemoryIdentifierMap {
    fn convert(&self, idents: &ValueIdents) -> ValueIdents {
        match idents {
            ValueIdents::Ids(ids) => ValueIdents::Ids(ids.clone()),
            ValueIdents::Specs(specs) => {
                ValueIdents::Ids(specs.iter().map(|s| self.identifier_for(s)).collect())
            }
        }
    }

    fn resolve(&self, idents: &ValueIdents) -> Result<ValueIdents> {
        match idents {
            ValueIdents::Specs(specs) => Ok(ValueIdents::Specs(specs.clone())),
            ValueIdents::Ids(ids) => {
                let state = self.inner.lock().expect("identifier map poisoned");
                let specs = ids
                    .iter()
                    .map(|id| {
                        state
                            .by_id
                            .get(id)
                            .cloned()
                            .ok_or(CalcGridError::UnknownIdentifier(*id))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(ValueIdents::Specs(specs))
            }
        }
    }
}

/// Identifier map that never converts; jobs travel with full specs.
#[derive(Debug, Default)]
pub struct PassthroughIdentifierMap;

impl IdentifierMap for PassthroughIdentifierMap {
    fn convert(&self, idents: &ValueIdents) -> ValueIdents {
        idents.clone()
    }

    fn resolve(&self, idents: &ValueIdents) -> Result<ValueIdents> {
        match idents {
            ValueIdents::Specs(_) => Ok(idents.clone()),
            ValueIdents::Ids(ids) => Err(CalcGridError::UnknownIdentifier(
                ids.first().copied().unwrap_or_default(),
            )),
        }
    }
}
