//! Value cache collaborator.
//!
//! The dispatch core never owns domain values; it reads item inputs from and
//! writes item outputs to an external cache addressed by (cycle id, calc
//! config). The traits here are the seam; the in-memory implementation backs
//! tests and the demo binary.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::values::{CalcValue, ComputedValue, ValueSpec};

/// Sink for rough value sizes observed while writing, fed into invocation
/// statistics.
pub trait SizeHintSink: Send {
    fn value_written(&mut self, bytes: usize);
}

/// Size sink that totals bytes written.
#[derive(Debug, Default)]
pub struct TotalSizeSink {
    pub bytes: usize,
    pub values: usize,
}

impl SizeHintSink for TotalSizeSink {
    fn value_written(&mut self, bytes: usize) {
        self.bytes += bytes;
        self.values += 1;
    }
}

/// One cycle/configuration's view of the value store. Implementations must
/// be safe for concurrent use by multiple calculation nodes.
pub trait ValueCache: Send + Sync {
    /// Looks up the given keys. Keys with no entry yield `None`; entries may
    /// also hold missing-value markers, which callers treat as absent input.
    fn get_values(&self, keys: &[ValueSpec]) -> Vec<(ValueSpec, Option<CalcValue>)>;

    fn put_values(&self, values: Vec<ComputedValue>, sizes: &mut dyn SizeHintSink);
}

/// Hands out the cache for a (cycle, calc config) pair.
pub trait ValueCacheSource: Send + Sync {
    fn cache(&self, cycle_id: Uuid, calc_config: &str) -> std::sync::Arc<dyn ValueCache>;
}

/// In-memory cache, one map per (cycle, calc config).
#[derive(Default)]
pub struct InMemoryCacheSource {
    caches: Mutex<HashMap<(Uuid, String), std::sync::Arc<InMemoryCache>>>,
}

impl InMemoryCacheSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ValueCacheSource for InMemoryCacheSource {
    fn cache(&self, cycle_id: Uuid, calc_config: &str) -> std::sync::Arc<dyn ValueCache> {
        let mut caches = self.caches.lock().expect("cache source poisoned");
        caches
            .entry((cycle_id, calc_config.to_string()))
            .or_default()
            .clone()
    }
}

#[derive(Default)]
pub struct InMemoryCache {
    values: Mutex<HashMap<ValueSpec, CalcValue>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a value directly, bypassing size accounting. Test setup helper.
    pub fn seed(&self, spec: ValueSpec, value: CalcValue) {
        self.values
            .lock()
            .expect("cache poisoned")
            .insert(spec, value);
    }

    pub fn get(&self, spec: &ValueSpec) -> Option<CalcValue> {
        self.values.lock().expect("cache poisoned").get(spec).cloned()
    }
}

impl ValueCache for InMemoryCache {
    fn get_values(&self, keys: &[ValueSpec]) -> Vec<(ValueSpec, Option<CalcValue>)> {
        let values = self.values.lock().expect("cache poisoned");
        keys.iter()
            .map(|key| (key.clone(), values.get(key).cloned()))
            .collect()
    }

    fn put_values(&self, new_values: Vec<ComputedValue>, sizes: &mut dyn SizeHintSink) {
        let mut values = self.values.lock().expect("cache poisoned");
        for value in new_values {
            sizes.value_written(value.value.estimate_size());
            values.insert(value.spec, value.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::{TargetKind, TargetSpec};

    fn spec(name: &str) -> ValueSpec {
        ValueSpec::new(name, TargetSpec::new(TargetKind::Position, "P1"), "fn-a")
    }

    #[test]
    fn get_values_reports_absent_keys() {
        let cache = InMemoryCache::new();
        cache.seed(spec("PresentValue"), CalcValue::Data(serde_json::json!(1.5)));

        let got = cache.get_values(&[spec("PresentValue"), spec("Delta")]);
        assert_eq!(got.len(), 2);
        assert!(got[0].1.is_some());
        assert!(got[1].1.is_none());
    }

    #[test]
    fn put_values_feeds_size_sink() {
        let cache = InMemoryCache::new();
        let mut sizes = TotalSizeSink::default();
        cache.put_values(
            vec![
                ComputedValue::data(spec("PresentValue"), serde_json::json!(1.0)),
                ComputedValue::new(spec("Delta"), CalcValue::EvaluationError),
            ],
            &mut sizes,
        );
        assert_eq!(sizes.values, 2);
        assert_eq!(sizes.bytes, 8);
    }

    #[test]
    fn source_returns_same_cache_for_same_key() {
        let source = InMemoryCacheSource::new();
        let cycle = Uuid::new_v4();
        let a = source.cache(cycle, "Default");
        a.put_values(
            vec![ComputedValue::data(spec("PresentValue"), serde_json::json!(2.0))],
            &mut TotalSizeSink::default(),
        );
        let b = source.cache(cycle, "Default");
        assert!(b.get_values(&[spec("PresentValue")])[0].1.is_some());

        let other = source.cache(Uuid::new_v4(), "Default");
        assert!(other.get_values(&[spec("PresentValue")])[0].1.is_none());
    }
}
