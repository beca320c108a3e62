pub mod item;
pub mod result;
pub mod spec;

#[allow(clippy::module_inception)]
mod job;

pub use item::{CalculationJobItem, ValueIdents};
pub use job::{CacheSelectHint, CalculationJob};
pub use result::{CalculationJobResult, CalculationJobResultItem};
pub use spec::CalculationJobSpec;
