use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one calculation job. Used as a map key throughout the
/// dispatcher and the remote protocol; equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CalculationJobSpec {
    /// The computation cycle this job belongs to.
    pub cycle_id: Uuid,
    /// Name of the calculation configuration, e.g. `"Default"`.
    pub calc_config: String,
    /// Valuation instant the cycle is computed for.
    pub valuation_time: DateTime<Utc>,
    /// Job number, unique within the process that partitioned the cycle.
    pub job_id: u64,
}

impl CalculationJobSpec {
    pub fn new(
        cycle_id: Uuid,
        calc_config: impl Into<String>,
        valuation_time: DateTime<Utc>,
        job_id: u64,
    ) -> Self {
        Self {
            cycle_id,
            calc_config: calc_config.into(),
            valuation_time,
            job_id,
        }
    }

    /// Same cycle and configuration, different job number. Tail jobs are
    /// numbered off their parent this way.
    pub fn with_job_id(&self, job_id: u64) -> Self {
        Self {
            cycle_id: self.cycle_id,
            calc_config: self.calc_config.clone(),
            valuation_time: self.valuation_time,
            job_id,
        }
    }
}

impl std::fmt::Display for CalculationJobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.cycle_id, self.calc_config, self.job_id
        )
    }
}
