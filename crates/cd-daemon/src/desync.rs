use cd_core::config::BatchConfig;
use cd_core::types::TargetSnapshot;

use crate::tracker::Batch;

/// Decides whether a finished batch left its target off baseline.
///
/// Consulted once per due batch, with the target state observed after the
/// batch's expected end. Implementations must be deterministic in their
/// inputs.
pub trait DesyncPolicy: Send + Sync {
    fn is_desynced(&self, batch: &Batch, observed: &TargetSnapshot) -> bool;
}

/// Default policy: a batch is desynced when the observed target is not at
/// baseline within the configured tolerances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToleranceDesyncPolicy {
    pub yield_tolerance: f64,
    pub defense_tolerance: f64,
}

impl ToleranceDesyncPolicy {
    pub fn new(yield_tolerance: f64, defense_tolerance: f64) -> Self {
        Self {
            yield_tolerance,
            defense_tolerance,
        }
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(config.yield_tolerance, config.defense_tolerance)
    }
}

impl DesyncPolicy for ToleranceDesyncPolicy {
    fn is_desynced(&self, _batch: &Batch, observed: &TargetSnapshot) -> bool {
        !observed.is_at_baseline(self.yield_tolerance, self.defense_tolerance)
    }
}
