use serde::{Deserialize, Serialize};

use crate::training::scheduler::LrScheduler;

/// Top-level checkpoint metadata written to metadata.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Last completed epoch, 0-based.
    pub epoch: usize,
    /// Validation metric of `epoch`.
    pub metric: f64,
    /// Best validation metric seen up to and including `epoch`.
    pub best_metric: f64,
    pub timestamp: u64,
    pub model: String,
    pub optimizer: String,
    pub scheduler: LrScheduler,
}
