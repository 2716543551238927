mod manager;
mod metadata;

pub use manager::{now_secs, CheckpointManager, CheckpointSlot, RestoredCheckpoint};
pub use metadata::CheckpointMetadata;
