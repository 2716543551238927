use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use burn::module::{AutodiffModule, Module};
use burn::record::DefaultRecorder;
use burn::tensor::backend::AutodiffBackend;

use crate::checkpoint::metadata::CheckpointMetadata;
use crate::error::CheckpointError;
use crate::training::optimizer::SegOptimizer;

const MODEL_FILE: &str = "model";
const OPTIMIZER_FILE: &str = "optimizer";
const METADATA_FILE: &str = "metadata.json";

/// The two retained checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointSlot {
    /// Overwritten only when the validation metric improves.
    Best,
    /// Overwritten every epoch.
    Last,
}

impl CheckpointSlot {
    pub fn dir_name(self) -> &'static str {
        match self {
            CheckpointSlot::Best => "best",
            CheckpointSlot::Last => "last",
        }
    }
}

/// A checkpoint read back into live objects.
pub struct RestoredCheckpoint<B: AutodiffBackend, M: AutodiffModule<B>> {
    pub model: M,
    pub optimizer: SegOptimizer<B, M>,
    pub metadata: CheckpointMetadata,
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Manages the `best` and `last` slots under one directory.
pub struct CheckpointManager {
    root: PathBuf,
}

impl CheckpointManager {
    pub fn new(root: PathBuf) -> Self {
        CheckpointManager { root }
    }

    pub fn slot_dir(&self, slot: CheckpointSlot) -> PathBuf {
        self.root.join(slot.dir_name())
    }

    /// Write model, optimizer and metadata into `slot`, replacing it
    /// atomically.
    pub fn save<B: AutodiffBackend, M: AutodiffModule<B>>(
        &self,
        slot: CheckpointSlot,
        model: &M,
        optimizer: &SegOptimizer<B, M>,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf, CheckpointError> {
        let tmp_dir = self.root.join(format!("{}.tmp", slot.dir_name()));
        let final_dir = self.slot_dir(slot);

        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        let recorder = DefaultRecorder::default();
        model
            .clone()
            .valid()
            .save_file(tmp_dir.join(MODEL_FILE), &recorder)
            .map_err(|e| CheckpointError::RecordSave(e.to_string()))?;
        optimizer.save(&tmp_dir.join(OPTIMIZER_FILE))?;

        let meta_json = serde_json::to_string_pretty(metadata)?;
        fs::write(tmp_dir.join(METADATA_FILE), meta_json)?;

        // Atomic rename
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&tmp_dir, &final_dir)?;
        Ok(final_dir)
    }

    pub fn load_metadata(dir: &Path) -> Result<CheckpointMetadata, CheckpointError> {
        if !dir.is_dir() {
            return Err(CheckpointError::DirNotFound(dir.to_path_buf()));
        }
        let meta_path = dir.join(METADATA_FILE);
        let meta_json = fs::read_to_string(&meta_path).map_err(|e| CheckpointError::MetadataRead {
            path: meta_path.clone(),
            source: e,
        })?;
        serde_json::from_str(&meta_json).map_err(|e| CheckpointError::MetadataParse {
            path: meta_path,
            source: e,
        })
    }

    /// Load a checkpoint directory written by [`CheckpointManager::save`]
    /// into `model` and `optimizer`.
    pub fn load<B: AutodiffBackend, M: AutodiffModule<B>>(
        dir: &Path,
        model: M,
        optimizer: SegOptimizer<B, M>,
        device: &B::Device,
    ) -> Result<RestoredCheckpoint<B, M>, CheckpointError> {
        let metadata = Self::load_metadata(dir)?;
        let recorder = DefaultRecorder::default();
        let model = model
            .load_file(dir.join(MODEL_FILE), &recorder, device)
            .map_err(|e| CheckpointError::RecordLoad(e.to_string()))?;
        let optimizer = optimizer.load(&dir.join(OPTIMIZER_FILE), device)?;
        Ok(RestoredCheckpoint {
            model,
            optimizer,
            metadata,
        })
    }
}
