use std::path::PathBuf;

/// Errors that can occur when loading configuration or the split manifest.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),

    #[error("failed to read split manifest {path}: {source}")]
    ManifestRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed split manifest {path}: {source}")]
    ManifestParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("subject '{folder}' is missing its data file {path}")]
    MissingDataFile { folder: String, path: PathBuf },
}

/// Data integrity violations. Fatal for the offending subject.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("volume {subject} looks already normalized (max intensity {max} <= 1)")]
    PreNormalized { subject: String, max: f32 },

    #[error("label map {subject} contains label {label} outside the configured label set")]
    UnknownLabel { subject: String, label: u8 },

    #[error("shape mismatch for {subject}: volume {volume:?}, label map {label:?}")]
    ShapeMismatch {
        subject: String,
        volume: [usize; 3],
        label: [usize; 3],
    },

    #[error("patch of shape {patch:?} does not fit in volume of shape {volume:?}")]
    PatchTooLarge { patch: [usize; 3], volume: [usize; 3] },

    #[error("patch at offset {offset:?} with shape {patch:?} exceeds volume shape {volume:?}")]
    PatchOutOfBounds {
        offset: [usize; 3],
        patch: [usize; 3],
        volume: [usize; 3],
    },

    #[error("aggregation incomplete: {missing} of {total} voxels were never covered")]
    IncompleteCoverage { missing: usize, total: usize },

    #[error("subject {0} carries no training label map")]
    MissingLabel(String),

    #[error("failed to read array {path}: {message}")]
    Npy { path: PathBuf, message: String },

    #[error("tensor data error: {0}")]
    Tensor(String),
}

/// Errors raised while composing the training loss.
#[derive(Debug, thiserror::Error)]
pub enum LossError {
    #[error("loss term {term} produced a non-finite value ({value}); aborting run")]
    NonFinite { term: String, value: f32 },

    #[error("loss term {term} needs ground truth on an accelerator, got a host-only device")]
    HostDevice { term: String },

    #[error("predictions and ground truth live on different devices")]
    DeviceMismatch,

    #[error("expected {expected} class weights, got {got}")]
    WeightCount { expected: usize, got: usize },

    #[error("no loss term configured")]
    Empty,

    #[error("tensor data error: {0}")]
    Tensor(String),
}

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint directory not found: {0}")]
    DirNotFound(PathBuf),

    #[error("failed to read metadata from {path}: {source}")]
    MetadataRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse metadata from {path}: {source}")]
    MetadataParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to save record: {0}")]
    RecordSave(String),

    #[error("failed to load record: {0}")]
    RecordLoad(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of the rank group. Always fatal for the whole run.
#[derive(Debug, thiserror::Error)]
pub enum DistributedError {
    #[error("rank {rank} failed: {reason}")]
    RankFailure { rank: usize, reason: String },

    #[error("all-reduce length mismatch: expected {expected} values, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("rank thread panicked")]
    Panicked,
}

/// Errors that can occur during a training run.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("data integrity error: {0}")]
    Data(#[from] DataError),

    #[error("loss error: {0}")]
    Loss(#[from] LossError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("distributed error: {0}")]
    Distributed(#[from] DistributedError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("patch_shape must be > 0".to_string());
        assert_eq!(
            err.to_string(),
            "config validation error: patch_shape must be > 0"
        );
    }

    #[test]
    fn test_data_error_display() {
        let err = DataError::IncompleteCoverage {
            missing: 12,
            total: 64,
        };
        assert_eq!(
            err.to_string(),
            "aggregation incomplete: 12 of 64 voxels were never covered"
        );
    }

    #[test]
    fn test_loss_error_display() {
        let err = LossError::NonFinite {
            term: "DiceLoss".to_string(),
            value: f32::NAN,
        };
        assert_eq!(
            err.to_string(),
            "loss term DiceLoss produced a non-finite value (NaN); aborting run"
        );
    }

    #[test]
    fn test_training_error_from_distributed() {
        let err: TrainingError = DistributedError::RankFailure {
            rank: 1,
            reason: "out of memory".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "distributed error: rank 1 failed: out of memory"
        );
    }
}
