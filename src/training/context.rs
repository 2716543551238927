use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_appender::non_blocking::WorkerGuard;

use crate::checkpoint::CheckpointSlot;
use crate::config::AppConfig;
use crate::error::TrainingError;
use crate::logging;

/// Everything scoped to one training run: validated configuration, output
/// directory and the log writer. Dropping it flushes the log.
pub struct RunContext {
    config: Arc<AppConfig>,
    run_dir: PathBuf,
    _log_guard: Option<WorkerGuard>,
}

impl RunContext {
    pub fn new(config: AppConfig, verbose: bool) -> Result<Self, TrainingError> {
        config.validate()?;
        let run_dir = config.run_dir();
        std::fs::create_dir_all(&run_dir)?;
        let log_guard = logging::init(&config.logging, &run_dir, verbose)?;
        tracing::info!(title = %config.title, run_dir = %run_dir.display(), "run context ready");
        if let (false, Some(path)) = (config.trainer.do_train, &config.trainer.checkpoint_path) {
            tracing::warn!(
                path = %path.display(),
                "checkpoint_path ignored, evaluation uses the best checkpoint"
            );
        }
        Ok(RunContext {
            config: Arc::new(config),
            run_dir,
            _log_guard: log_guard,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.run_dir.join("checkpoints")
    }

    pub fn dump_dir(&self) -> PathBuf {
        self.run_dir.join("dumps")
    }

    /// Checkpoint to resume from. With training disabled this is always the
    /// run's `best` slot; otherwise the configured path, if any.
    pub fn resume_path(&self) -> Option<PathBuf> {
        let trainer = &self.config.trainer;
        if !trainer.do_train {
            return Some(self.checkpoint_dir().join(CheckpointSlot::Best.dir_name()));
        }
        trainer.checkpoint_path.clone()
    }
}
