use std::path::Path;

use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer, Sgd, SgdConfig};
use burn::record::{DefaultRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    Adam,
    #[serde(rename = "SGD")]
    Sgd,
}

impl OptimizerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OptimizerKind::Adam => "Adam",
            OptimizerKind::Sgd => "SGD",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub name: OptimizerKind,
    pub learning_rate: f64,
    /// SGD only; 0 disables momentum.
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            name: OptimizerKind::Adam,
            learning_rate: 1e-4,
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }
}

/// The configured optimizer over a model `M`.
pub enum SegOptimizer<B: AutodiffBackend, M: AutodiffModule<B>> {
    Adam(OptimizerAdaptor<Adam, M, B>),
    Sgd(OptimizerAdaptor<Sgd<B::InnerBackend>, M, B>),
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> SegOptimizer<B, M> {
    pub fn new(config: &OptimizerConfig) -> Self {
        let decay = (config.weight_decay > 0.0)
            .then(|| WeightDecayConfig::new(config.weight_decay as f32));
        match config.name {
            OptimizerKind::Adam => {
                SegOptimizer::Adam(AdamConfig::new().with_weight_decay(decay).init())
            }
            OptimizerKind::Sgd => {
                let momentum = (config.momentum > 0.0)
                    .then(|| MomentumConfig::new().with_momentum(config.momentum));
                SegOptimizer::Sgd(
                    SgdConfig::new()
                        .with_momentum(momentum)
                        .with_weight_decay(decay)
                        .init(),
                )
            }
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        match self {
            SegOptimizer::Adam(_) => OptimizerKind::Adam,
            SegOptimizer::Sgd(_) => OptimizerKind::Sgd,
        }
    }

    pub fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        match self {
            SegOptimizer::Adam(optim) => optim.step(lr, module, grads),
            SegOptimizer::Sgd(optim) => optim.step(lr, module, grads),
        }
    }

    /// Write the optimizer state to `path` (`.mpk` is appended).
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let recorder = DefaultRecorder::default();
        let result = match self {
            SegOptimizer::Adam(optim) => {
                Recorder::<B>::record(&recorder, optim.to_record(), path.to_path_buf())
            }
            SegOptimizer::Sgd(optim) => {
                Recorder::<B>::record(&recorder, optim.to_record(), path.to_path_buf())
            }
        };
        result.map_err(|e| CheckpointError::RecordSave(format!("{}: {e}", path.display())))
    }

    /// Restore state written by [`SegOptimizer::save`].
    pub fn load(self, path: &Path, device: &B::Device) -> Result<Self, CheckpointError> {
        let recorder = DefaultRecorder::default();
        let err = |e: burn::record::RecorderError| {
            CheckpointError::RecordLoad(format!("{}: {e}", path.display()))
        };
        Ok(match self {
            SegOptimizer::Adam(optim) => {
                let record =
                    Recorder::<B>::load(&recorder, path.to_path_buf(), device).map_err(err)?;
                SegOptimizer::Adam(optim.load_record(record))
            }
            SegOptimizer::Sgd(optim) => {
                let record =
                    Recorder::<B>::load(&recorder, path.to_path_buf(), device).map_err(err)?;
                SegOptimizer::Sgd(optim.load_record(record))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimizer_names() {
        let sgd: OptimizerConfig = toml::from_str("name = \"SGD\"\nmomentum = 0.9").unwrap();
        assert_eq!(sgd.name, OptimizerKind::Sgd);
        assert_eq!(sgd.learning_rate, OptimizerConfig::default().learning_rate);
        assert!(toml::from_str::<OptimizerConfig>("name = \"sgd\"").is_err());
    }
}
