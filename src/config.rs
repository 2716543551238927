use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LoggingConfig;
use crate::loss::LossConfig;
use crate::model::ModelConfig;
use crate::patch::{Augmentation, OverlapMode, SamplerKind};
use crate::training::distributed::DistributedConfig;
use crate::training::optimizer::OptimizerConfig;
use crate::training::scheduler::SchedulerConfig;
use crate::training::trainer::TrainerConfig;

pub const BACKGROUND: &str = "BACKGROUND";
pub const UNLABELED: &str = "UNLABELED";
pub const INSIDE: &str = "INSIDE";
pub const CONTOUR: &str = "CONTOUR";

/// Top-level application configuration, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub title: String,
    pub seed: u64,
    pub results_dir: PathBuf,
    pub data_loader: DataLoaderConfig,
    pub model: ModelConfig,
    pub loss: LossConfig,
    pub optimizer: OptimizerConfig,
    pub lr_scheduler: SchedulerConfig,
    pub trainer: TrainerConfig,
    pub distributed: DistributedConfig,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            title: "maxillo".to_string(),
            seed: 47,
            results_dir: PathBuf::from("results"),
            data_loader: DataLoaderConfig::default(),
            model: ModelConfig::default(),
            loss: LossConfig::default(),
            optimizer: OptimizerConfig::default(),
            lr_scheduler: SchedulerConfig::default(),
            trainer: TrainerConfig::default(),
            distributed: DistributedConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Where the optional extra training partition comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdditionalDataset {
    /// Naively propagated annotations, `synthetic.npy`.
    Naive,
    /// Network-generated annotations, `generated.npy`.
    Generated,
}

/// Patches drawn per subject per epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SamplesPerVolumeRepr", into = "SamplesPerVolumeRepr")]
pub enum SamplesPerVolume {
    Auto,
    Fixed(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum SamplesPerVolumeRepr {
    Count(usize),
    Keyword(String),
}

impl TryFrom<SamplesPerVolumeRepr> for SamplesPerVolume {
    type Error = String;

    fn try_from(repr: SamplesPerVolumeRepr) -> Result<Self, Self::Error> {
        match repr {
            SamplesPerVolumeRepr::Count(n) => Ok(SamplesPerVolume::Fixed(n)),
            SamplesPerVolumeRepr::Keyword(k) if k == "auto" => Ok(SamplesPerVolume::Auto),
            SamplesPerVolumeRepr::Keyword(k) => {
                Err(format!(
                    "samples_per_volume must be an integer or \"auto\", got \"{k}\""
                ))
            }
        }
    }
}

impl From<SamplesPerVolume> for SamplesPerVolumeRepr {
    fn from(value: SamplesPerVolume) -> Self {
        match value {
            SamplesPerVolume::Auto => SamplesPerVolumeRepr::Keyword("auto".to_string()),
            SamplesPerVolume::Fixed(n) => SamplesPerVolumeRepr::Count(n),
        }
    }
}

/// Data loading, preprocessing and patch sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataLoaderConfig {
    /// Root holding dense annotations (`gt_alpha*.npy`).
    pub file_path: PathBuf,
    /// Root holding volumes and sparse/synthetic annotations.
    pub sparse_path: PathBuf,
    /// JSON split manifest (partition -> folders).
    pub split_filepath: PathBuf,
    pub labels: BTreeMap<String, u8>,
    pub patch_shape: [usize; 3],
    pub resize_shape: [usize; 3],
    pub sampler_type: SamplerKind,
    /// Overlap of the training grid sampler.
    pub grid_overlap: usize,
    /// Overlap of the validation/test grid sampler.
    pub eval_overlap: usize,
    pub aggregation: OverlapMode,
    pub samples_per_volume: SamplesPerVolume,
    /// Prefetch queue capacity; defaults to 4x samples_per_volume.
    pub queue_length: Option<usize>,
    pub num_workers: usize,
    pub batch_size: usize,
    pub volumes_min: f32,
    pub volumes_max: f32,
    /// Fixed class weights; computed by median frequency balancing when absent.
    pub weights: Option<Vec<f32>>,
    pub additional_dataset: Option<AdditionalDataset>,
    pub is_competitor: bool,
    pub train_weight: f32,
    pub synthetic_weight: f32,
    /// Label-biased sampler probabilities by label name.
    pub label_probabilities: Option<BTreeMap<String, f32>>,
    /// Transforms applied to every training patch, in order.
    pub augmentations: Vec<Augmentation>,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(BACKGROUND.to_string(), 0);
        labels.insert(INSIDE.to_string(), 1);
        DataLoaderConfig {
            file_path: PathBuf::from("datasets/maxillo/DENSE"),
            sparse_path: PathBuf::from("datasets/maxillo/SPARSE"),
            split_filepath: PathBuf::from("configs/splits.json"),
            labels,
            patch_shape: [64, 64, 64],
            resize_shape: [152, 224, 256],
            sampler_type: SamplerKind::Grid,
            grid_overlap: 0,
            eval_overlap: 0,
            aggregation: OverlapMode::Average,
            samples_per_volume: SamplesPerVolume::Auto,
            queue_length: None,
            num_workers: 2,
            batch_size: 2,
            volumes_min: 0.0,
            volumes_max: 2100.0,
            weights: None,
            additional_dataset: None,
            is_competitor: false,
            train_weight: 1.0,
            synthetic_weight: 1.0,
            label_probabilities: None,
            augmentations: Vec::new(),
        }
    }
}

impl DataLoaderConfig {
    /// Resolved patches per subject. `Auto` fits the patch into the canonical
    /// shape along every axis.
    pub fn samples_per_volume(&self) -> usize {
        match self.samples_per_volume {
            SamplesPerVolume::Fixed(n) => n,
            SamplesPerVolume::Auto => self
                .resize_shape
                .iter()
                .zip(self.patch_shape.iter())
                .map(|(&r, &p)| (r as f64 / p as f64).round().max(1.0) as usize)
                .product(),
        }
    }

    pub fn queue_length(&self) -> usize {
        self.queue_length
            .unwrap_or_else(|| self.samples_per_volume() * 4)
            .max(1)
    }
}

/// Ordered view of the configured label map, indexed by label id.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelSet {
    names: Vec<String>,
}

impl LabelSet {
    /// Build from a name -> id map. Ids must be exactly `0..n` and
    /// `BACKGROUND` must be present.
    pub fn from_map(labels: &BTreeMap<String, u8>) -> Result<Self, ConfigError> {
        if labels.is_empty() {
            return Err(ConfigError::Validation("labels must not be empty".into()));
        }
        let n = labels.len();
        let mut names: Vec<Option<String>> = vec![None; n];
        for (name, &id) in labels {
            let idx = id as usize;
            if idx >= n {
                return Err(ConfigError::Validation(format!(
                    "label '{name}' has id {id}, ids must be contiguous from 0 to {}",
                    n - 1
                )));
            }
            if names[idx].is_some() {
                return Err(ConfigError::Validation(format!(
                    "label id {id} is used twice"
                )));
            }
            names[idx] = Some(name.clone());
        }
        let names: Vec<String> = names.into_iter().flatten().collect();
        if !names.iter().any(|n| n == BACKGROUND) {
            return Err(ConfigError::Validation(
                "labels must contain BACKGROUND".into(),
            ));
        }
        Ok(LabelSet { names })
    }

    pub fn num_classes(&self) -> usize {
        self.names.len()
    }

    pub fn name(&self, id: u8) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn id(&self, name: &str) -> Option<u8> {
        self.names.iter().position(|n| n == name).map(|i| i as u8)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.id(name).is_some()
    }

    pub fn contains(&self, id: u8) -> bool {
        (id as usize) < self.names.len()
    }

    pub fn background(&self) -> u8 {
        self.id(BACKGROUND).unwrap_or(0)
    }

    pub fn unlabeled(&self) -> Option<u8> {
        self.id(UNLABELED)
    }

    /// Ids that take part in class weighting (everything but UNLABELED).
    pub fn weighted_ids(&self) -> Vec<u8> {
        (0..self.names.len() as u8)
            .filter(|&id| Some(id) != self.unlabeled())
            .collect()
    }

    /// Ids optimized by the Dice term and scored by evaluation.
    pub fn objective_ids(&self) -> Vec<u8> {
        (0..self.names.len() as u8)
            .filter(|&id| id != self.background() && Some(id) != self.unlabeled())
            .collect()
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Per-experiment output directory.
    pub fn run_dir(&self) -> PathBuf {
        self.results_dir.join(&self.title)
    }

    pub fn label_set(&self) -> Result<LabelSet, ConfigError> {
        LabelSet::from_map(&self.data_loader.labels)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dl = &self.data_loader;
        let labels = self.label_set()?;
        if labels.objective_ids().is_empty() {
            return Err(ConfigError::Validation(
                "labels must contain at least one class besides BACKGROUND and UNLABELED".into(),
            ));
        }

        if self.title.trim().is_empty() {
            return Err(ConfigError::Validation("title must not be empty".into()));
        }
        if dl.patch_shape.iter().any(|&p| p == 0) {
            return Err(ConfigError::Validation(
                "data_loader.patch_shape must be > 0 on every axis".into(),
            ));
        }
        if dl
            .patch_shape
            .iter()
            .zip(dl.resize_shape.iter())
            .any(|(p, r)| p > r)
        {
            return Err(ConfigError::Validation(
                "data_loader.patch_shape must fit inside data_loader.resize_shape".into(),
            ));
        }
        let factor = 1usize << self.model.depth;
        if dl.patch_shape.iter().any(|&p| p % factor != 0) {
            return Err(ConfigError::Validation(format!(
                "data_loader.patch_shape must be divisible by {factor} for model.depth = {}",
                self.model.depth
            )));
        }
        if dl.grid_overlap >= dl.patch_shape.iter().copied().min().unwrap_or(0) {
            return Err(ConfigError::Validation(
                "data_loader.grid_overlap must be smaller than the patch".into(),
            ));
        }
        if dl.eval_overlap >= dl.patch_shape.iter().copied().min().unwrap_or(0) {
            return Err(ConfigError::Validation(
                "data_loader.eval_overlap must be smaller than the patch".into(),
            ));
        }
        if dl.samples_per_volume() == 0 {
            return Err(ConfigError::Validation(
                "data_loader.samples_per_volume must be > 0".into(),
            ));
        }
        if dl.batch_size == 0 {
            return Err(ConfigError::Validation(
                "data_loader.batch_size must be > 0".into(),
            ));
        }
        if dl.num_workers == 0 {
            return Err(ConfigError::Validation(
                "data_loader.num_workers must be >= 1".into(),
            ));
        }
        if dl.volumes_min < 0.0 || dl.volumes_max <= dl.volumes_min {
            return Err(ConfigError::Validation(
                "data_loader intensity bounds must satisfy 0 <= volumes_min < volumes_max".into(),
            ));
        }
        if let Some(weights) = &dl.weights {
            if weights.len() != labels.num_classes() {
                return Err(ConfigError::Validation(format!(
                    "data_loader.weights has {} entries for {} labels",
                    weights.len(),
                    labels.num_classes()
                )));
            }
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(ConfigError::Validation(
                    "data_loader.weights must be finite and >= 0".into(),
                ));
            }
        }
        if dl.train_weight <= 0.0 || dl.synthetic_weight <= 0.0 {
            return Err(ConfigError::Validation(
                "data_loader partition weights must be > 0".into(),
            ));
        }
        if let Some(probs) = &dl.label_probabilities {
            for (name, p) in probs {
                if !labels.contains_name(name) {
                    return Err(ConfigError::Validation(format!(
                        "data_loader.label_probabilities references unknown label '{name}'"
                    )));
                }
                if !p.is_finite() || *p < 0.0 {
                    return Err(ConfigError::Validation(
                        "data_loader.label_probabilities must be >= 0".into(),
                    ));
                }
            }
            if probs.values().sum::<f32>() <= 0.0 {
                return Err(ConfigError::Validation(
                    "data_loader.label_probabilities must not all be zero".into(),
                ));
            }
        }

        for augmentation in &dl.augmentations {
            augmentation.validate()?;
        }

        if self.model.base_channels == 0 {
            return Err(ConfigError::Validation(
                "model.base_channels must be > 0".into(),
            ));
        }
        if self.model.depth == 0 || self.model.depth > 5 {
            return Err(ConfigError::Validation(
                "model.depth must be in [1, 5]".into(),
            ));
        }

        if self.loss.names().is_empty() {
            return Err(ConfigError::Validation(
                "loss.name must not be empty".into(),
            ));
        }

        if self.optimizer.learning_rate <= 0.0 {
            return Err(ConfigError::Validation(
                "optimizer.learning_rate must be > 0".into(),
            ));
        }
        if self.optimizer.momentum < 0.0 || self.optimizer.weight_decay < 0.0 {
            return Err(ConfigError::Validation(
                "optimizer.momentum and optimizer.weight_decay must be >= 0".into(),
            ));
        }

        if self.lr_scheduler.factor <= 0.0 || self.lr_scheduler.factor >= 1.0 {
            return Err(ConfigError::Validation(
                "lr_scheduler.factor must be in (0, 1)".into(),
            ));
        }

        if self.trainer.epochs == 0 {
            return Err(ConfigError::Validation("trainer.epochs must be > 0".into()));
        }
        if self.trainer.test_interval == 0 {
            return Err(ConfigError::Validation(
                "trainer.test_interval must be > 0".into(),
            ));
        }
        if self.trainer.divergence_threshold < 0.0 {
            return Err(ConfigError::Validation(
                "trainer.divergence_threshold must be >= 0".into(),
            ));
        }

        if self.distributed.world_size == 0 {
            return Err(ConfigError::Validation(
                "distributed.world_size must be >= 1".into(),
            ));
        }

        Ok(())
    }

    /// Generate a TOML string with all default values (useful for creating
    /// example config files).
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        config.validate().expect("default config should be valid");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[optimizer]
learning_rate = 0.001
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert!((config.optimizer.learning_rate - 0.001).abs() < 1e-9);
        assert_eq!(config.data_loader.resize_shape, [152, 224, 256]);
        assert_eq!(config.seed, 47);
    }

    #[test]
    fn test_samples_per_volume_auto_and_fixed() {
        let mut dl = DataLoaderConfig {
            patch_shape: [64, 64, 64],
            resize_shape: [152, 224, 256],
            ..Default::default()
        };
        // round(2.375) * round(3.5) * round(4.0) = 2 * 4 * 4
        assert_eq!(dl.samples_per_volume(), 32);
        assert_eq!(dl.queue_length(), 128);

        dl.samples_per_volume = SamplesPerVolume::Fixed(5);
        assert_eq!(dl.samples_per_volume(), 5);
    }

    #[test]
    fn test_samples_per_volume_parses_keyword_and_integer() {
        let config: AppConfig = toml::from_str(
            r#"
[data_loader]
samples_per_volume = "auto"
"#,
        )
        .unwrap();
        assert_eq!(
            config.data_loader.samples_per_volume,
            SamplesPerVolume::Auto
        );

        let config: AppConfig = toml::from_str(
            r#"
[data_loader]
samples_per_volume = 12
"#,
        )
        .unwrap();
        assert_eq!(
            config.data_loader.samples_per_volume,
            SamplesPerVolume::Fixed(12)
        );

        let bad: Result<AppConfig, _> = toml::from_str(
            r#"
[data_loader]
samples_per_volume = "many"
"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_unknown_loss_name_is_rejected() {
        let bad: Result<AppConfig, _> = toml::from_str(
            r#"
[loss]
name = "FocalLoss"
"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_unknown_optimizer_name_is_rejected() {
        let bad: Result<AppConfig, _> = toml::from_str(
            r#"
[optimizer]
name = "Lion"
"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_unknown_augmentation_name_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[data_loader.augmentations]]
name = "RandomElasticDeformation"
"#
        )
        .unwrap();
        let err = AppConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse(_)));
    }

    #[test]
    fn test_validation_checks_augmentation_parameters() {
        let mut config = AppConfig::default();
        config.data_loader.augmentations = vec![Augmentation::RandomFlip {
            axes: vec![2],
            flip_probability: 1.5,
        }];
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_label_set_orders_by_id() {
        let mut map = BTreeMap::new();
        map.insert("UNLABELED".to_string(), 2);
        map.insert("BACKGROUND".to_string(), 0);
        map.insert("INSIDE".to_string(), 1);
        map.insert("CONTOUR".to_string(), 3);
        let labels = LabelSet::from_map(&map).unwrap();
        assert_eq!(labels.num_classes(), 4);
        assert_eq!(labels.name(2), Some("UNLABELED"));
        assert_eq!(labels.background(), 0);
        assert_eq!(labels.unlabeled(), Some(2));
        assert_eq!(labels.weighted_ids(), vec![0, 1, 3]);
        assert_eq!(labels.objective_ids(), vec![1, 3]);
    }

    #[test]
    fn test_label_set_requires_background() {
        let mut map = BTreeMap::new();
        map.insert("INSIDE".to_string(), 0);
        assert!(LabelSet::from_map(&map).is_err());
    }

    #[test]
    fn test_label_set_rejects_sparse_ids() {
        let mut map = BTreeMap::new();
        map.insert("BACKGROUND".to_string(), 0);
        map.insert("INSIDE".to_string(), 4);
        assert!(LabelSet::from_map(&map).is_err());
    }

    #[test]
    fn test_validation_rejects_patch_larger_than_volume() {
        let mut config = AppConfig::default();
        config.data_loader.patch_shape = [256, 64, 64];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_patch_not_divisible_by_depth() {
        let mut config = AppConfig::default();
        config.model.depth = 3;
        config.data_loader.patch_shape = [60, 64, 64];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_negative_intensity_min() {
        let mut config = AppConfig::default();
        config.data_loader.volumes_min = -1000.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_wrong_weight_count() {
        let mut config = AppConfig::default();
        config.data_loader.weights = Some(vec![0.5, 0.25, 0.25]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_background_only_labels() {
        let mut config = AppConfig::default();
        config.data_loader.labels.remove(INSIDE);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_world_size() {
        let mut config = AppConfig::default();
        config.distributed.world_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = AppConfig::load_or_default(Path::new("nonexistent_config.toml")).unwrap();
        assert_eq!(config.trainer.epochs, TrainerConfig::default().epochs);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
title = "alveolar"

[trainer]
epochs = 7

[data_loader.labels]
BACKGROUND = 0
INSIDE = 1
UNLABELED = 2
"#
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.trainer.epochs, 7);
        assert_eq!(config.run_dir(), PathBuf::from("results").join("alveolar"));
        assert_eq!(config.label_set().unwrap().unlabeled(), Some(2));
    }

    #[test]
    fn test_default_toml_roundtrips() {
        let toml_str = AppConfig::default_toml().unwrap();
        let config: AppConfig = toml::from_str(&toml_str).unwrap();
        config.validate().expect("roundtripped config should be valid");
    }
}
