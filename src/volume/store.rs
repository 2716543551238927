use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::Array3;

use crate::config::{AdditionalDataset, DataLoaderConfig, LabelSet, CONTOUR};
use crate::error::{ConfigError, DataError, TrainingError};
use crate::volume::io::{read_labels, read_volume};
use crate::volume::preprocess::{crop_or_pad, foreground_count, normalize};
use crate::volume::{LabelMap, Partition, Provenance, SplitManifest, Subject, Volume};

/// Turns raw (volume, label) arrays into canonical [`Subject`]s.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    min: f32,
    max: f32,
    canonical: [usize; 3],
    labels: LabelSet,
}

impl Preprocessor {
    pub fn new(config: &DataLoaderConfig, labels: LabelSet) -> Self {
        Preprocessor {
            min: config.volumes_min,
            max: config.volumes_max,
            canonical: config.resize_shape,
            labels,
        }
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn canonical_shape(&self) -> [usize; 3] {
        self.canonical
    }

    /// Validate, normalize and crop/pad one subject.
    pub fn prepare(
        &self,
        raw_volume: Array3<f32>,
        raw_labels: Array3<u8>,
        provenance: Provenance,
    ) -> Result<Subject, DataError> {
        let subject = provenance.folder.clone();

        let max = raw_volume.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if max <= 1.0 {
            return Err(DataError::PreNormalized { subject, max });
        }
        if raw_volume.dim() != raw_labels.dim() {
            let (vz, vh, vw) = raw_volume.dim();
            let (lz, lh, lw) = raw_labels.dim();
            return Err(DataError::ShapeMismatch {
                subject,
                volume: [vz, vh, vw],
                label: [lz, lh, lw],
            });
        }
        if let Some(&label) = raw_labels.iter().find(|&&v| !self.labels.contains(v)) {
            return Err(DataError::UnknownLabel { subject, label });
        }

        let background = self.labels.background();
        let before = foreground_count(&raw_labels, background);

        let scaled = normalize(&raw_volume, self.min, self.max);
        let volume = crop_or_pad(&scaled, self.canonical, 0.0);
        let labels = crop_or_pad(&raw_labels, self.canonical, background);

        let after = foreground_count(&labels, background);
        if before != after {
            tracing::warn!(
                subject = %subject,
                partition = %provenance.partition,
                before,
                after,
                "crop to canonical shape dropped ground-truth voxels"
            );
        }

        Ok(Subject::new(
            Volume::new(volume),
            LabelMap::new(labels),
            provenance,
        ))
    }
}

/// Loads every subject named by the split manifest.
pub struct VolumeStore {
    config: DataLoaderConfig,
    preprocessor: Preprocessor,
    subjects: HashMap<Partition, Vec<Arc<Subject>>>,
}

impl VolumeStore {
    /// Read the split manifest and load all partitions needed for this run.
    ///
    /// `train` and `synthetic` are skipped when `do_train` is false;
    /// `synthetic` is skipped when no additional dataset is configured.
    pub fn open(
        config: &DataLoaderConfig,
        labels: LabelSet,
        do_train: bool,
    ) -> Result<Self, TrainingError> {
        let mut manifest = SplitManifest::load(&config.split_filepath)?;
        tracing::info!(path = %config.split_filepath.display(), "loaded split manifest");

        if !do_train {
            manifest.clear(Partition::Train);
            manifest.clear(Partition::Synthetic);
            tracing::info!("training is disabled, skipping train and synthetic partitions");
        } else if let Some(dataset) = config.additional_dataset {
            tracing::info!(?dataset, "using additional synthetic dataset");
        } else {
            manifest.clear(Partition::Synthetic);
        }

        let mut store = VolumeStore {
            config: config.clone(),
            preprocessor: Preprocessor::new(config, labels),
            subjects: HashMap::new(),
        };

        for partition in Partition::ALL {
            let folders = manifest.folders(partition);
            tracing::info!(%partition, total = folders.len(), "loading partition");
            let mut loaded = Vec::with_capacity(folders.len());
            for folder in folders {
                let subject = store.load_subject(folder, partition)?;
                loaded.push(Arc::new(subject));
            }
            store.subjects.insert(partition, loaded);
        }

        tracing::info!(folders = ?manifest.val, "validation set");
        tracing::info!(folders = ?manifest.test, "test set");
        Ok(store)
    }

    /// Build a store from already prepared subjects.
    pub fn from_subjects(
        config: &DataLoaderConfig,
        labels: LabelSet,
        subjects: Vec<Subject>,
    ) -> Self {
        let mut grouped: HashMap<Partition, Vec<Arc<Subject>>> = HashMap::new();
        for subject in subjects {
            grouped.entry(subject.partition()).or_default().push(Arc::new(subject));
        }
        VolumeStore {
            config: config.clone(),
            preprocessor: Preprocessor::new(config, labels),
            subjects: grouped,
        }
    }

    fn partition_weight(&self, partition: Partition) -> f32 {
        match partition {
            Partition::Train => self.config.train_weight,
            Partition::Synthetic => self.config.synthetic_weight,
            Partition::Val | Partition::Test => 1.0,
        }
    }

    /// Paths of the volume and the ground truth for `folder`.
    pub fn data_paths(&self, folder: &str, partition: Partition) -> (PathBuf, PathBuf) {
        let sparse = self.config.sparse_path.join(folder);
        let data_path = sparse.join("data.npy");

        let gt_path = match partition {
            Partition::Synthetic => match self.config.additional_dataset {
                Some(AdditionalDataset::Generated) => sparse.join("generated.npy"),
                _ => synthetic_gt(&sparse),
            },
            Partition::Train | Partition::Val if self.config.is_competitor => synthetic_gt(&sparse),
            _ => {
                let name = if self.preprocessor.labels().contains_name(CONTOUR) {
                    "gt_alpha_multi.npy"
                } else {
                    "gt_alpha.npy"
                };
                self.config.file_path.join(folder).join(name)
            }
        };
        (data_path, gt_path)
    }

    fn load_subject(&self, folder: &str, partition: Partition) -> Result<Subject, TrainingError> {
        let (data_path, gt_path) = self.data_paths(folder, partition);
        for path in [&data_path, &gt_path] {
            if !path.is_file() {
                return Err(ConfigError::MissingDataFile {
                    folder: folder.to_string(),
                    path: path.clone(),
                }
                .into());
            }
        }

        let raw_volume = read_volume(&data_path)?;
        let raw_labels = read_labels(&gt_path)?;
        let provenance = Provenance {
            data_path,
            gt_path,
            folder: folder.to_string(),
            partition,
            weight: self.partition_weight(partition),
        };
        tracing::debug!(folder, %partition, "preparing subject");
        let subject = self.preprocessor.prepare(raw_volume, raw_labels, provenance)?;
        Ok(subject)
    }

    /// Training needs a validation partition to select `best` and to
    /// detect a collapsed metric.
    pub fn require_validation(&self) -> Result<(), ConfigError> {
        if self.subjects(Partition::Val).is_empty() {
            return Err(ConfigError::Validation(
                "training requires a non-empty val partition".into(),
            ));
        }
        Ok(())
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    pub fn labels(&self) -> &LabelSet {
        self.preprocessor.labels()
    }

    pub fn subjects(&self, partition: Partition) -> &[Arc<Subject>] {
        self.subjects.get(&partition).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `train` followed by `synthetic`.
    pub fn training_set(&self) -> Vec<Arc<Subject>> {
        self.subjects(Partition::Train)
            .iter()
            .chain(self.subjects(Partition::Synthetic))
            .cloned()
            .collect()
    }

    /// Strided shard `training_set[rank::world_size]`.
    pub fn training_shard(&self, rank: usize, world_size: usize) -> Vec<Arc<Subject>> {
        self.training_set()
            .into_iter()
            .skip(rank)
            .step_by(world_size.max(1))
            .collect()
    }
}

/// `synthetic.npy`, or the legacy `syntetic.npy` when only that one exists.
fn synthetic_gt(dir: &Path) -> PathBuf {
    let path = dir.join("synthetic.npy");
    if path.is_file() {
        return path;
    }
    let legacy = dir.join("syntetic.npy");
    if legacy.is_file() {
        legacy
    } else {
        path
    }
}
