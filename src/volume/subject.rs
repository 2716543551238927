use std::fmt;
use std::path::PathBuf;

use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::error::DataError;

/// Normalized scan intensities on the canonical grid, single channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array3<f32>,
}

impl Volume {
    pub(crate) fn new(data: Array3<f32>) -> Self {
        Volume { data }
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn shape(&self) -> [usize; 3] {
        let (z, h, w) = self.data.dim();
        [z, h, w]
    }
}

/// Integer label ids on the same grid as a [`Volume`].
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMap {
    data: Array3<u8>,
}

impl LabelMap {
    pub(crate) fn new(data: Array3<u8>) -> Self {
        LabelMap { data }
    }

    pub fn data(&self) -> &Array3<u8> {
        &self.data
    }

    pub fn shape(&self) -> [usize; 3] {
        let (z, h, w) = self.data.dim();
        [z, h, w]
    }

    /// Voxel count per label id, `num_classes` entries.
    pub fn histogram(&self, num_classes: usize) -> Vec<u64> {
        let mut counts = vec![0u64; num_classes];
        for &v in self.data.iter() {
            if let Some(c) = counts.get_mut(v as usize) {
                *c += 1;
            }
        }
        counts
    }
}

/// Split partition a subject belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Train,
    Synthetic,
    Val,
    Test,
}

impl Partition {
    pub const ALL: [Partition; 4] = [
        Partition::Train,
        Partition::Synthetic,
        Partition::Val,
        Partition::Test,
    ];

    /// Whether subjects of this partition feed the optimizer.
    pub fn is_training(self) -> bool {
        matches!(self, Partition::Train | Partition::Synthetic)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Partition::Train => "train",
            Partition::Synthetic => "synthetic",
            Partition::Val => "val",
            Partition::Test => "test",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a subject came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Provenance {
    pub data_path: PathBuf,
    pub gt_path: PathBuf,
    pub folder: String,
    pub partition: Partition,
    /// Scales samples_per_volume for training partitions.
    pub weight: f32,
}

/// A preprocessed volume with its annotation.
///
/// Training partitions expose their labels to the patch pipeline; val/test
/// subjects only expose them as an evaluation reference.
#[derive(Debug, Clone)]
pub struct Subject {
    volume: Volume,
    labels: LabelMap,
    provenance: Provenance,
}

impl Subject {
    pub fn new(volume: Volume, labels: LabelMap, provenance: Provenance) -> Self {
        Subject {
            volume,
            labels,
            provenance,
        }
    }

    pub fn id(&self) -> &str {
        &self.provenance.folder
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn partition(&self) -> Partition {
        self.provenance.partition
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Labels used to build training targets. Errors for val/test subjects.
    pub fn training_labels(&self) -> Result<&LabelMap, DataError> {
        if self.partition().is_training() {
            Ok(&self.labels)
        } else {
            Err(DataError::MissingLabel(self.id().to_string()))
        }
    }

    /// Ground truth used to score predictions.
    pub fn reference(&self) -> &LabelMap {
        &self.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(partition: Partition) -> Subject {
        Subject::new(
            Volume::new(Array3::zeros((2, 2, 2))),
            LabelMap::new(Array3::from_elem((2, 2, 2), 1)),
            Provenance {
                data_path: PathBuf::from("s/data.npy"),
                gt_path: PathBuf::from("s/gt_alpha.npy"),
                folder: "s".into(),
                partition,
                weight: 1.0,
            },
        )
    }

    #[test]
    fn test_eval_subjects_hide_training_labels() {
        assert!(subject(Partition::Train).training_labels().is_ok());
        assert!(subject(Partition::Synthetic).training_labels().is_ok());
        assert!(matches!(
            subject(Partition::Test).training_labels(),
            Err(DataError::MissingLabel(_))
        ));
        assert_eq!(subject(Partition::Val).reference().shape(), [2, 2, 2]);
    }

    #[test]
    fn test_histogram_counts_ids() {
        let labels = LabelMap::new(Array3::from_shape_vec((1, 2, 2), vec![0, 1, 1, 2]).unwrap());
        assert_eq!(labels.histogram(3), vec![1, 2, 1]);
    }
}
