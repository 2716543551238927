//! Patch sampling, reassembly and the training prefetch queue.

mod aggregator;
mod augment;
pub mod encoding;
mod grid;
mod label;
mod queue;

use ndarray::{s, stack, Array3, Array4, Axis};
use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::volume::Subject;

pub use aggregator::PatchAggregator;
pub use augment::{Augmentation, Augmenter};
pub use grid::GridSampler;
pub use label::LabelSampler;
pub use queue::{PatchPolicy, PatchQueue, QueueConfig};

/// Channels every patch is replicated to.
pub const INPUT_CHANNELS: usize = 3;

/// Training patch sampling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    Grid,
    ByLabel,
}

/// How overlapping patch predictions are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapMode {
    Average,
    LastWrite,
}

/// A fixed-size region cut from one subject.
#[derive(Debug, Clone)]
pub struct Patch {
    pub subject: String,
    pub offset: [usize; 3],
    /// `[3, z, h, w]`, the intensity channel replicated.
    pub data: Array4<f32>,
    /// Training target, only for training partitions.
    pub labels: Option<Array3<u8>>,
}

impl Patch {
    pub fn shape(&self) -> [usize; 3] {
        let (_, z, h, w) = self.data.dim();
        [z, h, w]
    }
}

pub(crate) fn check_bounds(
    offset: [usize; 3],
    patch: [usize; 3],
    volume: [usize; 3],
) -> Result<(), DataError> {
    if (0..3).any(|i| offset[i] + patch[i] > volume[i]) {
        return Err(DataError::PatchOutOfBounds { offset, patch, volume });
    }
    Ok(())
}

/// Cut the region at `offset`; labels are attached only when `with_labels`.
pub fn extract_patch(
    subject: &Subject,
    offset: [usize; 3],
    shape: [usize; 3],
    with_labels: bool,
) -> Result<Patch, DataError> {
    check_bounds(offset, shape, subject.volume().shape())?;
    let window = s![
        offset[0]..offset[0] + shape[0],
        offset[1]..offset[1] + shape[1],
        offset[2]..offset[2] + shape[2]
    ];

    let region = subject.volume().data().slice(window);
    let data = stack(Axis(0), &[region; INPUT_CHANNELS])
        .map_err(|e| DataError::Tensor(e.to_string()))?;

    let labels = if with_labels {
        Some(subject.training_labels()?.data().slice(window).to_owned())
    } else {
        None
    };

    Ok(Patch {
        subject: subject.id().to_string(),
        offset,
        data,
        labels,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;

    use ndarray::Array3;

    use crate::volume::{LabelMap, Partition, Provenance, Subject, Volume};

    /// Subject with voxel value `z*100 + y*10 + x` and the given labels.
    pub fn ramp_subject(shape: [usize; 3], labels: Array3<u8>, partition: Partition) -> Subject {
        let volume = Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(z, y, x)| {
            (z * 100 + y * 10 + x) as f32
        });
        Subject::new(
            Volume::new(volume),
            LabelMap::new(labels),
            Provenance {
                data_path: PathBuf::from("ramp/data.npy"),
                gt_path: PathBuf::from("ramp/gt_alpha.npy"),
                folder: "ramp".to_string(),
                partition,
                weight: 1.0,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ramp_subject;
    use super::*;
    use crate::volume::Partition;

    #[test]
    fn test_extract_replicates_channels() {
        let subject = ramp_subject([4, 4, 4], Array3::zeros((4, 4, 4)), Partition::Train);
        let patch = extract_patch(&subject, [1, 2, 0], [2, 2, 2], true).unwrap();
        assert_eq!(patch.data.dim(), (3, 2, 2, 2));
        for c in 0..3 {
            assert_eq!(patch.data[[c, 0, 0, 0]], 120.0);
            assert_eq!(patch.data[[c, 1, 1, 1]], 231.0);
        }
        assert_eq!(patch.labels.unwrap().dim(), (2, 2, 2));
    }

    #[test]
    fn test_extract_out_of_bounds() {
        let subject = ramp_subject([4, 4, 4], Array3::zeros((4, 4, 4)), Partition::Train);
        let err = extract_patch(&subject, [3, 0, 0], [2, 2, 2], false).unwrap_err();
        assert!(matches!(err, DataError::PatchOutOfBounds { .. }));
    }

    #[test]
    fn test_extract_labels_refused_for_test_subject() {
        let subject = ramp_subject([4, 4, 4], Array3::zeros((4, 4, 4)), Partition::Test);
        let unlabeled = extract_patch(&subject, [0, 0, 0], [2, 2, 2], false).unwrap();
        assert!(unlabeled.labels.is_none());
        assert!(extract_patch(&subject, [0, 0, 0], [2, 2, 2], true).is_err());
    }
}
