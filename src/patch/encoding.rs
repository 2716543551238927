use burn::prelude::*;
use burn::tensor::TensorData;
use ndarray::Array4;

use crate::error::DataError;
use crate::patch::{Patch, INPUT_CHANNELS};

fn common_shape(patches: &[Patch]) -> Result<[usize; 3], DataError> {
    let first = patches
        .first()
        .ok_or_else(|| DataError::Tensor("cannot encode an empty batch".into()))?
        .shape();
    if let Some(other) = patches.iter().find(|p| p.shape() != first) {
        return Err(DataError::Tensor(format!(
            "mixed patch shapes in one batch: {first:?} and {:?}",
            other.shape()
        )));
    }
    Ok(first)
}

/// Stack patch intensities into `[batch, 3, z, h, w]`.
pub fn encode_patches_batch<B: Backend>(
    patches: &[Patch],
    device: &B::Device,
) -> Result<Tensor<B, 5>, DataError> {
    let [z, h, w] = common_shape(patches)?;
    let mut flat = Vec::with_capacity(patches.len() * INPUT_CHANNELS * z * h * w);
    for patch in patches {
        flat.extend(patch.data.iter().copied());
    }
    let data = TensorData::new(flat, [patches.len(), INPUT_CHANNELS, z, h, w]);
    Ok(Tensor::from_data(data, device))
}

/// Stack patch labels into `[batch, 1, z, h, w]` integer ids.
pub fn encode_labels_batch<B: Backend>(
    patches: &[Patch],
    device: &B::Device,
) -> Result<Tensor<B, 5, Int>, DataError> {
    let [z, h, w] = common_shape(patches)?;
    let mut flat = Vec::with_capacity(patches.len() * z * h * w);
    for patch in patches {
        let labels = patch
            .labels
            .as_ref()
            .ok_or_else(|| DataError::MissingLabel(patch.subject.clone()))?;
        flat.extend(labels.iter().map(|&v| v as i64));
    }
    let data = TensorData::new(flat, [patches.len(), 1, z, h, w]);
    Ok(Tensor::from_data(data, device))
}

/// Patch positions as `[batch, 6]`: start then end per axis, each divided
/// by the volume extent along that axis.
pub fn encode_positions_batch<B: Backend>(
    patches: &[Patch],
    volume_shape: [usize; 3],
    device: &B::Device,
) -> Result<Tensor<B, 2>, DataError> {
    let shape = common_shape(patches)?;
    let mut flat = Vec::with_capacity(patches.len() * 6);
    for patch in patches {
        crate::patch::check_bounds(patch.offset, shape, volume_shape)?;
        let start = (0..3).map(|i| patch.offset[i] as f32 / volume_shape[i] as f32);
        let end = (0..3).map(|i| (patch.offset[i] + shape[i]) as f32 / volume_shape[i] as f32);
        flat.extend(start.chain(end));
    }
    let data = TensorData::new(flat, [patches.len(), 6]);
    Ok(Tensor::from_data(data, device))
}

/// Split `[batch, C, z, h, w]` scores back into one array per patch.
pub fn decode_batch<B: Backend>(scores: Tensor<B, 5>) -> Result<Vec<Array4<f32>>, DataError> {
    let [batch, channels, z, h, w] = scores.dims();
    let flat = scores
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| DataError::Tensor(format!("{e:?}")))?;
    let per_item = channels * z * h * w;
    (0..batch)
        .map(|i| {
            let item = flat[i * per_item..(i + 1) * per_item].to_vec();
            Array4::from_shape_vec((channels, z, h, w), item)
                .map_err(|e| DataError::Tensor(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::extract_patch;
    use crate::patch::test_support::ramp_subject;
    use crate::volume::Partition;
    use burn::backend::NdArray;
    use ndarray::Array3;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_encode_batch_shape_and_values() {
        let device = Default::default();
        let mut labels = Array3::zeros((4, 4, 4));
        labels[[3, 3, 3]] = 1u8;
        let subject = ramp_subject([4, 4, 4], labels, Partition::Train);
        let patches = vec![
            extract_patch(&subject, [0, 0, 0], [2, 2, 2], true).unwrap(),
            extract_patch(&subject, [2, 2, 2], [2, 2, 2], true).unwrap(),
        ];

        let x = encode_patches_batch::<TestBackend>(&patches, &device).unwrap();
        assert_eq!(x.dims(), [2, 3, 2, 2, 2]);
        let values = x.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values[0], 0.0);
        // second item, channel 2, last voxel -> (3, 3, 3)
        assert_eq!(values[2 * 24 - 1], 333.0);

        let y = encode_labels_batch::<TestBackend>(&patches, &device).unwrap();
        assert_eq!(y.dims(), [2, 1, 2, 2, 2]);
        assert_eq!(y.sum().into_scalar(), 1);
    }

    #[test]
    fn test_decode_roundtrips_batch_items() {
        let device = Default::default();
        let subject = ramp_subject([2, 2, 2], Array3::zeros((2, 2, 2)), Partition::Test);
        let patch = extract_patch(&subject, [0, 0, 0], [2, 2, 2], false).unwrap();
        let x =
            encode_patches_batch::<TestBackend>(&[patch.clone(), patch.clone()], &device).unwrap();
        let decoded = decode_batch(x).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1], patch.data);
    }

    #[test]
    fn test_positions_are_normalized() {
        let device = Default::default();
        let subject = ramp_subject([4, 4, 4], Array3::zeros((4, 4, 4)), Partition::Test);
        let patch = extract_patch(&subject, [2, 0, 2], [2, 2, 2], false).unwrap();
        let pos = encode_positions_batch::<TestBackend>(&[patch], [4, 4, 4], &device).unwrap();
        assert_eq!(pos.dims(), [1, 6]);
        let values = pos.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![0.5, 0.0, 0.5, 1.0, 0.5, 1.0]);
    }

    #[test]
    fn test_labels_required_for_targets() {
        let device = Default::default();
        let subject = ramp_subject([2, 2, 2], Array3::zeros((2, 2, 2)), Partition::Test);
        let patch = extract_patch(&subject, [0, 0, 0], [2, 2, 2], false).unwrap();
        let targets = encode_labels_batch::<TestBackend>(&[patch], &device);
        assert!(targets.is_err());
        assert!(encode_patches_batch::<TestBackend>(&[], &device).is_err());
    }
}
