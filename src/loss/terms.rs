use burn::prelude::*;
use burn::tensor::activation::{log_sigmoid, log_softmax, softmax};
use burn::tensor::TensorData;

use crate::loss::EPS;

/// `[B, 1, z, h, w]` ids -> `[B, C, z, h, w]` one-hot floats.
pub fn one_hot<B: Backend>(labels: Tensor<B, 5, Int>, num_classes: usize) -> Tensor<B, 5> {
    let planes = (0..num_classes)
        .map(|c| labels.clone().equal_elem(c as i32).float())
        .collect();
    Tensor::cat(planes, 1)
}

fn class_tensor<B: Backend>(values: &[f32], device: &B::Device) -> Tensor<B, 5> {
    Tensor::<B, 1>::from_data(TensorData::from(values), device).reshape([1, values.len(), 1, 1, 1])
}

/// Mean `1 - dice` over the batch and the `included` classes.
///
/// Dice per item and class is `2·Σ(p·t) / (Σ(p + t) + ε)` over the spatial
/// axes, with `p` the softmax of `logits` along the class axis.
pub fn dice_loss<B: Backend>(
    logits: Tensor<B, 5>,
    target: Tensor<B, 5>,
    included: &[usize],
) -> Tensor<B, 1> {
    let [batch, classes, _, _, _] = logits.dims();
    let device = logits.device();
    let probs = softmax(logits, 1);

    let intersection = (probs.clone() * target.clone())
        .sum_dim(4)
        .sum_dim(3)
        .sum_dim(2);
    let cardinality = (probs + target).sum_dim(4).sum_dim(3).sum_dim(2);
    let dice: Tensor<B, 2> = (intersection.mul_scalar(2.0) / cardinality.add_scalar(EPS))
        .reshape([batch, classes]);

    let ids: Vec<i64> = included.iter().map(|&c| c as i64).collect();
    let index = Tensor::<B, 1, Int>::from_data(TensorData::new(ids, [included.len()]), &device);
    dice.select(1, index).neg().add_scalar(1.0).mean()
}

/// Class-weighted cross-entropy, `Σ w[y]·nll / Σ w[y]` over all voxels.
pub fn weighted_cross_entropy<B: Backend>(
    logits: Tensor<B, 5>,
    target: Tensor<B, 5>,
    weights: &[f32],
) -> Tensor<B, 1> {
    let device = logits.device();
    let log_probs = log_softmax(logits, 1);
    let voxel_weight = (target.clone() * class_tensor::<B>(weights, &device)).sum_dim(1);
    let nll = (log_probs * target).sum_dim(1).neg();
    (nll * voxel_weight.clone()).sum() / voxel_weight.sum().add_scalar(EPS)
}

/// Binary cross-entropy on logits against one-hot targets, with per-class
/// `pos_weight`, averaged over every element.
pub fn bce_with_logits<B: Backend>(
    logits: Tensor<B, 5>,
    target: Tensor<B, 5>,
    pos_weight: &[f32],
) -> Tensor<B, 1> {
    let device = logits.device();
    let positive =
        target.clone() * class_tensor::<B>(pos_weight, &device) * log_sigmoid(logits.clone());
    let negative = target.neg().add_scalar(1.0) * log_sigmoid(logits.neg());
    (positive + negative).mean().neg()
}
