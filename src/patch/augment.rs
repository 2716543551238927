use ndarray::Axis;
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::patch::Patch;

fn default_axes() -> Vec<usize> {
    vec![0, 1, 2]
}

fn default_probability() -> f64 {
    0.5
}

fn default_scale() -> [f32; 2] {
    [0.9, 1.1]
}

fn default_shift() -> [f32; 2] {
    [-0.1, 0.1]
}

/// A training-time transform of one patch, selected by `name`.
///
/// ```toml
/// [[data_loader.augmentations]]
/// name = "RandomFlip"
/// axes = [2]
/// flip_probability = 0.5
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum Augmentation {
    /// Mirror intensities and labels along each listed spatial axis.
    RandomFlip {
        #[serde(default = "default_axes")]
        axes: Vec<usize>,
        #[serde(default = "default_probability")]
        flip_probability: f64,
    },
    /// `x * scale + shift` on intensities, both drawn uniformly from their
    /// ranges. Labels are untouched.
    RandomIntensity {
        #[serde(default = "default_scale")]
        scale: [f32; 2],
        #[serde(default = "default_shift")]
        shift: [f32; 2],
        #[serde(default = "default_probability")]
        probability: f64,
    },
    /// Exactly one of `transforms`, picked uniformly.
    OneOf { transforms: Vec<Augmentation> },
}

impl Augmentation {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let probability = |p: f64| {
            if (0.0..=1.0).contains(&p) {
                Ok(())
            } else {
                Err(ConfigError::Validation(format!(
                    "augmentation probability {p} is outside [0, 1]"
                )))
            }
        };
        let range = |what: &str, [lo, hi]: [f32; 2]| {
            if lo.is_finite() && hi.is_finite() && lo <= hi {
                Ok(())
            } else {
                Err(ConfigError::Validation(format!(
                    "augmentation {what} range [{lo}, {hi}] is not ordered"
                )))
            }
        };
        match self {
            Augmentation::RandomFlip {
                axes,
                flip_probability,
            } => {
                if let Some(axis) = axes.iter().find(|&&a| a > 2) {
                    return Err(ConfigError::Validation(format!(
                        "RandomFlip axis {axis} is not a spatial axis"
                    )));
                }
                probability(*flip_probability)
            }
            Augmentation::RandomIntensity {
                scale,
                shift,
                probability: p,
            } => {
                range("scale", *scale)?;
                range("shift", *shift)?;
                probability(*p)
            }
            Augmentation::OneOf { transforms } => {
                if transforms.is_empty() {
                    return Err(ConfigError::Validation(
                        "OneOf needs at least one transform".into(),
                    ));
                }
                transforms.iter().try_for_each(Augmentation::validate)
            }
        }
    }

    pub fn apply<R: Rng + ?Sized>(&self, patch: &mut Patch, rng: &mut R) {
        match self {
            Augmentation::RandomFlip {
                axes,
                flip_probability,
            } => {
                for &axis in axes {
                    if rng.random_bool(*flip_probability) {
                        flip(patch, axis);
                    }
                }
            }
            Augmentation::RandomIntensity {
                scale,
                shift,
                probability,
            } => {
                if rng.random_bool(*probability) {
                    let s = rng.random_range(scale[0]..=scale[1]);
                    let t = rng.random_range(shift[0]..=shift[1]);
                    patch.data.mapv_inplace(|v| v * s + t);
                }
            }
            Augmentation::OneOf { transforms } => {
                if let Some(transform) = transforms.choose(rng) {
                    transform.apply(patch, rng);
                }
            }
        }
    }
}

/// Reverse spatial `axis` (0..3) of the intensities and the labels.
fn flip(patch: &mut Patch, axis: usize) {
    patch.data.invert_axis(Axis(axis + 1));
    if let Some(labels) = patch.labels.as_mut() {
        labels.invert_axis(Axis(axis));
    }
}

/// The configured transforms, applied in order.
#[derive(Debug, Clone, Default)]
pub struct Augmenter {
    transforms: Vec<Augmentation>,
}

impl Augmenter {
    pub fn new(transforms: Vec<Augmentation>) -> Self {
        if !transforms.is_empty() {
            tracing::info!(?transforms, "training augmentations");
        }
        Augmenter { transforms }
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn apply<R: Rng + ?Sized>(&self, patch: &mut Patch, rng: &mut R) {
        for transform in &self.transforms {
            transform.apply(patch, rng);
        }
    }
}
