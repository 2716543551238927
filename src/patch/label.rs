use ndarray::Array3;
use rand::Rng;

use crate::config::{DataLoaderConfig, LabelSet};
use crate::error::DataError;
use crate::patch::{extract_patch, Patch};
use crate::volume::Subject;

/// Stochastic sampler biased toward configured label classes.
///
/// Each draw picks a class by probability (renormalized over the classes
/// present in the subject), centers the patch on a random voxel of that
/// class and clamps it inside the volume.
#[derive(Debug, Clone)]
pub struct LabelSampler {
    patch: [usize; 3],
    probabilities: Vec<(u8, f64)>,
}

impl LabelSampler {
    pub fn new(patch: [usize; 3], probabilities: Vec<(u8, f64)>) -> Self {
        LabelSampler { patch, probabilities }
    }

    /// Configured probabilities, or 10% BACKGROUND and 90% split over the
    /// objective classes.
    pub fn from_config(config: &DataLoaderConfig, labels: &LabelSet) -> Self {
        let probabilities = match &config.label_probabilities {
            Some(map) => map
                .iter()
                .filter_map(|(name, &p)| labels.id(name).map(|id| (id, p as f64)))
                .collect(),
            None => {
                let objective = labels.objective_ids();
                let share = 0.9 / objective.len().max(1) as f64;
                std::iter::once((labels.background(), 0.1))
                    .chain(objective.into_iter().map(|id| (id, share)))
                    .collect()
            }
        };
        Self::new(config.patch_shape, probabilities)
    }

    pub fn probabilities(&self) -> &[(u8, f64)] {
        &self.probabilities
    }

    /// Draw one patch offset from `labels`.
    pub fn sample_offset<R: Rng>(
        &self,
        labels: &Array3<u8>,
        rng: &mut R,
    ) -> Result<[usize; 3], DataError> {
        let (z, h, w) = labels.dim();
        let volume = [z, h, w];
        if (0..3).any(|i| self.patch[i] > volume[i]) {
            return Err(DataError::PatchTooLarge {
                patch: self.patch,
                volume,
            });
        }

        let mut counts = [0usize; 256];
        for &v in labels.iter() {
            counts[v as usize] += 1;
        }
        let candidates: Vec<(u8, f64)> = self
            .probabilities
            .iter()
            .copied()
            .filter(|&(id, p)| p > 0.0 && counts[id as usize] > 0)
            .collect();
        let total: f64 = candidates.iter().map(|(_, p)| p).sum();

        if candidates.is_empty() || total <= 0.0 {
            return Ok(std::array::from_fn(|i| rng.random_range(0..=volume[i] - self.patch[i])));
        }

        let mut pick = rng.random_range(0.0..total);
        let mut class = candidates[candidates.len() - 1].0;
        for &(id, p) in &candidates {
            if pick < p {
                class = id;
                break;
            }
            pick -= p;
        }

        let nth = rng.random_range(0..counts[class as usize]);
        let (center, _) = labels
            .indexed_iter()
            .filter(|(_, v)| **v == class)
            .nth(nth)
            .ok_or_else(|| DataError::Tensor(format!("label {class} vanished during sampling")))?;
        let center = [center.0, center.1, center.2];

        Ok(std::array::from_fn(|i| {
            center[i]
                .saturating_sub(self.patch[i] / 2)
                .min(volume[i] - self.patch[i])
        }))
    }

    pub fn sample<R: Rng>(&self, subject: &Subject, rng: &mut R) -> Result<Patch, DataError> {
        let offset = self.sample_offset(subject.training_labels()?.data(), rng)?;
        extract_patch(subject, offset, self.patch, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_probabilities() {
        let config = AppConfig::default();
        let labels = config.label_set().unwrap();
        let sampler = LabelSampler::from_config(&config.data_loader, &labels);
        assert_eq!(sampler.probabilities(), &[(0, 0.1), (1, 0.9)]);
    }

    #[test]
    fn test_foreground_only_centers_on_foreground() {
        let mut labels = Array3::<u8>::zeros((16, 16, 16));
        labels[[12, 3, 9]] = 1;
        let sampler = LabelSampler::new([4, 4, 4], vec![(0, 0.0), (1, 1.0)]);
        let mut rng = StdRng::seed_from_u64(47);
        for _ in 0..10 {
            let offset = sampler.sample_offset(&labels, &mut rng).unwrap();
            assert_eq!(offset, [10, 1, 7]);
        }
    }

    #[test]
    fn test_offsets_are_clamped_inside_volume() {
        let mut labels = Array3::<u8>::zeros((8, 8, 8));
        labels[[0, 0, 7]] = 1;
        let sampler = LabelSampler::new([4, 4, 4], vec![(1, 1.0)]);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(sampler.sample_offset(&labels, &mut rng).unwrap(), [0, 0, 4]);
    }

    #[test]
    fn test_absent_classes_fall_back_to_uniform() {
        let labels = Array3::<u8>::zeros((8, 8, 8));
        let sampler = LabelSampler::new([4, 4, 4], vec![(1, 1.0)]);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let offset = sampler.sample_offset(&labels, &mut rng).unwrap();
            assert!(offset.iter().all(|&o| o <= 4));
        }
    }

    #[test]
    fn test_mixed_probabilities_hit_both_classes() {
        let mut labels = Array3::<u8>::zeros((32, 32, 32));
        labels[[30, 30, 30]] = 1;
        let sampler = LabelSampler::new([4, 4, 4], vec![(0, 0.5), (1, 0.5)]);
        let mut rng = StdRng::seed_from_u64(47);
        let hits = (0..200)
            .filter(|_| sampler.sample_offset(&labels, &mut rng).unwrap() == [28, 28, 28])
            .count();
        assert!(hits > 50 && hits < 200, "hits = {hits}");
    }
}
