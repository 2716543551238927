//! Per-class loss weights by median frequency balancing.

use crate::config::LabelSet;
use crate::error::ConfigError;
use crate::volume::LabelMap;

/// Normalized per-class weights, indexed by label id.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassWeights(Vec<f32>);

impl ClassWeights {
    /// Normalize explicitly configured weights.
    pub fn from_configured(weights: &[f32], labels: &LabelSet) -> Result<Self, ConfigError> {
        if weights.len() != labels.num_classes() {
            return Err(ConfigError::Validation(format!(
                "{} class weights configured for {} labels",
                weights.len(),
                labels.num_classes()
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::Validation(
                "class weights must be finite and >= 0".into(),
            ));
        }
        let sum: f64 = weights.iter().map(|&w| w as f64).sum();
        if sum <= 0.0 {
            return Err(ConfigError::Validation(
                "class weights must not all be zero".into(),
            ));
        }
        let normalized = weights.iter().map(|&w| (w as f64 / sum) as f32);
        Ok(ClassWeights(normalized.collect()))
    }

    /// Uniform weights over the valid classes, zero for UNLABELED.
    pub fn uniform(labels: &LabelSet) -> Self {
        let valid = labels.weighted_ids();
        let mut weights = vec![0.0f32; labels.num_classes()];
        for &id in &valid {
            weights[id as usize] = 1.0 / valid.len() as f32;
        }
        ClassWeights(weights)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Mean over subjects of each class's share of the subject's valid voxels.
///
/// Subjects without any valid voxel contribute nothing but still count in
/// the denominator.
pub fn class_frequencies<'a>(
    labels: &LabelSet,
    subjects: impl IntoIterator<Item = &'a LabelMap>,
) -> Vec<f64> {
    let valid = labels.weighted_ids();
    let mut freq = vec![0.0f64; labels.num_classes()];
    let mut n_subjects = 0usize;

    for map in subjects {
        n_subjects += 1;
        let hist = map.histogram(labels.num_classes());
        let valid_total: u64 = valid.iter().map(|&id| hist[id as usize]).sum();
        if valid_total == 0 {
            continue;
        }
        for &id in &valid {
            freq[id as usize] += hist[id as usize] as f64 / valid_total as f64;
        }
    }

    if n_subjects > 0 {
        for f in &mut freq {
            *f /= n_subjects as f64;
        }
    }
    freq
}

/// `median(freq) / freq[c]`, zero for absent classes, normalized to sum 1.
///
/// The median is the lower median over the nonzero frequencies. Falls back
/// to uniform weights when no class occurs at all.
pub fn median_frequency_balancing<'a>(
    labels: &LabelSet,
    subjects: impl IntoIterator<Item = &'a LabelMap>,
) -> ClassWeights {
    let freq = class_frequencies(labels, subjects);

    let mut present: Vec<f64> = labels
        .weighted_ids()
        .into_iter()
        .map(|id| freq[id as usize])
        .filter(|&f| f > 0.0)
        .collect();
    if present.is_empty() {
        tracing::warn!("no labelled voxels in the training set, using uniform class weights");
        return ClassWeights::uniform(labels);
    }
    present.sort_by(|a, b| a.total_cmp(b));
    let median = present[(present.len() - 1) / 2];

    let raw: Vec<f64> = freq
        .iter()
        .map(|&f| if f > 0.0 { median / f } else { 0.0 })
        .collect();
    let sum: f64 = raw.iter().sum();
    ClassWeights(raw.iter().map(|&w| (w / sum) as f32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BACKGROUND, INSIDE, UNLABELED};
    use ndarray::Array3;
    use std::collections::BTreeMap;

    fn label_set(names: &[&str]) -> LabelSet {
        let map: BTreeMap<String, u8> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_string(), i as u8))
            .collect();
        LabelSet::from_map(&map).unwrap()
    }

    fn map_with(counts: &[(u8, usize)]) -> LabelMap {
        let values: Vec<u8> = counts
            .iter()
            .flat_map(|&(id, n)| std::iter::repeat(id).take(n))
            .collect();
        let len = values.len();
        LabelMap::new(Array3::from_shape_vec((1, 1, len), values).unwrap())
    }

    #[test]
    fn test_absent_class_gets_zero_weight() {
        let labels = label_set(&[INSIDE, BACKGROUND]);
        // INSIDE = 0 occurs 1000 times, BACKGROUND = 1 never
        let subjects = [map_with(&[(0, 600)]), map_with(&[(0, 400)])];
        let weights = median_frequency_balancing(&labels, subjects.iter());
        let w = weights.as_slice();
        assert!(w[0] > 0.0);
        assert_eq!(w[1], 0.0);
        assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_weights_sum_to_one_and_favor_rare_classes() {
        let labels = label_set(&[BACKGROUND, INSIDE, "CONTOUR"]);
        let subjects = [map_with(&[(0, 900), (1, 90), (2, 10)])];
        let w = median_frequency_balancing(&labels, subjects.iter());
        let w = w.as_slice();
        assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(w[2] > w[1] && w[1] > w[0]);
        // median freq is INSIDE's: 0.09 / 0.09 = 1 before normalization
        let raw_sum = 0.09 / 0.9 + 1.0 + 0.09 / 0.01;
        assert!((w[1] as f64 - 1.0 / raw_sum).abs() < 1e-6);
    }

    #[test]
    fn test_unlabeled_is_excluded() {
        let labels = label_set(&[BACKGROUND, INSIDE, UNLABELED]);
        let subjects = [map_with(&[(0, 50), (1, 50), (2, 1000)])];
        let freq = class_frequencies(&labels, subjects.iter());
        assert_eq!(freq, vec![0.5, 0.5, 0.0]);
        let w = median_frequency_balancing(&labels, subjects.iter());
        assert_eq!(w.as_slice(), &[0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_frequencies_average_per_subject() {
        let labels = label_set(&[BACKGROUND, INSIDE]);
        let subjects = [map_with(&[(0, 1), (1, 3)]), map_with(&[(0, 10)])];
        let freq = class_frequencies(&labels, subjects.iter());
        assert!((freq[0] - (0.25 + 1.0) / 2.0).abs() < 1e-12);
        assert!((freq[1] - 0.75 / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_configured_weights_are_normalized() {
        let labels = label_set(&[BACKGROUND, INSIDE]);
        let w = ClassWeights::from_configured(&[1.0, 3.0], &labels).unwrap();
        assert_eq!(w.as_slice(), &[0.25, 0.75]);
        assert!(ClassWeights::from_configured(&[1.0], &labels).is_err());
        assert!(ClassWeights::from_configured(&[0.0, 0.0], &labels).is_err());
    }

    #[test]
    fn test_empty_training_set_falls_back_to_uniform() {
        let labels = label_set(&[BACKGROUND, INSIDE]);
        let w = median_frequency_balancing(&labels, std::iter::empty());
        assert_eq!(w.as_slice(), &[0.5, 0.5]);
    }
}
