use burn::prelude::*;

use crate::config::LabelSet;
use crate::error::LossError;
use crate::loss::{
    bce_with_logits, dice_loss, one_hot, weighted_cross_entropy, DeviceClass, LossConfig, LossKind,
};
use crate::weights::ClassWeights;

/// Summed loss plus each term's scalar value.
pub struct LossOutput<B: Backend> {
    pub total: Tensor<B, 1>,
    pub terms: Vec<(LossKind, f32)>,
}

impl<B: Backend> LossOutput<B> {
    pub fn value(&self) -> f32 {
        self.terms.iter().map(|(_, v)| v).sum()
    }
}

/// Composes the configured loss terms by summation.
#[derive(Debug, Clone)]
pub struct LossEngine {
    terms: Vec<LossKind>,
    num_classes: usize,
    included: Vec<usize>,
    weights: Vec<f32>,
    allow_host_targets: bool,
}

impl LossEngine {
    pub fn new(
        config: &LossConfig,
        labels: &LabelSet,
        weights: &ClassWeights,
    ) -> Result<Self, LossError> {
        let terms = config.names();
        if terms.is_empty() {
            return Err(LossError::Empty);
        }
        if weights.len() != labels.num_classes() {
            return Err(LossError::WeightCount {
                expected: labels.num_classes(),
                got: weights.len(),
            });
        }
        let weights = if config.use_class_weights {
            weights.as_slice().to_vec()
        } else {
            vec![1.0; labels.num_classes()]
        };
        Ok(LossEngine {
            terms,
            num_classes: labels.num_classes(),
            included: labels.objective_ids().into_iter().map(usize::from).collect(),
            weights,
            allow_host_targets: config.allow_host_targets,
        })
    }

    pub fn terms(&self) -> &[LossKind] {
        &self.terms
    }

    /// Loss of `logits` `[B, C, z, h, w]` against ids `[B, 1, z, h, w]`.
    ///
    /// Fails when the tensors live on different devices, when a
    /// cross-entropy term gets targets on a host device (unless allowed) and
    /// when any term is not finite.
    pub fn compute<B: Backend>(
        &self,
        logits: Tensor<B, 5>,
        target: Tensor<B, 5, Int>,
    ) -> Result<LossOutput<B>, LossError>
    where
        B::Device: DeviceClass,
    {
        let device = logits.device();
        if device != target.device() {
            return Err(LossError::DeviceMismatch);
        }
        if !self.allow_host_targets && device.is_host() {
            if let Some(term) = self.terms.iter().find(|t| t.is_cross_entropy()) {
                return Err(LossError::HostDevice {
                    term: term.as_str().to_string(),
                });
            }
        }

        let [b, c, z, h, w] = logits.dims();
        let [tb, tc, tz, th, tw] = target.dims();
        if c != self.num_classes {
            return Err(LossError::Tensor(format!(
                "expected {} class channels, got {c}",
                self.num_classes
            )));
        }
        if tc != 1 || [b, z, h, w] != [tb, tz, th, tw] {
            return Err(LossError::Tensor(format!(
                "target shape {:?} does not match logits {:?}",
                target.dims(),
                logits.dims()
            )));
        }

        let onehot = one_hot(target, self.num_classes);
        let mut total: Option<Tensor<B, 1>> = None;
        let mut values = Vec::with_capacity(self.terms.len());
        for &term in &self.terms {
            let loss = match term {
                LossKind::DiceLoss => dice_loss(logits.clone(), onehot.clone(), &self.included),
                LossKind::CrossEntropyLoss => {
                    weighted_cross_entropy(logits.clone(), onehot.clone(), &self.weights)
                }
                LossKind::BceWithLogitsLoss => {
                    bce_with_logits(logits.clone(), onehot.clone(), &self.weights)
                }
            };
            let value = loss
                .clone()
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| LossError::Tensor(format!("{e:?}")))?
                .first()
                .copied()
                .unwrap_or(f32::NAN);
            if !value.is_finite() {
                tracing::error!(term = term.as_str(), value, "loss diverged");
                return Err(LossError::NonFinite {
                    term: term.as_str().to_string(),
                    value,
                });
            }
            values.push((term, value));
            total = Some(match total {
                Some(acc) => acc + loss,
                None => loss,
            });
        }

        let total = total.ok_or(LossError::Empty)?;
        Ok(LossOutput { total, terms: values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::loss::LossNames;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn engine(names: Vec<LossKind>, allow_host_targets: bool) -> LossEngine {
        let labels = AppConfig::default().label_set().unwrap();
        let config = LossConfig {
            name: LossNames::Many(names),
            use_class_weights: true,
            allow_host_targets,
        };
        LossEngine::new(&config, &labels, &ClassWeights::uniform(&labels)).unwrap()
    }

    fn batch() -> (Tensor<TestBackend, 5>, Tensor<TestBackend, 5, Int>) {
        let device = Default::default();
        let target = Tensor::<TestBackend, 5, Int>::from_data(
            TensorData::new(vec![0i64, 1, 1, 0], [1, 1, 1, 2, 2]),
            &device,
        );
        let logits = one_hot(target.clone(), 2).mul_scalar(40.0);
        (logits, target)
    }

    #[test]
    fn test_cross_entropy_rejects_host_targets() {
        let (logits, target) = batch();
        let err = engine(vec![LossKind::CrossEntropyLoss], false)
            .compute(logits, target)
            .err()
            .unwrap();
        assert!(matches!(err, LossError::HostDevice { .. }));
    }

    #[test]
    fn test_dice_alone_runs_on_host() {
        let (logits, target) = batch();
        let out = engine(vec![LossKind::DiceLoss], false)
            .compute(logits, target)
            .unwrap();
        assert!(out.value() < 1e-4);
    }

    #[test]
    fn test_terms_are_summed() {
        let (logits, target) = batch();
        let engine = engine(
            vec![
                LossKind::DiceLoss,
                LossKind::CrossEntropyLoss,
                LossKind::BceWithLogitsLoss,
            ],
            true,
        );
        let out = engine.compute(logits, target).unwrap();
        assert_eq!(out.terms.len(), 3);
        let total = out.total.clone().into_data().to_vec::<f32>().unwrap()[0];
        assert!((total - out.value()).abs() < 1e-5);
    }

    #[test]
    fn test_nan_loss_aborts() {
        let (logits, target) = batch();
        let logits = logits.mul_scalar(f32::NAN);
        let err = engine(vec![LossKind::DiceLoss], false)
            .compute(logits, target)
            .err()
            .unwrap();
        assert!(matches!(err, LossError::NonFinite { .. }));
    }

    #[test]
    fn test_wrong_class_count_is_rejected() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 5>::zeros([1, 3, 1, 2, 2], &device);
        let target = Tensor::<TestBackend, 5, Int>::zeros([1, 1, 1, 2, 2], &device);
        let dice = engine(vec![LossKind::DiceLoss], true);
        assert!(dice.compute(logits, target).is_err());
    }

    #[test]
    fn test_weight_count_must_match_labels() {
        let labels = AppConfig::default().label_set().unwrap();
        let mut background_only = std::collections::BTreeMap::new();
        background_only.insert("BACKGROUND".to_string(), 0u8);
        let single = LabelSet::from_map(&background_only).unwrap();
        let weights = ClassWeights::from_configured(&[1.0], &single).unwrap();
        let err = LossEngine::new(&LossConfig::default(), &labels, &weights).unwrap_err();
        assert!(matches!(
            err,
            LossError::WeightCount {
                expected: 2,
                got: 1
            }
        ));
    }
}
