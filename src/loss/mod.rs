//! Composite segmentation loss.

mod device;
mod engine;
mod terms;

use serde::{Deserialize, Serialize};

pub use device::DeviceClass;
pub use engine::{LossEngine, LossOutput};
pub use terms::{bce_with_logits, dice_loss, one_hot, weighted_cross_entropy};

/// ε used by every division in the loss terms.
pub const EPS: f64 = 1e-6;

/// A named loss term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    CrossEntropyLoss,
    #[serde(rename = "BCEWithLogitsLoss")]
    BceWithLogitsLoss,
    DiceLoss,
}

impl LossKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LossKind::CrossEntropyLoss => "CrossEntropyLoss",
            LossKind::BceWithLogitsLoss => "BCEWithLogitsLoss",
            LossKind::DiceLoss => "DiceLoss",
        }
    }

    /// Terms that consume class weights and need targets on an accelerator.
    pub fn is_cross_entropy(self) -> bool {
        matches!(
            self,
            LossKind::CrossEntropyLoss | LossKind::BceWithLogitsLoss
        )
    }
}

/// A single loss name or a list of names to sum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LossNames {
    One(LossKind),
    Many(Vec<LossKind>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub name: LossNames,
    pub use_class_weights: bool,
    /// Let cross-entropy terms run with targets on a host device.
    pub allow_host_targets: bool,
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig {
            name: LossNames::Many(vec![LossKind::DiceLoss]),
            use_class_weights: true,
            allow_host_targets: false,
        }
    }
}

impl LossConfig {
    pub fn names(&self) -> Vec<LossKind> {
        match &self.name {
            LossNames::One(kind) => vec![*kind],
            LossNames::Many(kinds) => kinds.clone(),
        }
    }
}
