//! Segmentation networks and the name -> constructor registry.

mod unet;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

pub use unet::{ConvBlock, UNet3d, POSITION_FEATURES};

/// Registered network architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    PadUNet3D,
    PosPadUNet3D,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::PadUNet3D => "PadUNet3D",
            ModelKind::PosPadUNet3D => "PosPadUNet3D",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: ModelKind,
    /// Channels of the first encoder level; doubled per level.
    pub base_channels: usize,
    /// Number of downsampling steps.
    pub depth: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            name: ModelKind::PadUNet3D,
            base_channels: 16,
            depth: 3,
        }
    }
}

type Constructor<B> = fn(&ModelConfig, usize, &<B as Backend>::Device) -> UNet3d<B>;

fn padded_unet<B: Backend>(
    config: &ModelConfig,
    num_classes: usize,
    device: &B::Device,
) -> UNet3d<B> {
    UNet3d::new(
        config.base_channels,
        config.depth,
        num_classes,
        false,
        device,
    )
}

fn positional_unet<B: Backend>(
    config: &ModelConfig,
    num_classes: usize,
    device: &B::Device,
) -> UNet3d<B> {
    UNet3d::new(
        config.base_channels,
        config.depth,
        num_classes,
        true,
        device,
    )
}

fn constructor<B: Backend>(kind: ModelKind) -> Constructor<B> {
    match kind {
        ModelKind::PadUNet3D => padded_unet::<B>,
        ModelKind::PosPadUNet3D => positional_unet::<B>,
    }
}

/// Builds the configured network with one output channel per class.
pub fn build<B: Backend>(
    config: &ModelConfig,
    num_classes: usize,
    device: &B::Device,
) -> UNet3d<B> {
    tracing::info!(
        model = config.name.as_str(),
        base_channels = config.base_channels,
        depth = config.depth,
        num_classes,
        "building model"
    );
    constructor::<B>(config.name)(config, num_classes, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn test_registry_maps_names() {
        let device = Default::default();
        let mut config = ModelConfig {
            base_channels: 2,
            depth: 1,
            ..Default::default()
        };
        assert!(!build::<NdArray<f32>>(&config, 2, &device).is_positional());
        config.name = ModelKind::PosPadUNet3D;
        assert!(build::<NdArray<f32>>(&config, 2, &device).is_positional());
    }

    #[test]
    fn test_unknown_model_name_is_rejected() {
        assert!(toml::from_str::<ModelConfig>(r#"name = "ResNet""#).is_err());
        let ok: ModelConfig = toml::from_str(r#"name = "PosPadUNet3D""#).unwrap();
        assert_eq!(ok.name, ModelKind::PosPadUNet3D);
        assert_eq!(ok.depth, 3);
    }
}
