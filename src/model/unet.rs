use burn::nn::conv::{Conv3d, Conv3dConfig, ConvTranspose3d, ConvTranspose3dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, Linear, LinearConfig, PaddingConfig3d, Relu};
use burn::prelude::*;

use crate::patch::INPUT_CHANNELS;

/// Width of the patch position vector: normalized start and end per axis.
pub const POSITION_FEATURES: usize = 6;

fn groups_for(channels: usize) -> usize {
    let mut g = 8.min(channels);
    while channels % g != 0 {
        g -= 1;
    }
    g
}

/// Two 3x3x3 conv + group norm + ReLU layers.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv1: Conv3d<B>,
    norm1: GroupNorm<B>,
    conv2: Conv3d<B>,
    norm2: GroupNorm<B>,
    relu: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = |i, o| {
            Conv3dConfig::new([i, o], [3, 3, 3])
                .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
                .init(device)
        };
        let norm = || GroupNormConfig::new(groups_for(out_channels), out_channels).init(device);
        ConvBlock {
            conv1: conv(in_channels, out_channels),
            norm1: norm(),
            conv2: conv(out_channels, out_channels),
            norm2: norm(),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.relu.forward(self.norm1.forward(self.conv1.forward(x)));
        self.relu.forward(self.norm2.forward(self.conv2.forward(x)))
    }
}

/// Padded 3D U-Net.
///
/// ```text
/// Input:  [batch, 3, z, h, w]
/// enc[0]: 3 -> c
/// enc[i]: stride-2 conv, c*2^(i-1) -> c*2^i          (i = 1..=depth)
/// dec[i]: transpose conv up, concat skip, c*2^(i+1) -> c*2^i
/// head:   1x1x1 conv, c -> classes
/// Output: [batch, classes, z, h, w] logits
/// ```
///
/// The positional variant projects the patch position `[batch, 6]` onto
/// the bottleneck channels and adds it to every bottleneck voxel.
#[derive(Module, Debug)]
pub struct UNet3d<B: Backend> {
    encoders: Vec<ConvBlock<B>>,
    downs: Vec<Conv3d<B>>,
    ups: Vec<ConvTranspose3d<B>>,
    decoders: Vec<ConvBlock<B>>,
    head: Conv3d<B>,
    position: Option<Linear<B>>,
}

impl<B: Backend> UNet3d<B> {
    pub fn new(
        base_channels: usize,
        depth: usize,
        num_classes: usize,
        positional: bool,
        device: &B::Device,
    ) -> Self {
        let width = |level: usize| base_channels << level;

        let mut encoders = vec![ConvBlock::new(INPUT_CHANNELS, width(0), device)];
        let mut downs = Vec::with_capacity(depth);
        for level in 1..=depth {
            let c = width(level - 1);
            downs.push(
                Conv3dConfig::new([c, c], [2, 2, 2])
                    .with_stride([2, 2, 2])
                    .init(device),
            );
            encoders.push(ConvBlock::new(c, width(level), device));
        }

        let mut ups = Vec::with_capacity(depth);
        let mut decoders = Vec::with_capacity(depth);
        for level in (0..depth).rev() {
            ups.push(
                ConvTranspose3dConfig::new([width(level + 1), width(level)], [2, 2, 2])
                    .with_stride([2, 2, 2])
                    .init(device),
            );
            decoders.push(ConvBlock::new(2 * width(level), width(level), device));
        }

        UNet3d {
            encoders,
            downs,
            ups,
            decoders,
            head: Conv3dConfig::new([width(0), num_classes], [1, 1, 1]).init(device),
            position: positional
                .then(|| LinearConfig::new(POSITION_FEATURES, width(depth)).init(device)),
        }
    }

    pub fn is_positional(&self) -> bool {
        self.position.is_some()
    }

    /// Forward pass: `[batch, 3, z, h, w]` -> `[batch, classes, z, h, w]`.
    /// `position` is `[batch, 6]` and only read by the positional variant.
    pub fn forward(&self, volume: Tensor<B, 5>, position: Tensor<B, 2>) -> Tensor<B, 5> {
        let mut skips = Vec::with_capacity(self.downs.len());
        let mut x = self.encoders[0].forward(volume);
        for (down, encoder) in self.downs.iter().zip(self.encoders.iter().skip(1)) {
            skips.push(x.clone());
            x = encoder.forward(down.forward(x));
        }

        if let Some(linear) = &self.position {
            let [batch, channels, _, _, _] = x.dims();
            let embedding = linear.forward(position).reshape([batch, channels, 1, 1, 1]);
            x = x + embedding;
        }

        for (up, decoder) in self.ups.iter().zip(self.decoders.iter()) {
            let skip = skips.pop().unwrap_or_else(|| x.clone());
            x = decoder.forward(Tensor::cat(vec![up.forward(x), skip], 1));
        }
        self.head.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_group_count_divides_channels() {
        assert_eq!(groups_for(16), 8);
        assert_eq!(groups_for(4), 4);
        assert_eq!(groups_for(12), 6);
    }

    #[test]
    fn test_unet_output_shape() {
        let device = Default::default();
        let net = UNet3d::<TestBackend>::new(4, 2, 3, false, &device);
        let input = Tensor::zeros([2, 3, 8, 8, 8], &device);
        let position = Tensor::zeros([2, POSITION_FEATURES], &device);
        let output = net.forward(input, position);
        assert_eq!(output.dims(), [2, 3, 8, 8, 8]);
    }

    #[test]
    fn test_positional_unet_uses_position() {
        let device = Default::default();
        let net = UNet3d::<TestBackend>::new(4, 1, 2, true, &device);
        assert!(net.is_positional());
        let input = Tensor::<TestBackend, 5>::ones([1, 3, 4, 4, 4], &device);
        let origin = Tensor::zeros([1, POSITION_FEATURES], &device);
        let a = net.forward(input.clone(), origin);
        let b = net.forward(input, Tensor::ones([1, POSITION_FEATURES], &device));
        assert_eq!(a.dims(), [1, 2, 4, 4, 4]);
        let diff = (a - b).abs().sum().into_scalar();
        assert!(diff > 0.0);
    }
}
