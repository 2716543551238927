use ndarray::{s, Array3, Array4, ArrayView4, Axis, Zip};

use crate::error::DataError;
use crate::patch::{check_bounds, OverlapMode};

/// Reassembles per-patch predictions `[C, z, h, w]` into a full volume.
pub struct PatchAggregator {
    shape: [usize; 3],
    mode: OverlapMode,
    sum: Array4<f32>,
    count: Array3<u32>,
}

impl PatchAggregator {
    pub fn new(channels: usize, shape: [usize; 3], mode: OverlapMode) -> Self {
        PatchAggregator {
            shape,
            mode,
            sum: Array4::zeros((channels, shape[0], shape[1], shape[2])),
            count: Array3::zeros((shape[0], shape[1], shape[2])),
        }
    }

    /// Write one patch prediction at `offset`.
    pub fn add(
        &mut self,
        offset: [usize; 3],
        prediction: ArrayView4<'_, f32>,
    ) -> Result<(), DataError> {
        let (channels, z, h, w) = prediction.dim();
        let patch = [z, h, w];
        check_bounds(offset, patch, self.shape)?;
        if channels != self.sum.dim().0 {
            return Err(DataError::Tensor(format!(
                "expected {} prediction channels, got {channels}",
                self.sum.dim().0
            )));
        }

        let spatial = s![
            offset[0]..offset[0] + z,
            offset[1]..offset[1] + h,
            offset[2]..offset[2] + w
        ];
        let mut region = self.sum.slice_mut(s![
            ..,
            offset[0]..offset[0] + z,
            offset[1]..offset[1] + h,
            offset[2]..offset[2] + w
        ]);
        match self.mode {
            OverlapMode::Average => region += &prediction,
            OverlapMode::LastWrite => region.assign(&prediction),
        }
        self.count.slice_mut(spatial).mapv_inplace(|c| c + 1);
        Ok(())
    }

    /// Voxels not covered by any patch yet.
    pub fn missing(&self) -> usize {
        self.count.iter().filter(|&&c| c == 0).count()
    }

    /// Combined prediction; errors unless every voxel was covered.
    pub fn finish(self) -> Result<Array4<f32>, DataError> {
        let missing = self.missing();
        if missing > 0 {
            return Err(DataError::IncompleteCoverage {
                missing,
                total: self.count.len(),
            });
        }
        let mut out = self.sum;
        if self.mode == OverlapMode::Average {
            for mut channel in out.axis_iter_mut(Axis(0)) {
                Zip::from(&mut channel)
                    .and(&self.count)
                    .for_each(|v, &c| *v /= c as f32);
            }
        }
        Ok(out)
    }

    /// Per-voxel argmax over channels.
    pub fn finish_labels(self) -> Result<Array3<u8>, DataError> {
        let scores = self.finish()?;
        Ok(argmax_channels(&scores))
    }
}

pub fn argmax_channels(scores: &Array4<f32>) -> Array3<u8> {
    let (_, z, h, w) = scores.dim();
    Array3::from_shape_fn((z, h, w), |(i, j, k)| {
        let mut best = 0u8;
        let mut best_score = f32::NEG_INFINITY;
        for (c, &v) in scores.slice(s![.., i, j, k]).iter().enumerate() {
            if v > best_score {
                best_score = v;
                best = c as u8;
            }
        }
        best
    })
}
