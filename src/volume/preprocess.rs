use ndarray::{s, Array3};

/// Clip to `[min, max]` and shift-rescale into `[0, 1]`.
///
/// `(clip(x, min, max) + min) / (max + min)`; stays inside the unit interval
/// whenever `0 <= min < max`.
pub fn normalize(raw: &Array3<f32>, min: f32, max: f32) -> Array3<f32> {
    let denom = max + min;
    raw.mapv(|x| (x.clamp(min, max) + min) / denom)
}

/// Center-crop or center-pad `src` to `target`, filling new voxels with `fill`.
///
/// Per axis the leading side receives `floor(diff / 2)` of the difference.
pub fn crop_or_pad<T: Copy>(src: &Array3<T>, target: [usize; 3], fill: T) -> Array3<T> {
    let shape = src.dim();
    let shape = [shape.0, shape.1, shape.2];
    let mut out = Array3::from_elem((target[0], target[1], target[2]), fill);

    let mut src_start = [0usize; 3];
    let mut dst_start = [0usize; 3];
    let mut len = [0usize; 3];
    for axis in 0..3 {
        if shape[axis] >= target[axis] {
            src_start[axis] = (shape[axis] - target[axis]) / 2;
            len[axis] = target[axis];
        } else {
            dst_start[axis] = (target[axis] - shape[axis]) / 2;
            len[axis] = shape[axis];
        }
    }

    out.slice_mut(s![
        dst_start[0]..dst_start[0] + len[0],
        dst_start[1]..dst_start[1] + len[1],
        dst_start[2]..dst_start[2] + len[2]
    ])
    .assign(&src.slice(s![
        src_start[0]..src_start[0] + len[0],
        src_start[1]..src_start[1] + len[1],
        src_start[2]..src_start[2] + len[2]
    ]));
    out
}

/// Number of voxels whose label differs from `background`.
pub fn foreground_count(labels: &Array3<u8>, background: u8) -> usize {
    labels.iter().filter(|&&v| v != background).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_stays_in_unit_interval() {
        let raw = Array3::from_shape_vec(
            (2, 2, 2),
            vec![-1000.0, 0.0, 10.0, 500.0, 2100.0, 3000.0, 1.0, 42.0],
        )
        .unwrap();
        for (min, max) in [(0.0, 2100.0), (100.0, 2100.0), (0.0, 1.0)] {
            let out = normalize(&raw, min, max);
            let in_unit = out.iter().all(|&v| (0.0..=1.0).contains(&v));
            assert!(in_unit, "bounds ({min}, {max})");
        }
    }

    #[test]
    fn test_normalize_maps_max_to_one() {
        let raw = Array3::from_elem((1, 1, 1), 5000.0f32);
        let out = normalize(&raw, 0.0, 2100.0);
        assert!((out[[0, 0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_crop_or_pad_identity_on_canonical_shape() {
        let src = Array3::from_shape_fn((4, 6, 8), |(z, y, x)| (z * 100 + y * 10 + x) as f32);
        let out = crop_or_pad(&src, [4, 6, 8], -1.0);
        assert_eq!(out, src);
    }

    #[test]
    fn test_pad_centers_and_fills_background() {
        let src = Array3::from_elem((100, 100, 100), 1u8);
        let out = crop_or_pad(&src, [152, 224, 256], 0u8);
        assert_eq!(out.dim(), (152, 224, 256));
        // leading pads: 26, 62, 78
        assert_eq!(out[[26, 62, 78]], 1);
        assert_eq!(out[[125, 161, 177]], 1);
        assert_eq!(out[[25, 62, 78]], 0);
        assert_eq!(out[[126, 161, 177]], 0);
        assert_eq!(out[[26, 61, 78]], 0);
        assert_eq!(out[[26, 62, 77]], 0);
        assert_eq!(foreground_count(&out, 0), 100 * 100 * 100);
    }

    #[test]
    fn test_crop_takes_center() {
        let src = Array3::from_shape_fn((5, 1, 1), |(z, _, _)| z as u8);
        let out = crop_or_pad(&src, [2, 1, 1], 0);
        // (5 - 2) / 2 = 1 voxel dropped on the leading side
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_crop_then_pad_back_restores_shape() {
        let src = Array3::from_elem((6, 6, 6), 3u8);
        let cropped = crop_or_pad(&src, [4, 4, 4], 0);
        let restored = crop_or_pad(&cropped, [6, 6, 6], 0);
        assert_eq!(restored.dim(), (6, 6, 6));
        assert_eq!(foreground_count(&restored, 0), 64);
    }
}
