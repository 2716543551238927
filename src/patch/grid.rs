use crate::error::DataError;
use crate::patch::{extract_patch, Patch};
use crate::volume::Subject;

/// Deterministic tiling of a volume.
///
/// Offsets advance by `patch - overlap` per axis and the last offset is
/// pinned to `dim - patch`, so every voxel is covered. Order is z-major.
#[derive(Debug, Clone)]
pub struct GridSampler {
    patch: [usize; 3],
    offsets: Vec<[usize; 3]>,
}

fn axis_offsets(dim: usize, patch: usize, overlap: usize) -> Vec<usize> {
    let step = patch.saturating_sub(overlap).max(1);
    let mut offsets = Vec::new();
    let mut offset = 0;
    while offset + patch < dim {
        offsets.push(offset);
        offset += step;
    }
    offsets.push(dim - patch);
    offsets.dedup();
    offsets
}

impl GridSampler {
    pub fn new(volume: [usize; 3], patch: [usize; 3], overlap: usize) -> Result<Self, DataError> {
        if (0..3).any(|i| patch[i] == 0 || patch[i] > volume[i]) {
            return Err(DataError::PatchTooLarge { patch, volume });
        }
        let zs = axis_offsets(volume[0], patch[0], overlap);
        let ys = axis_offsets(volume[1], patch[1], overlap);
        let xs = axis_offsets(volume[2], patch[2], overlap);

        let mut offsets = Vec::with_capacity(zs.len() * ys.len() * xs.len());
        for &z in &zs {
            for &y in &ys {
                for &x in &xs {
                    offsets.push([z, y, x]);
                }
            }
        }
        Ok(GridSampler { patch, offsets })
    }

    pub fn patch_shape(&self) -> [usize; 3] {
        self.patch
    }

    pub fn offsets(&self) -> &[[usize; 3]] {
        &self.offsets
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Lazily cut every grid patch of `subject`. Can be called again to
    /// restart from the first offset.
    pub fn patches<'a>(
        &'a self,
        subject: &'a Subject,
        with_labels: bool,
    ) -> impl Iterator<Item = Result<Patch, DataError>> + 'a {
        self.offsets
            .iter()
            .map(move |&offset| extract_patch(subject, offset, self.patch, with_labels))
    }
}
