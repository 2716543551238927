use std::path::PathBuf;
use std::sync::Arc;

use burn::prelude::*;
use burn::tensor::activation::softmax;
use ndarray::Array3;

use crate::config::{AppConfig, LabelSet};
use crate::error::{DataError, TrainingError};
use crate::model::UNet3d;
use crate::patch::encoding::{decode_batch, encode_patches_batch, encode_positions_batch};
use crate::patch::{GridSampler, OverlapMode, Patch, PatchAggregator};
use crate::training::metrics::{mean_iou, partition_mean};
use crate::volume::io::write_labels;
use crate::volume::Subject;

/// Whole-volume inference over the evaluation grid.
#[derive(Debug, Clone)]
pub struct Evaluator {
    patch: [usize; 3],
    overlap: usize,
    mode: OverlapMode,
    batch_size: usize,
    num_classes: usize,
    scored: Vec<u8>,
    dump_dir: Option<PathBuf>,
}

impl Evaluator {
    pub fn new(config: &AppConfig, labels: &LabelSet) -> Self {
        let dl = &config.data_loader;
        Evaluator {
            patch: dl.patch_shape,
            overlap: dl.eval_overlap,
            mode: dl.aggregation,
            batch_size: dl.batch_size.max(1),
            num_classes: labels.num_classes(),
            scored: labels.objective_ids(),
            dump_dir: None,
        }
    }

    /// Write each prediction to `<dir>/<subject>.npy` from now on.
    pub fn with_dump_dir(mut self, dir: PathBuf) -> Self {
        self.dump_dir = Some(dir);
        self
    }

    /// Predicted label map of one subject.
    pub fn predict<B: Backend>(
        &self,
        model: &UNet3d<B>,
        subject: &Subject,
        device: &B::Device,
    ) -> Result<Array3<u8>, DataError> {
        let shape = subject.volume().shape();
        let grid = GridSampler::new(shape, self.patch, self.overlap)?;
        let mut aggregator = PatchAggregator::new(self.num_classes, shape, self.mode);

        let mut patches = grid.patches(subject, false).peekable();
        while patches.peek().is_some() {
            let batch: Vec<Patch> = patches
                .by_ref()
                .take(self.batch_size)
                .collect::<Result<_, _>>()?;
            let input = encode_patches_batch::<B>(&batch, device)?;
            let position = encode_positions_batch::<B>(&batch, shape, device)?;
            let scores = softmax(model.forward(input, position), 1);
            for (patch, prediction) in batch.iter().zip(decode_batch(scores)?) {
                aggregator.add(patch.offset, prediction.view())?;
            }
        }
        aggregator.finish_labels()
    }

    /// Mean IoU over `subjects`; predictions are dumped when configured.
    pub fn evaluate<B: Backend>(
        &self,
        model: &UNet3d<B>,
        subjects: &[Arc<Subject>],
        device: &B::Device,
    ) -> Result<f64, TrainingError> {
        if let Some(dir) = &self.dump_dir {
            std::fs::create_dir_all(dir)?;
        }
        let mut scores = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let prediction = self.predict(model, subject, device)?;
            let reference = subject.reference().data().view();
            let iou = mean_iou(prediction.view(), reference, &self.scored);
            tracing::debug!(subject = subject.id(), iou, "evaluated subject");
            if let Some(dir) = &self.dump_dir {
                write_labels(&dir.join(format!("{}.npy", subject.id())), &prediction)?;
            }
            scores.push(iou);
        }
        Ok(partition_mean(&scores))
    }
}
