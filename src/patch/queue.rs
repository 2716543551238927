use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::{DataLoaderConfig, LabelSet};
use crate::error::DataError;
use crate::patch::{extract_patch, Augmenter, GridSampler, LabelSampler, Patch, SamplerKind};
use crate::volume::Subject;

/// How training patches are drawn from a subject.
#[derive(Debug, Clone)]
pub enum PatchPolicy {
    Grid { patch: [usize; 3], overlap: usize },
    ByLabel(LabelSampler),
}

impl PatchPolicy {
    pub fn from_config(config: &DataLoaderConfig, labels: &LabelSet) -> Self {
        match config.sampler_type {
            SamplerKind::Grid => PatchPolicy::Grid {
                patch: config.patch_shape,
                overlap: config.grid_overlap,
            },
            SamplerKind::ByLabel => PatchPolicy::ByLabel(LabelSampler::from_config(config, labels)),
        }
    }

    /// Push `count` augmented patches of `subject` into `tx`. Returns false
    /// once the consumer is gone.
    fn produce(
        &self,
        subject: &Subject,
        count: usize,
        augment: &Augmenter,
        rng: &mut StdRng,
        tx: &Sender<Result<Patch, DataError>>,
        stop: &AtomicBool,
    ) -> bool {
        let send = |item: Result<Patch, DataError>, rng: &mut StdRng| {
            let item = item.map(|mut patch| {
                if !augment.is_empty() {
                    augment.apply(&mut patch, rng);
                }
                patch
            });
            !stop.load(Ordering::Relaxed) && tx.send(item).is_ok()
        };
        match self {
            PatchPolicy::Grid { patch, overlap } => {
                let grid = match GridSampler::new(subject.volume().shape(), *patch, *overlap) {
                    Ok(grid) => grid,
                    Err(e) => {
                        let _ = send(Err(e), rng);
                        return false;
                    }
                };
                for &offset in grid.offsets().iter().cycle().take(count) {
                    let item = extract_patch(subject, offset, *patch, true);
                    let failed = item.is_err();
                    if !send(item, rng) || failed {
                        return false;
                    }
                }
            }
            PatchPolicy::ByLabel(sampler) => {
                for _ in 0..count {
                    let item = sampler.sample(subject, rng);
                    let failed = item.is_err();
                    if !send(item, rng) || failed {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// Sizing of the prefetch queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Channel capacity; producers block once it is full.
    pub max_length: usize,
    pub samples_per_volume: usize,
    pub num_workers: usize,
}

impl QueueConfig {
    pub fn from_config(config: &DataLoaderConfig) -> Self {
        QueueConfig {
            max_length: config.queue_length(),
            samples_per_volume: config.samples_per_volume(),
            num_workers: config.num_workers,
        }
    }

    /// Patches drawn from a subject with partition weight `weight`.
    pub fn patches_for(&self, weight: f32) -> usize {
        ((self.samples_per_volume as f32 * weight).round() as usize).max(1)
    }
}

/// Bounded producer/consumer stream of training patches for one epoch.
///
/// Subjects are shuffled and dealt round-robin to `num_workers` threads.
/// Each worker augments its patches with its own seeded RNG. Patches arrive
/// in no particular order. Dropping the queue disconnects the
/// channel and joins the workers.
pub struct PatchQueue {
    rx: Option<Receiver<Result<Patch, DataError>>>,
    workers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    total: usize,
}

impl PatchQueue {
    pub fn spawn(
        subjects: &[Arc<Subject>],
        policy: Arc<PatchPolicy>,
        augment: Arc<Augmenter>,
        config: QueueConfig,
        seed: u64,
    ) -> Self {
        let (tx, rx) = bounded(config.max_length.max(1));
        let stop = Arc::new(AtomicBool::new(false));

        let mut order: Vec<Arc<Subject>> = subjects.to_vec();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        let total = order
            .iter()
            .map(|s| config.patches_for(s.provenance().weight))
            .sum();

        let num_workers = config.num_workers.max(1).min(order.len().max(1));
        let mut assignments: Vec<Vec<Arc<Subject>>> = vec![Vec::new(); num_workers];
        for (i, subject) in order.into_iter().enumerate() {
            assignments[i % num_workers].push(subject);
        }

        let workers = assignments
            .into_iter()
            .enumerate()
            .map(|(worker, assigned)| {
                let tx = tx.clone();
                let stop = Arc::clone(&stop);
                let policy = Arc::clone(&policy);
                let augment = Arc::clone(&augment);
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(worker as u64 + 1));
                thread::spawn(move || {
                    for subject in assigned {
                        let count = config.patches_for(subject.provenance().weight);
                        if !policy.produce(&subject, count, &augment, &mut rng, &tx, &stop) {
                            tracing::debug!(worker, subject = subject.id(), "patch worker stopped");
                            return;
                        }
                    }
                })
            })
            .collect();

        PatchQueue {
            rx: Some(rx),
            workers,
            stop,
            total,
        }
    }

    /// Patches the epoch will yield if no worker fails.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Patches currently buffered.
    pub fn buffered(&self) -> usize {
        self.rx.as_ref().map(Receiver::len).unwrap_or(0)
    }
}

impl Iterator for PatchQueue {
    type Item = Result<Patch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for PatchQueue {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.rx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
