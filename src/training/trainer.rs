use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::optim::GradientsParams;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{now_secs, CheckpointManager, CheckpointMetadata, CheckpointSlot};
use crate::config::AppConfig;
use crate::error::{DataError, DistributedError, TrainingError};
use crate::loss::{DeviceClass, LossEngine};
use crate::model::{self, UNet3d};
use crate::patch::encoding::{encode_labels_batch, encode_patches_batch, encode_positions_batch};
use crate::patch::{Augmenter, Patch, PatchPolicy, PatchQueue, QueueConfig};
use crate::training::context::RunContext;
use crate::training::distributed::{
    self, average_gradients, broadcast_parameters, broadcast_scalar, Collective,
};
use crate::training::evaluate::Evaluator;
use crate::training::metrics::{LossWindow, StepTiming};
use crate::training::optimizer::SegOptimizer;
use crate::training::scheduler::{LrScheduler, StepSignal};
use crate::volume::{Partition, VolumeStore};
use crate::weights::{median_frequency_balancing, ClassWeights};

/// Trainer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub do_train: bool,
    pub epochs: usize,
    /// Checkpoint directory to resume from.
    pub checkpoint_path: Option<PathBuf>,
    /// Epochs between full test-set evaluations.
    pub test_interval: usize,
    pub divergence_threshold: f64,
    pub divergence_min_epochs: usize,
    pub abort_on_divergence: bool,
    /// Write final predictions to `<run_dir>/dumps`.
    pub dump_results: bool,
    /// Optimizer steps between progress records.
    pub log_interval: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            do_train: true,
            epochs: 100,
            checkpoint_path: None,
            test_interval: 5,
            divergence_threshold: 1e-5,
            divergence_min_epochs: 10,
            abort_on_divergence: true,
            dump_results: false,
            log_interval: 50,
        }
    }
}

/// States of one training run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Resume,
    EpochLoop,
    FinalEval,
    Done,
}

/// Outcome of a run as seen by one rank. Final metrics are only computed
/// by the coordinating rank.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub phases: Vec<RunPhase>,
    pub start_epoch: usize,
    pub epochs_completed: usize,
    pub last_metric: Option<f64>,
    pub best_metric: Option<f64>,
    pub diverged: bool,
    pub val_metric: Option<f64>,
    pub test_metric: Option<f64>,
}

struct TrainState<B: AutodiffBackend> {
    model: UNet3d<B>,
    optimizer: SegOptimizer<B, UNet3d<B>>,
    scheduler: LrScheduler,
    start_epoch: usize,
    best_metric: Option<f64>,
}

/// One rank of the training run.
pub struct Trainer<'a, B: AutodiffBackend> {
    ctx: &'a RunContext,
    store: &'a VolumeStore,
    collective: &'a dyn Collective,
    device: B::Device,
    loss: LossEngine,
    evaluator: Evaluator,
    checkpoints: CheckpointManager,
    phases: Vec<RunPhase>,
}

impl<'a, B> Trainer<'a, B>
where
    B: AutodiffBackend,
    B::Device: DeviceClass,
{
    pub fn new(
        ctx: &'a RunContext,
        store: &'a VolumeStore,
        collective: &'a dyn Collective,
        device: B::Device,
        weights: &ClassWeights,
    ) -> Result<Self, TrainingError> {
        let config = ctx.config();
        Ok(Trainer {
            ctx,
            store,
            collective,
            device,
            loss: LossEngine::new(&config.loss, store.labels(), weights)?,
            evaluator: Evaluator::new(config, store.labels()),
            checkpoints: CheckpointManager::new(ctx.checkpoint_dir()),
            phases: Vec::new(),
        })
    }

    fn coordinator(&self) -> bool {
        self.collective.is_coordinator()
    }

    fn enter(&mut self, phase: RunPhase) {
        if self.coordinator() {
            tracing::info!(?phase, "entering phase");
        }
        self.phases.push(phase);
    }

    /// Drive the run through every phase.
    pub fn run(mut self) -> Result<RunReport, TrainingError> {
        let ctx = self.ctx;
        let config = ctx.config();

        self.enter(RunPhase::Init);
        let mut state = self.init();
        if let Some(path) = ctx.resume_path() {
            self.enter(RunPhase::Resume);
            state = self.resume(state, &path);
        }
        state.model = broadcast_parameters(state.model, self.collective, &self.device)?;

        let mut report = RunReport {
            start_epoch: state.start_epoch,
            best_metric: state.best_metric,
            ..Default::default()
        };

        if config.trainer.do_train {
            self.enter(RunPhase::EpochLoop);
            state = self.epoch_loop(state, &mut report)?;
        } else if self.coordinator() {
            tracing::info!("training disabled, evaluating only");
        }

        self.enter(RunPhase::FinalEval);
        if self.coordinator() {
            let evaluator = if config.trainer.dump_results {
                self.evaluator.clone().with_dump_dir(ctx.dump_dir())
            } else {
                self.evaluator.clone()
            };
            let model = state.model.valid();
            let val =
                evaluator.evaluate(&model, self.store.subjects(Partition::Val), &self.device)?;
            let test =
                evaluator.evaluate(&model, self.store.subjects(Partition::Test), &self.device)?;
            tracing::info!(val, test, "final evaluation");
            report.val_metric = Some(val);
            report.test_metric = Some(test);
        }
        self.collective.barrier()?;

        self.enter(RunPhase::Done);
        report.phases = self.phases;
        Ok(report)
    }

    fn init(&self) -> TrainState<B> {
        let config = self.ctx.config();
        let num_classes = self.store.labels().num_classes();
        TrainState {
            model: model::build(&config.model, num_classes, &self.device),
            optimizer: SegOptimizer::new(&config.optimizer),
            scheduler: LrScheduler::new(&config.lr_scheduler, config.optimizer.learning_rate),
            start_epoch: 0,
            best_metric: None,
        }
    }

    /// Restore from `path`; any failure keeps the fresh state.
    fn resume(&self, state: TrainState<B>, path: &Path) -> TrainState<B> {
        let TrainState {
            model,
            optimizer,
            scheduler,
            ..
        } = state;
        match CheckpointManager::load(path, model.clone(), optimizer, &self.device) {
            Ok(restored) => {
                let meta = restored.metadata;
                if self.coordinator() {
                    tracing::info!(
                        path = %path.display(),
                        epoch = meta.epoch,
                        metric = meta.metric,
                        "resumed from checkpoint"
                    );
                }
                TrainState {
                    model: restored.model,
                    optimizer: restored.optimizer,
                    scheduler: meta.scheduler,
                    start_epoch: meta.epoch + 1,
                    best_metric: Some(meta.best_metric),
                }
            }
            Err(e) => {
                if self.coordinator() {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "could not resume, starting from epoch 0"
                    );
                }
                TrainState {
                    model,
                    optimizer: SegOptimizer::new(&self.ctx.config().optimizer),
                    scheduler,
                    start_epoch: 0,
                    best_metric: None,
                }
            }
        }
    }

    /// Optimizer steps per epoch: the minimum over ranks, so every rank
    /// issues the same number of collective calls.
    fn steps_per_epoch(&self, local: usize) -> Result<usize, DistributedError> {
        let mut counts = vec![0.0f32; self.collective.world_size()];
        counts[self.collective.rank()] = local as f32;
        let counts = self.collective.all_reduce_sum(counts)?;
        let steps = counts.iter().map(|&c| c as usize).min().unwrap_or(0);
        if self.coordinator() {
            tracing::info!(steps, ?counts, "steps per epoch");
        }
        Ok(steps)
    }

    fn epoch_loop(
        &self,
        mut state: TrainState<B>,
        report: &mut RunReport,
    ) -> Result<TrainState<B>, TrainingError> {
        let config: &AppConfig = self.ctx.config();
        let dl = &config.data_loader;
        let trainer = &config.trainer;
        let (rank, world) = (self.collective.rank(), self.collective.world_size());

        let shard = self.store.training_shard(rank, world);
        let policy = Arc::new(PatchPolicy::from_config(dl, self.store.labels()));
        let augment = Arc::new(Augmenter::new(dl.augmentations.clone()));
        let queue_config = QueueConfig::from_config(dl);
        let batch_size = dl.batch_size.max(1);
        let local_patches: usize = shard
            .iter()
            .map(|s| queue_config.patches_for(s.provenance().weight))
            .sum();
        let steps = self.steps_per_epoch(local_patches.div_ceil(batch_size))?;
        if steps == 0 && self.coordinator() {
            tracing::warn!("no training patches, epochs will only validate");
        }

        let canonical = self.store.preprocessor().canonical_shape();
        let log_interval = trainer.log_interval.max(1);
        let mut losses = LossWindow::new();
        let mut timing = StepTiming::new();

        for epoch in state.start_epoch..trainer.epochs {
            timing.reset_window();
            let seed = config.seed.wrapping_add((epoch * world + rank) as u64);
            let mut queue = PatchQueue::spawn(
                &shard,
                Arc::clone(&policy),
                Arc::clone(&augment),
                queue_config,
                seed,
            );

            let mut epoch_loss = 0.0f32;
            for step in 0..steps {
                let started = Instant::now();
                let batch = next_batch(&mut queue, batch_size)?;
                let input = encode_patches_batch::<B>(&batch, &self.device)?;
                let position = encode_positions_batch::<B>(&batch, canonical, &self.device)?;
                let target = encode_labels_batch::<B>(&batch, &self.device)?;

                let output = self.loss.compute(state.model.forward(input, position), target)?;
                let mut grads = GradientsParams::from_grads(output.total.backward(), &state.model);
                average_gradients::<B, _>(&state.model, &mut grads, self.collective, &self.device)?;
                state.model = state.optimizer.step(state.scheduler.lr(), state.model, grads);

                let value = output.value();
                epoch_loss += value;
                losses.record(value);
                timing.record_step(started.elapsed());

                if self.coordinator() && (step + 1) % log_interval == 0 {
                    tracing::info!(
                        epoch,
                        step = step + 1,
                        steps,
                        loss = losses.average(log_interval),
                        step_ms = timing.avg_step_ms(log_interval),
                        buffered = queue.buffered(),
                        "training"
                    );
                }
            }
            drop(queue);

            let totals = self.collective.all_reduce_sum(vec![epoch_loss, steps as f32])?;
            let mean_loss = if totals[1] > 0.0 { totals[0] / totals[1] } else { 0.0 };
            let steps_per_sec = timing.steps_per_sec();

            let overhead = Instant::now();
            let local_metric = if self.coordinator() {
                let model = state.model.valid();
                self.evaluator
                    .evaluate(&model, self.store.subjects(Partition::Val), &self.device)?
            } else {
                0.0
            };
            let metric = broadcast_scalar(self.collective, local_metric)?;

            if state.scheduler.wants_metric() {
                state.scheduler.observe(StepSignal::Metric(metric));
            } else {
                state.scheduler.observe(StepSignal::Epoch(epoch));
            }

            let improved = state.best_metric.is_none_or(|best| metric > best);
            if improved {
                state.best_metric = Some(metric);
            }

            if self.coordinator() {
                tracing::info!(
                    epoch,
                    loss = mean_loss,
                    metric,
                    best = state.best_metric,
                    lr = state.scheduler.lr(),
                    steps_per_sec,
                    total_steps = losses.total_steps(),
                    "epoch finished"
                );
                let metadata = CheckpointMetadata {
                    epoch,
                    metric,
                    best_metric: state.best_metric.unwrap_or(metric),
                    timestamp: now_secs(),
                    model: config.model.name.as_str().to_string(),
                    optimizer: state.optimizer.kind().as_str().to_string(),
                    scheduler: state.scheduler.clone(),
                };
                if improved {
                    self.save(CheckpointSlot::Best, &state, &metadata);
                }
                self.save(CheckpointSlot::Last, &state, &metadata);

                if (epoch + 1) % trainer.test_interval.max(1) == 0 {
                    let model = state.model.valid();
                    let test = self
                        .evaluator
                        .evaluate(&model, self.store.subjects(Partition::Test), &self.device)?;
                    tracing::info!(epoch, test, "periodic test evaluation");
                }
            }
            timing.record_overhead(overhead.elapsed());

            report.epochs_completed += 1;
            report.last_metric = Some(metric);
            report.best_metric = state.best_metric;

            self.collective.barrier()?;

            if metric < trainer.divergence_threshold && epoch > trainer.divergence_min_epochs {
                if self.coordinator() {
                    tracing::warn!(epoch, metric, "validation metric collapsed");
                }
                if trainer.abort_on_divergence {
                    report.diverged = true;
                    break;
                }
            }
        }
        Ok(state)
    }

    fn save(
        &self,
        slot: CheckpointSlot,
        state: &TrainState<B>,
        metadata: &CheckpointMetadata,
    ) {
        match self.checkpoints.save(slot, &state.model, &state.optimizer, metadata) {
            Ok(path) => tracing::info!(path = %path.display(), "checkpoint saved"),
            Err(e) => tracing::error!(slot = slot.dir_name(), error = %e, "checkpoint failed"),
        }
    }
}

fn next_batch(queue: &mut PatchQueue, batch_size: usize) -> Result<Vec<Patch>, DataError> {
    let batch: Vec<Patch> = queue.by_ref().take(batch_size).collect::<Result<_, _>>()?;
    if batch.is_empty() {
        return Err(DataError::Tensor(
            "patch queue ended before the epoch did".into(),
        ));
    }
    Ok(batch)
}

/// Configured weights, or median frequency balancing over the training set.
pub fn class_weights(
    config: &AppConfig,
    store: &VolumeStore,
) -> Result<ClassWeights, TrainingError> {
    let labels = store.labels();
    if let Some(fixed) = &config.data_loader.weights {
        return Ok(ClassWeights::from_configured(fixed, labels)?);
    }
    let training = store.training_set();
    if training.is_empty() {
        return Ok(ClassWeights::uniform(labels));
    }
    let maps = training
        .iter()
        .map(|s| s.training_labels())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(median_frequency_balancing(labels, maps))
}

/// Train on already loaded subjects, one rank per device.
pub fn run_with_store<B, D>(
    ctx: &RunContext,
    store: &VolumeStore,
    device_for: D,
) -> Result<RunReport, TrainingError>
where
    B: AutodiffBackend,
    B::Device: DeviceClass,
    D: Fn(usize) -> B::Device + Sync,
{
    let config = ctx.config();
    if config.trainer.do_train {
        store.require_validation()?;
    }
    B::seed(config.seed);
    let weights = class_weights(config, store)?;
    for (id, weight) in weights.as_slice().iter().enumerate() {
        let label = store.labels().name(id as u8).unwrap_or("?");
        tracing::info!(label, weight, "class weight");
    }

    let reports = distributed::launch(config.distributed.world_size, |collective| {
        let device = device_for(collective.rank());
        Trainer::<B>::new(ctx, store, collective, device, &weights)?.run()
    })?;
    reports
        .into_iter()
        .next()
        .ok_or_else(|| DistributedError::Panicked.into())
}

/// Load the split, then train.
pub fn run<B, D>(ctx: &RunContext, device_for: D) -> Result<RunReport, TrainingError>
where
    B: AutodiffBackend,
    B::Device: DeviceClass,
    D: Fn(usize) -> B::Device + Sync,
{
    let config = ctx.config();
    let store = VolumeStore::open(
        &config.data_loader,
        config.label_set()?,
        config.trainer.do_train,
    )?;
    run_with_store::<B, D>(ctx, &store, device_for)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplesPerVolume;
    use crate::error::ConfigError;
    use crate::patch::Augmentation;
    use crate::patch::test_support::ramp_subject;
    use crate::volume::Subject;
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::{Autodiff, NdArray};
    use ndarray::Array3;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_config(results: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.results_dir = results.to_path_buf();
        config.logging.to_file = false;
        config.data_loader.resize_shape = [4, 4, 4];
        config.data_loader.patch_shape = [2, 2, 2];
        config.data_loader.samples_per_volume = SamplesPerVolume::Fixed(2);
        config.data_loader.num_workers = 1;
        config.model.base_channels = 2;
        config.model.depth = 1;
        config.trainer.epochs = 2;
        config.trainer.log_interval = 1;
        config
    }

    fn subject(partition: Partition) -> Subject {
        let mut labels = Array3::zeros((4, 4, 4));
        labels[[1, 1, 1]] = 1u8;
        labels[[2, 2, 2]] = 1u8;
        ramp_subject([4, 4, 4], labels, partition)
    }

    fn tiny_store(config: &AppConfig) -> VolumeStore {
        let subjects = vec![
            subject(Partition::Train),
            subject(Partition::Train),
            subject(Partition::Val),
            subject(Partition::Test),
        ];
        VolumeStore::from_subjects(&config.data_loader, config.label_set().unwrap(), subjects)
    }

    fn run_tiny(config: AppConfig) -> Result<RunReport, TrainingError> {
        let store = tiny_store(&config);
        let ctx = RunContext::new(config, true)?;
        run_with_store::<TestBackend, _>(&ctx, &store, |_| NdArrayDevice::Cpu)
    }

    #[test]
    fn test_run_walks_phases_and_writes_slots() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path());
        let checkpoints = config.run_dir().join("checkpoints");

        let report = run_tiny(config).unwrap();
        assert_eq!(
            report.phases,
            vec![RunPhase::Init, RunPhase::EpochLoop, RunPhase::FinalEval, RunPhase::Done]
        );
        assert_eq!(report.epochs_completed, 2);
        assert!(report.val_metric.is_some());
        assert!(report.test_metric.is_some());

        let last = CheckpointManager::load_metadata(&checkpoints.join("last")).unwrap();
        assert_eq!(last.epoch, 1);
        let best = CheckpointManager::load_metadata(&checkpoints.join("best")).unwrap();
        assert_eq!(Some(best.metric), report.best_metric);
    }

    #[test]
    fn test_resume_continues_after_saved_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path());
        let last = config.run_dir().join("checkpoints").join("last");
        run_tiny(config.clone()).unwrap();

        let mut resumed = config;
        resumed.trainer.epochs = 3;
        resumed.trainer.checkpoint_path = Some(last);
        let report = run_tiny(resumed).unwrap();
        assert_eq!(report.phases[1], RunPhase::Resume);
        assert_eq!(report.start_epoch, 2);
        assert_eq!(report.epochs_completed, 1);
    }

    #[test]
    fn test_unreadable_checkpoint_starts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config(dir.path());
        config.trainer.epochs = 1;
        config.trainer.checkpoint_path = Some(dir.path().join("missing"));
        let report = run_tiny(config).unwrap();
        assert_eq!(report.start_epoch, 0);
        assert_eq!(report.epochs_completed, 1);
    }

    #[test]
    fn test_evaluation_only_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config(dir.path());
        config.trainer.do_train = false;
        config.trainer.dump_results = true;
        let dumps = config.run_dir().join("dumps");
        let report = run_tiny(config).unwrap();
        assert_eq!(
            report.phases,
            vec![RunPhase::Init, RunPhase::Resume, RunPhase::FinalEval, RunPhase::Done]
        );
        assert_eq!(report.epochs_completed, 0);
        assert!(report.val_metric.is_some());
        assert!(dumps.join("ramp.npy").is_file());
    }

    #[test]
    fn test_divergence_guard_stops_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config(dir.path());
        config.trainer.epochs = 5;
        config.trainer.divergence_threshold = 2.0;
        config.trainer.divergence_min_epochs = 0;
        let report = run_tiny(config).unwrap();
        assert!(report.diverged);
        assert_eq!(report.epochs_completed, 2);
        assert!(report.phases.contains(&RunPhase::FinalEval));
    }

    #[test]
    fn test_two_ranks_agree() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config(dir.path());
        config.distributed.world_size = 2;
        let report = run_tiny(config).unwrap();
        assert_eq!(report.epochs_completed, 2);
        assert!(report.val_metric.is_some());
    }

    #[test]
    fn test_training_without_val_partition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path());
        let store = VolumeStore::from_subjects(
            &config.data_loader,
            config.label_set().unwrap(),
            vec![subject(Partition::Train), subject(Partition::Test)],
        );
        let ctx = RunContext::new(config, true).unwrap();
        let err =
            run_with_store::<TestBackend, _>(&ctx, &store, |_| NdArrayDevice::Cpu).unwrap_err();
        assert!(matches!(
            err,
            TrainingError::Config(ConfigError::Validation(_))
        ));
        assert!(!ctx.checkpoint_dir().join("best").exists());
    }

    #[test]
    fn test_augmented_training_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config(dir.path());
        config.data_loader.augmentations = vec![
            Augmentation::RandomFlip {
                axes: vec![0, 2],
                flip_probability: 1.0,
            },
            Augmentation::RandomIntensity {
                scale: [0.9, 1.1],
                shift: [-0.1, 0.1],
                probability: 0.5,
            },
        ];
        let report = run_tiny(config).unwrap();
        assert_eq!(report.epochs_completed, 2);
    }

    #[test]
    fn test_configured_weights_bypass_estimation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config(dir.path());
        config.data_loader.weights = Some(vec![1.0, 3.0]);
        let store = tiny_store(&config);
        let weights = class_weights(&config, &store).unwrap();
        assert_eq!(weights.len(), 2);
        assert!(weights.as_slice()[1] > weights.as_slice()[0]);
    }
}
