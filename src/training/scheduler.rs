use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerKind {
    MultiStepLR,
    Plateau,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Absent means a constant learning rate.
    pub name: Option<SchedulerKind>,
    pub milestones: Vec<usize>,
    pub factor: f64,
    pub patience: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            name: None,
            milestones: Vec::new(),
            factor: 0.1,
            patience: 7,
        }
    }
}

/// What the trainer feeds the scheduler at the end of an epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepSignal {
    Metric(f64),
    Epoch(usize),
}

/// Learning-rate schedule with its mutable state, persisted in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum LrScheduler {
    Constant {
        lr: f64,
    },
    MultiStep {
        base_lr: f64,
        milestones: Vec<usize>,
        factor: f64,
        last_epoch: Option<usize>,
    },
    /// Reduce on plateau, maximizing the metric.
    Plateau {
        lr: f64,
        factor: f64,
        patience: usize,
        best: Option<f64>,
        bad_epochs: usize,
    },
}

impl LrScheduler {
    pub fn new(config: &SchedulerConfig, base_lr: f64) -> Self {
        match config.name {
            None => LrScheduler::Constant { lr: base_lr },
            Some(SchedulerKind::MultiStepLR) => {
                let mut milestones = config.milestones.clone();
                milestones.sort_unstable();
                LrScheduler::MultiStep {
                    base_lr,
                    milestones,
                    factor: config.factor,
                    last_epoch: None,
                }
            }
            Some(SchedulerKind::Plateau) => LrScheduler::Plateau {
                lr: base_lr,
                factor: config.factor,
                patience: config.patience,
                best: None,
                bad_epochs: 0,
            },
        }
    }

    /// Plateau schedules consume the validation metric; the rest the epoch index.
    pub fn wants_metric(&self) -> bool {
        matches!(self, LrScheduler::Plateau { .. })
    }

    pub fn lr(&self) -> f64 {
        match self {
            LrScheduler::Constant { lr } | LrScheduler::Plateau { lr, .. } => *lr,
            LrScheduler::MultiStep {
                base_lr,
                milestones,
                factor,
                last_epoch,
            } => {
                let passed = last_epoch.map_or(0, |epoch| {
                    milestones.iter().filter(|&&m| m <= epoch).count()
                });
                base_lr * factor.powi(passed as i32)
            }
        }
    }

    /// Best metric seen by a plateau schedule.
    pub fn best(&self) -> Option<f64> {
        match self {
            LrScheduler::Plateau { best, .. } => *best,
            _ => None,
        }
    }

    /// Advance the schedule. A signal of the wrong kind is ignored.
    pub fn observe(&mut self, signal: StepSignal) {
        match (self, signal) {
            (LrScheduler::MultiStep { last_epoch, .. }, StepSignal::Epoch(epoch)) => {
                *last_epoch = Some(epoch);
            }
            (
                LrScheduler::Plateau {
                    lr,
                    factor,
                    patience,
                    best,
                    bad_epochs,
                },
                StepSignal::Metric(metric),
            ) => {
                if best.is_none_or(|b| metric > b) {
                    *best = Some(metric);
                    *bad_epochs = 0;
                } else {
                    *bad_epochs += 1;
                }
                if *bad_epochs > *patience {
                    *lr *= *factor;
                    *bad_epochs = 0;
                    tracing::info!(lr = *lr, "reducing learning rate on plateau");
                }
            }
            (_, signal) => tracing::debug!(?signal, "scheduler ignores signal"),
        }
    }
}
