//! In-process rank group: one worker thread per rank, each with its own
//! device and model replica.
//!
//! Every collective call is a rendezvous. All ranks must issue the same
//! sequence of calls; the last rank to arrive combines the contributions and
//! wakes the others. A failing rank aborts the group so nobody waits forever.

use std::sync::{Arc, Condvar, Mutex};

use burn::module::{AutodiffModule, ModuleMapper, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};

use crate::error::{DistributedError, TrainingError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    pub world_size: usize,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        DistributedConfig { world_size: 1 }
    }
}

/// Collective operations over the rank group.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    fn barrier(&self) -> Result<(), DistributedError>;
    /// Elementwise sum of every rank's `values`.
    fn all_reduce_sum(&self, values: Vec<f32>) -> Result<Vec<f32>, DistributedError>;
    /// Rank 0's `values`, delivered to everyone.
    fn broadcast(&self, values: Vec<f32>) -> Result<Vec<f32>, DistributedError>;
    /// Release every waiting rank with a failure.
    fn abort(&self, reason: &str);

    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }
}

/// The trivial group of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoloCollective;

impl Collective for SoloCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), DistributedError> {
        Ok(())
    }

    fn all_reduce_sum(&self, values: Vec<f32>) -> Result<Vec<f32>, DistributedError> {
        Ok(values)
    }

    fn broadcast(&self, values: Vec<f32>) -> Result<Vec<f32>, DistributedError> {
        Ok(values)
    }

    fn abort(&self, _reason: &str) {}
}

#[derive(Debug, Clone, Copy)]
enum Combine {
    Sum,
    FromRoot,
}

struct GroupState {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Vec<f32>>>,
    result: Arc<Vec<f32>>,
    failure: Option<(usize, String)>,
}

/// Shared rendezvous state of a thread-based rank group.
pub struct LocalGroup {
    world_size: usize,
    state: Mutex<GroupState>,
    wake: Condvar,
}

impl LocalGroup {
    pub fn new(world_size: usize) -> Arc<Self> {
        Arc::new(LocalGroup {
            world_size,
            state: Mutex::new(GroupState {
                generation: 0,
                arrived: 0,
                slots: vec![None; world_size],
                result: Arc::new(Vec::new()),
                failure: None,
            }),
            wake: Condvar::new(),
        })
    }

    /// Handle for one rank.
    pub fn member(self: &Arc<Self>, rank: usize) -> GroupMember {
        GroupMember {
            rank,
            group: Arc::clone(self),
        }
    }

    fn failed(failure: &(usize, String)) -> DistributedError {
        DistributedError::RankFailure {
            rank: failure.0,
            reason: failure.1.clone(),
        }
    }

    fn combine(slots: &mut [Option<Vec<f32>>], how: Combine) -> Result<Vec<f32>, DistributedError> {
        let mut contributions = slots.iter_mut().map(|s| s.take().unwrap_or_default());
        let first = contributions.next().unwrap_or_default();
        match how {
            Combine::FromRoot => Ok(first),
            Combine::Sum => {
                let mut acc = first;
                for values in contributions {
                    if values.len() != acc.len() {
                        return Err(DistributedError::LengthMismatch {
                            expected: acc.len(),
                            got: values.len(),
                        });
                    }
                    acc.iter_mut().zip(values).for_each(|(a, v)| *a += v);
                }
                Ok(acc)
            }
        }
    }

    fn exchange(
        &self,
        rank: usize,
        values: Vec<f32>,
        how: Combine,
    ) -> Result<Arc<Vec<f32>>, DistributedError> {
        let mut state = self.state.lock().map_err(|_| DistributedError::Panicked)?;
        if let Some(failure) = &state.failure {
            return Err(Self::failed(failure));
        }

        let generation = state.generation;
        state.slots[rank] = Some(values);
        state.arrived += 1;

        if state.arrived == self.world_size {
            match Self::combine(&mut state.slots, how) {
                Ok(result) => state.result = Arc::new(result),
                Err(e) => state.failure = Some((rank, e.to_string())),
            }
            state.arrived = 0;
            state.generation += 1;
            self.wake.notify_all();
        } else {
            while state.generation == generation && state.failure.is_none() {
                state = self.wake.wait(state).map_err(|_| DistributedError::Panicked)?;
            }
        }

        match &state.failure {
            Some(failure) => Err(Self::failed(failure)),
            None => Ok(Arc::clone(&state.result)),
        }
    }

    fn abort(&self, rank: usize, reason: &str) {
        if let Ok(mut state) = self.state.lock() {
            if state.failure.is_none() {
                state.failure = Some((rank, reason.to_string()));
            }
        }
        self.wake.notify_all();
    }
}

/// One rank's view of a [`LocalGroup`].
pub struct GroupMember {
    rank: usize,
    group: Arc<LocalGroup>,
}

impl Collective for GroupMember {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size
    }

    fn barrier(&self) -> Result<(), DistributedError> {
        self.group
            .exchange(self.rank, Vec::new(), Combine::Sum)
            .map(|_| ())
    }

    fn all_reduce_sum(&self, values: Vec<f32>) -> Result<Vec<f32>, DistributedError> {
        let reduced = self.group.exchange(self.rank, values, Combine::Sum)?;
        Ok(reduced.to_vec())
    }

    fn broadcast(&self, values: Vec<f32>) -> Result<Vec<f32>, DistributedError> {
        let root = self.group.exchange(self.rank, values, Combine::FromRoot)?;
        Ok(root.to_vec())
    }

    fn abort(&self, reason: &str) {
        self.group.abort(self.rank, reason);
    }
}

/// Aborts the group when the owning rank unwinds.
struct PanicGuard<'a>(&'a GroupMember);

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.abort("rank panicked");
        }
    }
}

fn is_peer_failure(err: &TrainingError) -> bool {
    matches!(
        err,
        TrainingError::Distributed(DistributedError::RankFailure { .. })
    )
}

/// Run `work` once per rank and collect the per-rank results in rank order.
///
/// A single rank runs inline on the calling thread. Otherwise the first
/// rank error that is not a peer failure is returned.
pub fn launch<T, F>(world_size: usize, work: F) -> Result<Vec<T>, TrainingError>
where
    T: Send,
    F: Fn(&dyn Collective) -> Result<T, TrainingError> + Sync,
{
    if world_size <= 1 {
        return Ok(vec![work(&SoloCollective)?]);
    }

    let group = LocalGroup::new(world_size);
    let outcomes: Vec<Result<T, TrainingError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let member = group.member(rank);
                let work = &work;
                scope.spawn(move || {
                    let _span = tracing::info_span!("rank", rank).entered();
                    let _guard = PanicGuard(&member);
                    let outcome = work(&member);
                    if let Err(e) = &outcome {
                        if !is_peer_failure(e) {
                            tracing::error!(error = %e, "rank failed");
                        }
                        member.abort(&e.to_string());
                    }
                    outcome
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or(Err(DistributedError::Panicked.into())))
            .collect()
    });

    let mut results = Vec::with_capacity(world_size);
    let mut errors = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(value) => results.push(value),
            Err(e) => errors.push(e),
        }
    }
    if errors.is_empty() {
        return Ok(results);
    }
    let root = errors.iter().position(|e| !is_peer_failure(e)).unwrap_or(0);
    Err(errors.swap_remove(root))
}

fn tensor_values<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    rank: usize,
) -> Result<Vec<f32>, DistributedError> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| DistributedError::RankFailure {
            rank,
            reason: format!("tensor readback failed: {e:?}"),
        })
}

struct GradientAverager<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    collective: &'a dyn Collective,
    device: B::Device,
    error: Option<DistributedError>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientAverager<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if self.error.is_some() {
            return;
        }
        let shape = tensor.shape();
        let local = self
            .grads
            .remove::<B::InnerBackend, D>(id)
            .unwrap_or_else(|| Tensor::zeros(shape.clone(), &self.device));
        let averaged = tensor_values(local, self.collective.rank())
            .and_then(|values| self.collective.all_reduce_sum(values))
            .map(|sum| {
                let world = self.collective.world_size() as f32;
                let mean: Vec<f32> = sum.into_iter().map(|v| v / world).collect();
                Tensor::<B::InnerBackend, D>::from_data(TensorData::new(mean, shape), &self.device)
            });
        match averaged {
            Ok(grad) => self.grads.register(id, grad),
            Err(e) => self.error = Some(e),
        }
    }
}

/// Replace every gradient with its mean over the rank group.
pub fn average_gradients<B: AutodiffBackend, M: AutodiffModule<B>>(
    model: &M,
    grads: &mut GradientsParams,
    collective: &dyn Collective,
    device: &B::Device,
) -> Result<(), DistributedError> {
    if collective.world_size() == 1 {
        return Ok(());
    }
    let mut averager = GradientAverager::<B> {
        grads,
        collective,
        device: device.clone(),
        error: None,
    };
    model.visit(&mut averager);
    averager.error.map_or(Ok(()), Err)
}

struct ParamBroadcaster<'a, B: Backend> {
    collective: &'a dyn Collective,
    device: B::Device,
    error: Option<DistributedError>,
}

impl<B: Backend> ModuleMapper<B> for ParamBroadcaster<'_, B> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        if self.error.is_some() {
            return tensor;
        }
        let shape = tensor.shape();
        let require_grad = tensor.is_require_grad();
        let shared = tensor_values(tensor.clone(), self.collective.rank())
            .and_then(|values| self.collective.broadcast(values));
        match shared {
            Ok(values) => {
                let t = Tensor::from_data(TensorData::new(values, shape), &self.device);
                if require_grad {
                    t.require_grad()
                } else {
                    t
                }
            }
            Err(e) => {
                self.error = Some(e);
                tensor
            }
        }
    }
}

/// Overwrite every rank's parameters with rank 0's.
pub fn broadcast_parameters<B: Backend, M: Module<B>>(
    model: M,
    collective: &dyn Collective,
    device: &B::Device,
) -> Result<M, DistributedError> {
    if collective.world_size() == 1 {
        return Ok(model);
    }
    let mut broadcaster = ParamBroadcaster::<B> {
        collective,
        device: device.clone(),
        error: None,
    };
    let model = model.map(&mut broadcaster);
    broadcaster.error.map_or(Ok(model), Err)
}

/// Rank 0's scalar, delivered to every rank.
pub fn broadcast_scalar(collective: &dyn Collective, value: f64) -> Result<f64, DistributedError> {
    let shared = collective.broadcast(vec![value as f32])?;
    shared
        .first()
        .map(|&v| f64::from(v))
        .ok_or(DistributedError::LengthMismatch { expected: 1, got: 0 })
}
