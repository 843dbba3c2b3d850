//! Collective communication between training workers.
//!
//! Workers only reconcile state through the [`Coordinator`] collectives:
//! a sum all-reduce, a broadcast from one rank and a barrier. Every worker
//! must call the same collectives in the same order.
//!
//! [`SingleWorker`] is the no-op coordinator for single-process runs.
//! [`LocalGroup`] runs one worker per thread inside the process.

use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bigearth_core::{Error, Result};
use burn::module::{AutodiffModule, Module, ModuleVisitor, ParamId};
use burn::optim::{GradientsParams, Optimizer};
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use tracing::{debug, error};

/// Collective operations shared by a group of workers
pub trait Coordinator: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_lead(&self) -> bool {
        self.rank() == 0
    }

    fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }

    /// Element-wise sum across all workers; every worker receives the result
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()>;

    /// Returns the bytes provided by `root` on every worker
    fn broadcast(&self, bytes: Vec<u8>, root: usize) -> Result<Vec<u8>>;

    fn barrier(&self) -> Result<()>;

    /// Marks the group as failed so that waiting workers stop
    fn abort(&self, _reason: &str) {}
}

/// Coordinator for a single worker
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleWorker;

impl Coordinator for SingleWorker {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, bytes: Vec<u8>, _root: usize) -> Result<Vec<u8>> {
        Ok(bytes)
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Payload {
    Floats(Vec<f64>),
    Bytes(Vec<u8>),
    Empty,
}

#[derive(Debug)]
struct GroupState {
    generation: u64,
    slots: Vec<Option<Payload>>,
    arrived: usize,
    result: Option<Arc<Vec<Payload>>>,
    readers: usize,
    poisoned: Option<String>,
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    timeout: Option<Duration>,
    state: Mutex<GroupState>,
    changed: Condvar,
}

/// In-process group of workers, one per thread
#[derive(Debug, Clone)]
pub struct LocalGroup {
    shared: Arc<Shared>,
}

impl LocalGroup {
    pub fn new(world_size: usize) -> Self {
        Self::with_timeout(world_size, None)
    }

    /// A group whose collectives fail after waiting `timeout` for peers
    pub fn with_timeout(world_size: usize, timeout: Option<Duration>) -> Self {
        let world_size = world_size.max(1);
        Self {
            shared: Arc::new(Shared {
                world_size,
                timeout,
                state: Mutex::new(GroupState {
                    generation: 0,
                    slots: vec![None; world_size],
                    arrived: 0,
                    result: None,
                    readers: 0,
                    poisoned: None,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn world_size(&self) -> usize {
        self.shared.world_size
    }

    /// One handle per rank
    pub fn workers(&self) -> Vec<LocalWorker> {
        (0..self.shared.world_size)
            .map(|rank| LocalWorker {
                rank,
                shared: Arc::clone(&self.shared),
            })
            .collect()
    }

    pub fn abort(&self, reason: &str) {
        self.shared.poison(reason);
    }
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, GroupState>> {
        self.state
            .lock()
            .map_err(|_| Error::Distributed("worker group lock poisoned".into()))
    }

    fn poison(&self, reason: &str) {
        if let Ok(mut state) = self.state.lock() {
            if state.poisoned.is_none() {
                state.poisoned = Some(reason.to_string());
            }
        }
        self.changed.notify_all();
    }

    /// Waits on the condition variable until `done` holds, the group is
    /// poisoned or the deadline passes.
    fn wait_until<'a, F>(
        &self,
        mut state: MutexGuard<'a, GroupState>,
        deadline: Option<Instant>,
        rank: usize,
        mut done: F,
    ) -> Result<MutexGuard<'a, GroupState>>
    where
        F: FnMut(&GroupState) -> bool,
    {
        loop {
            if let Some(reason) = &state.poisoned {
                return Err(Error::Distributed(format!("worker group aborted: {reason}")));
            }
            if done(&state) {
                return Ok(state);
            }
            state = match deadline {
                None => self
                    .changed
                    .wait(state)
                    .map_err(|_| Error::Distributed("worker group lock poisoned".into()))?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let reason = format!("rank {rank} timed out waiting for peers");
                        state.poisoned = Some(reason.clone());
                        self.changed.notify_all();
                        return Err(Error::Distributed(reason));
                    }
                    self.changed
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| Error::Distributed("worker group lock poisoned".into()))?
                        .0
                }
            };
        }
    }

    /// Contributes a payload and returns every rank's payload, in rank order
    fn all_gather(&self, rank: usize, payload: Payload) -> Result<Arc<Vec<Payload>>> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let state = self.lock()?;

        // Wait for every reader of the previous round
        let mut state = self.wait_until(state, deadline, rank, |s| s.result.is_none())?;

        state.slots[rank] = Some(payload);
        state.arrived += 1;
        let generation = state.generation;

        if state.arrived == self.world_size {
            let gathered = state
                .slots
                .iter_mut()
                .map(|slot| slot.take().unwrap_or(Payload::Empty))
                .collect();
            state.result = Some(Arc::new(gathered));
            state.readers = self.world_size;
            state.arrived = 0;
            state.generation += 1;
            self.changed.notify_all();
        }

        let mut state =
            self.wait_until(state, deadline, rank, |s| s.generation != generation)?;

        let result = state
            .result
            .clone()
            .ok_or_else(|| Error::Distributed("collective result missing".into()))?;
        state.readers -= 1;
        if state.readers == 0 {
            state.result = None;
            self.changed.notify_all();
        }
        Ok(result)
    }
}

/// Handle of one rank in a [`LocalGroup`]
#[derive(Debug, Clone)]
pub struct LocalWorker {
    rank: usize,
    shared: Arc<Shared>,
}

impl Coordinator for LocalWorker {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()> {
        let gathered = self
            .shared
            .all_gather(self.rank, Payload::Floats(values.to_vec()))?;

        values.iter_mut().for_each(|v| *v = 0.0);
        // Summed in rank order so every worker gets the same bits
        for (rank, payload) in gathered.iter().enumerate() {
            match payload {
                Payload::Floats(theirs) if theirs.len() == values.len() => {
                    for (v, t) in values.iter_mut().zip(theirs) {
                        *v += t;
                    }
                }
                Payload::Floats(theirs) => {
                    return Err(Error::Distributed(format!(
                        "all-reduce length mismatch: rank {} sent {}, rank {} sent {}",
                        rank,
                        theirs.len(),
                        self.rank,
                        values.len()
                    )));
                }
                other => {
                    return Err(Error::Distributed(format!(
                        "rank {rank} joined all-reduce with {other:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn broadcast(&self, bytes: Vec<u8>, root: usize) -> Result<Vec<u8>> {
        if root >= self.shared.world_size {
            return Err(Error::Distributed(format!("invalid broadcast root {root}")));
        }
        let payload = if self.rank == root {
            Payload::Bytes(bytes)
        } else {
            Payload::Bytes(Vec::new())
        };
        let gathered = self.shared.all_gather(self.rank, payload)?;
        match &gathered[root] {
            Payload::Bytes(bytes) => Ok(bytes.clone()),
            other => Err(Error::Distributed(format!(
                "rank {root} joined broadcast with {other:?}"
            ))),
        }
    }

    fn barrier(&self) -> Result<()> {
        self.shared.all_gather(self.rank, Payload::Empty)?;
        Ok(())
    }

    fn abort(&self, reason: &str) {
        error!("Rank {} aborting worker group: {}", self.rank, reason);
        self.shared.poison(&format!("rank {}: {}", self.rank, reason));
    }
}

/// Collects gradient values in parameter visit order
struct GradientCollector<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    values: Vec<f64>,
    error: Option<Error>,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientCollector<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if self.error.is_some() {
            return;
        }
        let numel = tensor.shape().num_elements();
        match self.grads.get::<B::InnerBackend, D>(id) {
            Some(grad) => match grad.into_data().convert::<f64>().to_vec::<f64>() {
                Ok(values) => self.values.extend(values),
                Err(e) => {
                    self.error = Some(Error::Training(format!("gradient readback failed: {e:?}")))
                }
            },
            // Parameters without a gradient contribute zeros so all ranks stay aligned
            None => self.values.extend(std::iter::repeat(0.0).take(numel)),
        }
    }
}

/// Writes reduced gradient values back, in the same visit order
struct GradientWriter<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    values: &'a [f64],
    offset: usize,
    scale: f64,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientWriter<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let shape = tensor.shape();
        let numel = shape.num_elements();
        let end = (self.offset + numel).min(self.values.len());
        let reduced: Vec<f32> = self.values[self.offset..end]
            .iter()
            .map(|v| (v * self.scale) as f32)
            .collect();
        self.offset = end;

        let grad = Tensor::<B::InnerBackend, D>::from_data(
            TensorData::new(reduced, shape.dims),
            &tensor.device(),
        );
        self.grads.remove::<B::InnerBackend, D>(id);
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}

/// Replaces local gradients with their sum over all workers times `scale`.
///
/// With `scale = 1 / (world_size * accumulated_batches)` this is the mean
/// gradient of the global batch.
pub fn all_reduce_gradients<B, M>(
    model: &M,
    grads: &mut GradientsParams,
    coordinator: &dyn Coordinator,
    scale: f64,
) -> Result<()>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut collector = GradientCollector::<B> {
        grads,
        values: Vec::new(),
        error: None,
        _backend: PhantomData,
    };
    model.visit(&mut collector);
    if let Some(e) = collector.error {
        return Err(e);
    }
    let mut values = collector.values;

    coordinator.all_reduce_sum(&mut values)?;

    let mut writer = GradientWriter::<B> {
        grads,
        values: &values,
        offset: 0,
        scale,
        _backend: PhantomData,
    };
    model.visit(&mut writer);
    debug!("All-reduced {} gradient values", values.len());
    Ok(())
}

fn bytes_recorder() -> BinBytesRecorder<FullPrecisionSettings> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
}

/// Replaces every worker's parameters with the lead worker's
pub fn broadcast_module<B, M>(model: M, coordinator: &dyn Coordinator, device: &B::Device) -> Result<M>
where
    B: Backend,
    M: Module<B>,
{
    if !coordinator.is_distributed() {
        return Ok(model);
    }

    let recorder = bytes_recorder();
    let bytes = if coordinator.is_lead() {
        Recorder::<B>::record(&recorder, model.clone().into_record(), ())
            .map_err(|e| Error::Distributed(format!("Failed to serialize model: {e}")))?
    } else {
        Vec::new()
    };

    let bytes = coordinator.broadcast(bytes, 0)?;
    if coordinator.is_lead() {
        return Ok(model);
    }

    let record: M::Record = Recorder::<B>::load(&recorder, bytes, device)
        .map_err(|e| Error::Distributed(format!("Failed to deserialize model: {e}")))?;
    Ok(model.load_record(record))
}

/// Replaces every worker's optimizer state with the lead worker's
pub fn broadcast_optimizer<B, M, O>(
    optimizer: O,
    coordinator: &dyn Coordinator,
    device: &B::Device,
) -> Result<O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    if !coordinator.is_distributed() {
        return Ok(optimizer);
    }

    let recorder = bytes_recorder();
    let bytes = if coordinator.is_lead() {
        Recorder::<B>::record(&recorder, optimizer.to_record(), ())
            .map_err(|e| Error::Distributed(format!("Failed to serialize optimizer: {e}")))?
    } else {
        Vec::new()
    };

    let bytes = coordinator.broadcast(bytes, 0)?;
    if coordinator.is_lead() {
        return Ok(optimizer);
    }

    let record: O::Record = Recorder::<B>::load(&recorder, bytes, device)
        .map_err(|e| Error::Distributed(format!("Failed to deserialize optimizer: {e}")))?;
    Ok(optimizer.load_record(record))
}
