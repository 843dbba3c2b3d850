//! Run orchestration: seeding, per-worker setup and the in-process worker group.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bigearth_core::{Error, LabelScheme, Result, RunConfig};
use bigearth_dataset::{create_batched_dataset, BatchedDataset, DatasetOptions};
use burn::tensor::backend::{AutodiffBackend, Backend};
use tracing::{error, info};

use crate::attribution::{AttributionHook, FeatureDump};
use crate::checkpoint::CheckpointManager;
use crate::distributed::{Coordinator, LocalGroup, SingleWorker};
use crate::evaluator::{EvaluationReport, Evaluator};
use crate::model::ModelFactory;
use crate::summary::SummaryWriter;
use crate::trainer::{Trainer, TrainingOutcome};

/// Seed carried through a run.
///
/// Seeds the backend once and derives independent seeds per purpose, so a
/// run is reproducible for a fixed worker count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunContext {
    seed: u64,
}

impl RunContext {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn seed_backend<B: Backend>(&self) {
        B::seed(self.seed);
    }

    /// Seed for one purpose, e.g. "dataset"
    pub fn derive_seed(&self, purpose: &str) -> u64 {
        // FNV-1a over the purpose, mixed with the run seed
        let hash = purpose
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
                (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
            });
        self.seed.rotate_left(17) ^ hash
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Train,
    Eval,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Train => write!(f, "train"),
            RunMode::Eval => write!(f, "eval"),
        }
    }
}

impl FromStr for RunMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "train" => Ok(RunMode::Train),
            "eval" | "evaluate" => Ok(RunMode::Eval),
            other => Err(Error::InvalidArgument(format!(
                "Unknown mode '{other}', expected 'train' or 'eval'"
            ))),
        }
    }
}

/// What a worker produced
#[derive(Debug, Clone)]
pub enum RunReport {
    Trained(TrainingOutcome),
    Evaluated(EvaluationReport),
}

impl RunReport {
    pub fn test_report(&self) -> &EvaluationReport {
        match self {
            RunReport::Trained(outcome) => &outcome.test,
            RunReport::Evaluated(report) => report,
        }
    }
}

fn load_split(
    config: &RunConfig,
    files: &[PathBuf],
    scheme: &LabelScheme,
    coordinator: &dyn Coordinator,
    training: bool,
    seed: u64,
) -> Result<BatchedDataset> {
    let base = if training {
        DatasetOptions::training(files.to_vec(), config.training.batch_size, scheme.clone())
    } else {
        DatasetOptions::evaluation(files.to_vec(), config.training.batch_size, scheme.clone())
    };
    create_batched_dataset(DatasetOptions {
        shuffle_buffer_size: config.data.shuffle_buffer_size,
        num_workers: coordinator.world_size(),
        worker_index: coordinator.rank(),
        augment: training && config.data.augment,
        normalize: config.data.normalize,
        seed,
        ..base
    })
}

/// Runs one worker's share of a training or evaluation run
pub fn run_worker<B: AutodiffBackend>(
    config: &RunConfig,
    mode: RunMode,
    coordinator: Arc<dyn Coordinator>,
    device: B::Device,
) -> Result<RunReport> {
    let context = RunContext::new(config.seed);
    context.seed_backend::<B>();
    let data_seed = context.derive_seed("dataset");

    let scheme = config.label_scheme();
    let factory = ModelFactory::new(config.model.clone());

    match mode {
        RunMode::Train => {
            let split = |files: &[PathBuf], training: bool| {
                load_split(config, files, &scheme, coordinator.as_ref(), training, data_seed)
            };
            let train = split(&config.data.train_files, true)?;
            let validation = split(&config.data.val_files, false)?;
            let test = split(&config.data.test_files, false)?;

            let model = factory.build::<B>(&config.model.name, scheme.num_classes, &device)?;
            let checkpoints = CheckpointManager::new(config.checkpoint_dir());
            let mut trainer = Trainer::new(
                model,
                config.training.clone(),
                Arc::clone(&coordinator),
                checkpoints,
                device,
            );
            if coordinator.is_lead() {
                let writer = SummaryWriter::create(&config.output.log_dir)?;
                info!("Writing summaries to {}", writer.dir().display());
                trainer = trainer.with_summary(writer);
            }

            Ok(RunReport::Trained(trainer.fit(&train, &validation, &test)?))
        }
        RunMode::Eval => {
            let dir = config
                .output
                .eval_checkpoint
                .clone()
                .unwrap_or_else(|| config.checkpoint_dir());
            let checkpoints = CheckpointManager::new(&dir);
            let snapshot = checkpoints.latest()?.ok_or_else(|| {
                Error::NotFound(format!("No checkpoint found in {}", dir.display()))
            })?;

            let model =
                factory.build::<B::InnerBackend>(&config.model.name, scheme.num_classes, &device)?;
            let model =
                checkpoints.restore_model::<B::InnerBackend, _>(&snapshot, model, &device)?;
            let test = load_split(
                config,
                &config.data.test_files,
                &scheme,
                coordinator.as_ref(),
                false,
                data_seed,
            )?;

            let mut dump = match &config.output.attribution_dir {
                Some(dir) => Some(FeatureDump::create(
                    dir,
                    &format!("attribution_rank{}.jsonl", coordinator.rank()),
                )?),
                None => None,
            };
            let hook = dump
                .as_mut()
                .map(|d| d as &mut dyn AttributionHook<B::InnerBackend>);

            let evaluator = Evaluator::<B::InnerBackend>::new(
                Arc::clone(&coordinator),
                device,
                scheme.num_classes,
                config.training.threshold,
            );
            let report = evaluator.evaluate(&model, &test, hook)?;
            if coordinator.is_lead() {
                info!("Test scores: {}", report);
            }
            Ok(RunReport::Evaluated(report))
        }
    }
}

/// Runs `config.world_size()` workers and returns the lead worker's report.
///
/// With more than one worker each runs on its own thread in a
/// [`LocalGroup`]. A failing worker aborts the group; the first root-cause
/// error is returned.
pub fn run<B: AutodiffBackend>(
    config: &RunConfig,
    mode: RunMode,
    device: B::Device,
) -> Result<RunReport> {
    config.validate()?;
    let world_size = config.world_size();

    if world_size == 1 {
        return run_worker::<B>(config, mode, Arc::new(SingleWorker), device);
    }

    let timeout = config.distributed.timeout_secs.map(Duration::from_secs);
    let group = LocalGroup::with_timeout(world_size, timeout);
    info!("Starting {} workers ({} mode)", world_size, mode);

    let mut handles = Vec::with_capacity(world_size);
    for worker in group.workers() {
        let config = config.clone();
        let device = device.clone();
        let rank = worker.rank();
        let handle = thread::Builder::new()
            .name(format!("worker-{rank}"))
            .spawn(move || {
                let coordinator: Arc<dyn Coordinator> = Arc::new(worker);
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_worker::<B>(&config, mode, Arc::clone(&coordinator), device)
                }))
                .unwrap_or_else(|_| Err(Error::Training(format!("worker {rank} panicked"))));

                if let Err(e) = &result {
                    error!("Worker {} failed: {}", rank, e);
                    coordinator.abort(&e.to_string());
                }
                result
            })?;
        handles.push(handle);
    }

    let mut results = Vec::with_capacity(world_size);
    for (rank, handle) in handles.into_iter().enumerate() {
        let result = handle
            .join()
            .unwrap_or_else(|_| Err(Error::Training(format!("worker {rank} panicked"))));
        results.push(result);
    }

    let mut lead = None;
    let mut first_error = None;
    for result in results {
        match result {
            Ok(report) => {
                lead.get_or_insert(report);
            }
            // Aborted peers report the distributed failure, not its cause
            Err(e @ Error::Distributed(_)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                if matches!(first_error, None | Some(Error::Distributed(_))) {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => lead.ok_or_else(|| Error::Training("no worker produced a report".into())),
    }
}
