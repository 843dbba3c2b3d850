//! Distributed training loop for BigEarthNet classifiers.
//!
//! Each worker owns a full model copy and its own data shard. Per update:
//! - forward and BCE-with-logits loss (with label smoothing)
//! - backward, accumulated over `backward_passes` local batches
//! - gradient all-reduce, averaged over workers and accumulated batches
//! - Adam step at the step-decayed, linearly scaled learning rate
//!
//! The lead worker's parameters are broadcast before the first update, and
//! parameters plus optimizer state again right after it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bigearth_core::{
    EpochRecord, Error, MetricsSnapshot, MultiLabelMetrics, Result, TrainingHistory,
    TrainingParams,
};
use bigearth_dataset::{BandBatcher, BatchedDataset, BigEarthBatch};
use burn::data::dataloader::batcher::Batcher;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsAccumulator, GradientsParams, Optimizer};
use burn::tensor::{activation, backend::AutodiffBackend, ElementConversion};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::attribution::AttributionHook;
use crate::checkpoint::{CheckpointManager, CheckpointMetadata};
use crate::distributed::{
    all_reduce_gradients, broadcast_module, broadcast_optimizer, Coordinator,
};
use crate::evaluator::{tensor_to_vec, EvaluationReport, Evaluator};
use crate::loss::SmoothedBceWithLogits;
use crate::lr_schedule::{linear_scaled_lr, LearningRateScheduler};
use crate::model::BigEarthClassifier;
use crate::summary::SummaryWriter;

/// Iterations between training log lines
const LOG_EVERY: usize = 20;

pub type ClassifierOptimizer<B> = OptimizerAdaptor<Adam, BigEarthClassifier<B>, B>;

/// Progress of a training run
#[derive(Debug, Clone)]
pub struct TrainingState {
    pub epoch: usize,
    /// Synchronized optimizer updates applied so far
    pub global_step: usize,
    /// Best validation micro F-score, 0.0 before the first evaluation
    pub best_fscore: f64,
    pub current_lr: f64,
    pub history: TrainingHistory,
}

impl TrainingState {
    pub fn new(initial_lr: f64) -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            best_fscore: 0.0,
            current_lr: initial_lr,
            history: TrainingHistory::new(),
        }
    }

    /// Records a validation micro F-score; true when it strictly improves
    /// on every earlier one.
    pub fn record_evaluation(&mut self, micro_fscore: f64) -> bool {
        if micro_fscore > self.best_fscore {
            self.best_fscore = micro_fscore;
            true
        } else {
            false
        }
    }
}

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub history: TrainingHistory,
    pub best_fscore: f64,
    /// Latest snapshot restored before the test evaluation
    pub checkpoint: Option<PathBuf>,
    pub test: EvaluationReport,
}

/// Per-epoch training loss and metrics, combined over all workers
#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub loss: f64,
    pub metrics: MetricsSnapshot,
    pub learning_rate: f64,
}

pub struct Trainer<B: AutodiffBackend> {
    model: BigEarthClassifier<B>,
    optimizer: ClassifierOptimizer<B>,
    params: TrainingParams,
    scheduler: LearningRateScheduler,
    coordinator: Arc<dyn Coordinator>,
    checkpoints: CheckpointManager,
    summary: Option<SummaryWriter>,
    loss_fn: SmoothedBceWithLogits,
    accumulator: GradientsAccumulator<BigEarthClassifier<B>>,
    pending_passes: usize,
    initial_sync_done: bool,
    state: TrainingState,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(
        model: BigEarthClassifier<B>,
        params: TrainingParams,
        coordinator: Arc<dyn Coordinator>,
        checkpoints: CheckpointManager,
        device: B::Device,
    ) -> Self {
        let initial_lr = linear_scaled_lr(params.learning_rate, coordinator.world_size());
        let scheduler =
            LearningRateScheduler::step_decay(initial_lr, params.decay_step, params.decay_rate);

        let loss_fn = SmoothedBceWithLogits::new(params.label_smoothing);

        if coordinator.is_lead() {
            info!(
                "Learning rate: {} x {} workers = {}, decay x{} every {} epochs",
                params.learning_rate,
                coordinator.world_size(),
                initial_lr,
                params.decay_rate,
                params.decay_step
            );
        }

        Self {
            model,
            optimizer: AdamConfig::new().init(),
            params,
            scheduler,
            coordinator,
            checkpoints,
            summary: None,
            loss_fn,
            accumulator: GradientsAccumulator::new(),
            pending_passes: 0,
            initial_sync_done: false,
            state: TrainingState::new(initial_lr),
            device,
        }
    }

    /// Writes per-epoch scalars through `writer` (only the lead should pass one)
    pub fn with_summary(mut self, writer: SummaryWriter) -> Self {
        self.summary = Some(writer);
        self
    }

    pub fn model(&self) -> &BigEarthClassifier<B> {
        &self.model
    }

    pub fn into_model(self) -> BigEarthClassifier<B> {
        self.model
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    fn evaluator(&self) -> Evaluator<B::InnerBackend> {
        Evaluator::new(
            Arc::clone(&self.coordinator),
            self.device.clone(),
            self.model.num_classes(),
            self.params.threshold,
        )
    }

    /// Makes every worker start from the lead worker's parameters
    fn ensure_initial_sync(&mut self) -> Result<()> {
        if !self.initial_sync_done {
            self.model = broadcast_module(self.model.clone(), self.coordinator.as_ref(), &self.device)?;
            self.initial_sync_done = true;
            if self.coordinator.is_distributed() {
                debug!("Rank {}: initial parameters synchronized", self.coordinator.rank());
            }
        }
        Ok(())
    }

    /// One local batch: forward, backward and gradient accumulation.
    ///
    /// Applies a synchronized update once `backward_passes` batches are
    /// accumulated. Returns the batch loss and predicted probabilities.
    pub fn train_step(&mut self, batch: &BigEarthBatch<B>) -> Result<(f64, Vec<f32>)> {
        self.ensure_initial_sync()?;

        let logits = self.model.forward_logits(&batch.bands)?;
        let loss = self.loss_fn.forward(logits.clone(), batch.targets.clone());
        let loss_value: f64 = loss.clone().into_scalar().elem();
        if !loss_value.is_finite() {
            return Err(Error::Training(format!(
                "non-finite loss {loss_value} at step {}",
                self.state.global_step
            )));
        }
        let probabilities = tensor_to_vec(activation::sigmoid(logits))?;

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.accumulator.accumulate(&self.model, grads);
        self.pending_passes += 1;

        if self.pending_passes >= self.params.backward_passes.max(1) {
            self.apply_update()?;
        }
        Ok((loss_value, probabilities))
    }

    /// Averages the accumulated gradients over all workers and steps the optimizer
    fn apply_update(&mut self) -> Result<()> {
        if self.pending_passes == 0 {
            return Ok(());
        }
        let mut grads = self.accumulator.grads();
        let scale = 1.0 / (self.coordinator.world_size() * self.pending_passes) as f64;
        all_reduce_gradients(&self.model, &mut grads, self.coordinator.as_ref(), scale)?;

        self.model = self
            .optimizer
            .step(self.state.current_lr, self.model.clone(), grads);
        self.pending_passes = 0;
        self.state.global_step += 1;

        if self.state.global_step == 1 && self.coordinator.is_distributed() {
            self.model = broadcast_module(self.model.clone(), self.coordinator.as_ref(), &self.device)?;
            let optimizer = std::mem::replace(&mut self.optimizer, AdamConfig::new().init());
            self.optimizer = broadcast_optimizer::<B, BigEarthClassifier<B>, _>(
                optimizer,
                self.coordinator.as_ref(),
                &self.device,
            )?;
            debug!(
                "Rank {}: parameters and optimizer state synchronized after first step",
                self.coordinator.rank()
            );
        }
        Ok(())
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.coordinator.is_lead() {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches ({eta})")
                .map(|style| style.progress_chars("=>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar
    }

    /// Trains over one epoch of the local shard
    pub fn train_epoch(&mut self, dataset: &BatchedDataset, epoch: usize) -> Result<EpochSummary> {
        self.state.epoch = epoch;
        self.state.current_lr = self.scheduler.on_epoch_start(epoch);
        info!(
            "Process {}: starting epoch {} (lr {:.6})",
            self.coordinator.rank(),
            epoch,
            self.state.current_lr
        );

        let batcher = BandBatcher::new();
        let mut metrics = MultiLabelMetrics::new(self.model.num_classes(), self.params.threshold);
        let mut loss_sum = 0.0;
        let mut num_batches = 0usize;
        let progress = self.progress_bar(dataset.num_batches());

        for (i, items) in dataset.iter_batches(epoch).enumerate() {
            if items.is_empty() {
                continue;
            }
            let batch: BigEarthBatch<B> = batcher.batch(items, &self.device);
            let (loss, probabilities) = self.train_step(&batch)?;
            metrics.update(&batch.labels, &probabilities)?;
            loss_sum += loss;
            num_batches += 1;

            if i % LOG_EVERY == 0 && self.coordinator.is_lead() {
                info!(
                    "Process {}: Epoch {:03}: Iteration {:03} Loss: {:.3}",
                    self.coordinator.rank(),
                    epoch,
                    i,
                    loss
                );
            }
            progress.inc(1);
        }
        // Partial accumulation at the end of the epoch
        self.apply_update()?;
        progress.finish_and_clear();

        let mut flat = metrics.to_flat();
        flat.push(loss_sum);
        flat.push(num_batches as f64);
        self.coordinator.all_reduce_sum(&mut flat)?;
        let total_batches = flat.pop().unwrap_or(0.0);
        let loss_sum = flat.pop().unwrap_or(0.0);
        metrics.load_flat(&flat)?;

        let loss = if total_batches > 0.0 {
            loss_sum / total_batches
        } else {
            0.0
        };
        info!(
            "Process {}: Epoch {:03}: Loss: {:.3}",
            self.coordinator.rank(),
            epoch,
            loss
        );

        Ok(EpochSummary {
            loss,
            metrics: metrics.result(),
            learning_rate: self.state.current_lr,
        })
    }

    /// Evaluates the current parameters without recording gradients
    pub fn evaluate(
        &self,
        dataset: &BatchedDataset,
        hook: Option<&mut dyn AttributionHook<B::InnerBackend>>,
    ) -> Result<EvaluationReport> {
        let model = self.model.valid();
        self.evaluator().evaluate(&model, dataset, hook)
    }

    fn save_checkpoint(&self, epoch: usize, micro_fscore: f64) -> Result<PathBuf> {
        let metadata = CheckpointMetadata::new(
            epoch,
            micro_fscore,
            self.state.current_lr,
            self.model.architecture().name(),
            self.model.num_classes(),
        );
        self.checkpoints
            .save::<B, _, _>(&self.model, &self.optimizer, &metadata)
    }

    /// Trains for `nb_epoch` epochs, then restores the latest checkpoint and
    /// evaluates the test split.
    pub fn fit(
        &mut self,
        train: &BatchedDataset,
        validation: &BatchedDataset,
        test: &BatchedDataset,
    ) -> Result<TrainingOutcome> {
        let is_lead = self.coordinator.is_lead();
        let nb_epoch = self.params.nb_epoch;
        let eval_every = self.params.eval_every.max(1);
        let mut train_start = Instant::now();

        for epoch in 0..nb_epoch {
            let summary = self.train_epoch(train, epoch)?;
            let mut record = EpochRecord {
                epoch,
                train_loss: summary.loss,
                learning_rate: summary.learning_rate,
                train: None,
                validation_loss: None,
                validation: None,
            };

            if epoch % eval_every == 0 || epoch + 1 == nb_epoch {
                let eval_start = Instant::now();
                let report = self.evaluate(validation, None)?;
                record.train = Some(summary.metrics);
                record.validation_loss = Some(report.loss);
                record.validation = Some(report.metrics);

                let micro_f = report.metrics.micro_fscore;
                if self.state.record_evaluation(micro_f) && is_lead {
                    info!(
                        "Process {}: New best F-score {:.3} at epoch {:03}, writing checkpoint",
                        self.coordinator.rank(),
                        micro_f,
                        epoch
                    );
                    self.save_checkpoint(epoch, micro_f)?;
                    info!("Epoch {:03}: {}", epoch, report.metrics);
                }

                if let Some(writer) = &self.summary {
                    writer.write_epoch(&record)?;
                }

                if is_lead {
                    let eval_time = eval_start.elapsed();
                    // Validation time is excluded from the training clock
                    train_start += eval_time;
                    info!("Train took: {:.2?}", train_start.elapsed());
                    info!("Validation took: {:.2?}", eval_time);
                }
            }

            self.state.history.push(record);
        }

        self.finish(test)
    }

    /// Synchronizes all workers, restores the latest snapshot and evaluates
    /// the test split.
    fn finish(&mut self, test: &BatchedDataset) -> Result<TrainingOutcome> {
        self.coordinator.barrier()?;

        let checkpoint = self.checkpoints.latest()?;
        match &checkpoint {
            Some(snapshot) => {
                self.model =
                    self.checkpoints
                        .restore_model::<B, _>(snapshot, self.model.clone(), &self.device)?;
            }
            None => warn!(
                "No checkpoint in {}, evaluating the in-memory model",
                self.checkpoints.checkpoint_dir().display()
            ),
        }

        let test_report = self.evaluate(test, None)?;
        if self.coordinator.is_lead() {
            info!("Test scores: {}", test_report);
        }

        Ok(TrainingOutcome {
            history: self.state.history.clone(),
            best_fscore: self.state.best_fscore,
            checkpoint,
            test: test_report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{LocalGroup, SingleWorker};
    use crate::model::ModelFactory;
    use crate::test_utils::{in_memory_split, param_bits, synthetic_samples};
    use bigearth_core::{LabelScheme, ModelConfig};
    use burn::backend::{Autodiff, NdArray};
    use std::thread;

    type TestBackend = Autodiff<NdArray>;

    fn tiny_params() -> TrainingParams {
        TrainingParams {
            batch_size: 2,
            nb_epoch: 2,
            learning_rate: 0.01,
            eval_every: 1,
            ..TrainingParams::default()
        }
    }

    fn tiny_model(scheme: &LabelScheme) -> BigEarthClassifier<TestBackend> {
        let config = ModelConfig {
            dense_hidden: vec![4, 4],
            ..ModelConfig::default()
        };
        ModelFactory::new(config)
            .build::<TestBackend>("Dense", scheme.num_classes, &Default::default())
            .unwrap()
    }

    fn model_bytes(model: &BigEarthClassifier<TestBackend>) -> Vec<u32> {
        param_bits::<TestBackend, _>(model)
    }

    #[test]
    fn test_record_evaluation_is_strict() {
        let mut state = TrainingState::new(0.001);
        assert!(!state.record_evaluation(0.0));
        assert!(state.record_evaluation(0.4));
        assert!(!state.record_evaluation(0.4));
        assert!(!state.record_evaluation(0.3));
        assert!(state.record_evaluation(0.41));
        assert_eq!(state.best_fscore, 0.41);
    }

    #[test]
    fn test_label_smoothing_targets_half() {
        use burn::tensor::{Int, Tensor, TensorData};

        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let dir = tempfile::tempdir().unwrap();
        let params = TrainingParams {
            label_smoothing: 0.2,
            ..tiny_params()
        };
        let trainer = Trainer::new(
            tiny_model(&scheme),
            params,
            Arc::new(SingleWorker),
            CheckpointManager::new(dir.path()),
            Default::default(),
        );

        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::full([1, 19], 2.0, &device);
        let targets =
            Tensor::<TestBackend, 2, Int>::from_data(TensorData::new(vec![1i64; 19], [1, 19]), &device);
        let loss: f64 = trainer.loss_fn.forward(logits, targets).into_scalar().elem();

        // target 1 * 0.8 + 0.2 / 2 = 0.9, independent of the 19 classes
        let p = 1.0 / (1.0 + (-2.0f64).exp());
        let expected = -(0.9 * p.ln() + 0.1 * (1.0 - p).ln());
        assert!((loss - expected).abs() < 1e-5, "loss {loss}, expected {expected}");
    }

    #[test]
    fn test_train_step_changes_parameters() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let model = tiny_model(&scheme);
        let before = model_bytes(&model);
        let dir = tempfile::tempdir().unwrap();

        let mut trainer = Trainer::new(
            model,
            tiny_params(),
            Arc::new(SingleWorker),
            CheckpointManager::new(dir.path()),
            Default::default(),
        );
        let split = in_memory_split(synthetic_samples("train", 4, &scheme), 2, &scheme, 1, 0, true);
        let summary = trainer.train_epoch(&split, 0).unwrap();

        assert!(summary.loss.is_finite());
        assert_eq!(summary.metrics.num_samples, 4);
        assert_eq!(trainer.state().global_step, 2);
        assert_ne!(model_bytes(trainer.model()), before);
    }

    #[test]
    fn test_gradient_accumulation_flushes_partial_group() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let dir = tempfile::tempdir().unwrap();
        let params = TrainingParams {
            backward_passes: 2,
            ..tiny_params()
        };
        let mut trainer = Trainer::new(
            tiny_model(&scheme),
            params,
            Arc::new(SingleWorker),
            CheckpointManager::new(dir.path()),
            Default::default(),
        );
        // 3 batches: one full accumulation group and one flushed at epoch end
        let split = in_memory_split(synthetic_samples("train", 6, &scheme), 2, &scheme, 1, 0, true);
        trainer.train_epoch(&split, 0).unwrap();
        assert_eq!(trainer.state().global_step, 2);
    }

    #[test]
    fn test_learning_rate_follows_schedule() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let dir = tempfile::tempdir().unwrap();
        let params = TrainingParams {
            decay_step: 1,
            decay_rate: 0.5,
            ..tiny_params()
        };
        let mut trainer = Trainer::new(
            tiny_model(&scheme),
            params,
            Arc::new(SingleWorker),
            CheckpointManager::new(dir.path()),
            Default::default(),
        );
        let split = in_memory_split(synthetic_samples("train", 2, &scheme), 2, &scheme, 1, 0, true);
        assert_eq!(trainer.train_epoch(&split, 0).unwrap().learning_rate, 0.01);
        assert_eq!(trainer.train_epoch(&split, 1).unwrap().learning_rate, 0.005);
    }

    #[test]
    fn test_fit_writes_checkpoint_and_reports_test_scores() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(
            tiny_model(&scheme),
            tiny_params(),
            Arc::new(SingleWorker),
            CheckpointManager::new(dir.path().join("checkpoints")),
            Default::default(),
        );
        let train = in_memory_split(synthetic_samples("train", 4, &scheme), 2, &scheme, 1, 0, true);
        let val = in_memory_split(synthetic_samples("val", 3, &scheme), 2, &scheme, 1, 0, false);
        let test = in_memory_split(synthetic_samples("test", 3, &scheme), 2, &scheme, 1, 0, false);

        let outcome = trainer.fit(&train, &val, &test).unwrap();

        assert_eq!(outcome.history.epochs.len(), 2);
        assert!(outcome.history.epochs.iter().all(|r| r.validation.is_some()));
        assert_eq!(outcome.test.num_samples, 3);

        // One snapshot per strict improvement over 0.0
        let snapshots = trainer.checkpoints().list_checkpoints().unwrap();
        let improvements = {
            let mut best = 0.0;
            outcome
                .history
                .epochs
                .iter()
                .filter_map(|r| r.validation.map(|m| m.micro_fscore))
                .filter(|&f| {
                    let better = f > best;
                    if better {
                        best = f;
                    }
                    better
                })
                .count()
        };
        assert_eq!(snapshots.len(), improvements);
        assert_eq!(outcome.checkpoint.is_some(), improvements > 0);
    }

    #[test]
    fn test_workers_hold_identical_parameters_after_first_step() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let samples = synthetic_samples("train", 16, &scheme);
        let group = LocalGroup::new(4);

        let handles: Vec<_> = group
            .workers()
            .into_iter()
            .map(|worker| {
                let samples = samples.clone();
                let scheme = scheme.clone();
                thread::spawn(move || {
                    let rank = worker.rank();
                    let dir = tempfile::tempdir().unwrap();
                    let model = tiny_model(&scheme);
                    let initial = model_bytes(&model);

                    let mut trainer = Trainer::new(
                        model,
                        tiny_params(),
                        Arc::new(worker),
                        CheckpointManager::new(dir.path()),
                        Default::default(),
                    );
                    let split = in_memory_split(samples, 2, &scheme, 4, rank, true);
                    let batch: BigEarthBatch<TestBackend> = BandBatcher::new().batch(
                        split.iter_batches(0).next().unwrap(),
                        &Default::default(),
                    );
                    trainer.train_step(&batch).unwrap();
                    (initial, model_bytes(trainer.model()))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // Independent initialisations differ
        assert_ne!(results[0].0, results[1].0);
        for (_, after) in &results[1..] {
            assert_eq!(after, &results[0].1);
        }
    }
}
