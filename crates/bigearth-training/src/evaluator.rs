//! Forward-only evaluation over a batched split.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bigearth_core::{Error, MetricsSnapshot, MultiLabelMetrics, Result};
use bigearth_dataset::{BandBatcher, BatchedDataset, BigEarthBatch};
use burn::data::dataloader::batcher::Batcher;
use burn::tensor::{activation, backend::Backend, ElementConversion, Tensor};
use tracing::{debug, info, warn};

use crate::attribution::AttributionHook;
use crate::distributed::Coordinator;
use crate::loss::SmoothedBceWithLogits;
use crate::model::BigEarthClassifier;

/// Result of one evaluation pass, combined over all workers
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    /// Mean BCE loss per patch
    pub loss: f64,
    pub metrics: MetricsSnapshot,
    pub num_samples: u64,
    pub elapsed: Duration,
    /// Patches per second over the whole group
    pub throughput: f64,
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loss: {:.4}, {} patches in {:.2?}\n{}",
            self.loss, self.num_samples, self.elapsed, self.metrics
        )
    }
}

/// Runs a model over a dataset without recording gradients.
///
/// Counts and loss sums are all-reduced, so every worker returns the same
/// report for the full split.
pub struct Evaluator<B: Backend> {
    coordinator: Arc<dyn Coordinator>,
    device: B::Device,
    num_classes: usize,
    threshold: f64,
}

impl<B: Backend> Evaluator<B> {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        device: B::Device,
        num_classes: usize,
        threshold: f64,
    ) -> Self {
        Self {
            coordinator,
            device,
            num_classes,
            threshold,
        }
    }

    pub fn evaluate(
        &self,
        model: &BigEarthClassifier<B>,
        dataset: &BatchedDataset,
        mut hook: Option<&mut dyn AttributionHook<B>>,
    ) -> Result<EvaluationReport> {
        let start = Instant::now();
        let batcher = BandBatcher::new();
        let loss_fn = SmoothedBceWithLogits::new(0.0);
        let mut metrics = MultiLabelMetrics::new(self.num_classes, self.threshold);
        let mut loss_sum = 0.0;

        for items in dataset.iter_batches(0) {
            if items.is_empty() {
                continue;
            }
            let batch: BigEarthBatch<B> = batcher.batch(items, &self.device);
            let logits = model.forward_logits(&batch.bands)?;

            let loss = loss_fn.forward(logits.clone(), batch.targets.clone());
            let loss_value: f64 = loss.into_scalar().elem();
            loss_sum += loss_value * batch.len() as f64;

            let probabilities = tensor_to_vec(activation::sigmoid(logits))?;
            metrics.update(&batch.labels, &probabilities)?;

            if let Some(hook) = hook.as_deref_mut() {
                self.run_hook(hook, model, &batch);
            }
        }

        if let Some(hook) = hook {
            if let Err(e) = hook.finish() {
                warn!("Attribution hook failed to finish: {}", e);
            }
        }

        // Layout: metric counts, then the loss sum
        let mut flat = metrics.to_flat();
        flat.push(loss_sum);
        self.coordinator.all_reduce_sum(&mut flat)?;
        let loss_sum = flat.pop().unwrap_or(0.0);
        metrics.load_flat(&flat)?;

        let num_samples = metrics.num_samples();
        let elapsed = start.elapsed();
        let throughput = if elapsed.as_secs_f64() > 0.0 {
            num_samples as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        if self.coordinator.is_lead() {
            info!(
                "Evaluated {} patches in {:.2?} ({:.1} images/sec)",
                num_samples, elapsed, throughput
            );
        }

        Ok(EvaluationReport {
            loss: if num_samples > 0 {
                loss_sum / num_samples as f64
            } else {
                0.0
            },
            metrics: metrics.result(),
            num_samples,
            elapsed,
            throughput,
        })
    }

    /// Calls the hook for every patch of the batch; failures are logged only
    fn run_hook(
        &self,
        hook: &mut dyn AttributionHook<B>,
        model: &BigEarthClassifier<B>,
        batch: &BigEarthBatch<B>,
    ) {
        let num_classes = batch.num_classes();
        for (i, patch_name) in batch.patch_names.iter().enumerate() {
            let bands = batch.bands.select(i);
            let labels = &batch.labels[i * num_classes..(i + 1) * num_classes];

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                hook.attribute(model, &bands, labels, patch_name)
            }));
            match outcome {
                Ok(Ok(())) => debug!("Attributed {}", patch_name),
                Ok(Err(e)) => warn!("Attribution failed for {}: {}", patch_name, e),
                Err(payload) => warn!(
                    "Attribution panicked for {}: {}",
                    patch_name,
                    panic_message(payload.as_ref())
                ),
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

pub(crate) fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Model(format!("tensor readback failed: {e:?}")))
}
