//! Run configuration for BigEarthNet training and evaluation.

use crate::error::{Error, Result};
use crate::types::LabelScheme;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for a training or evaluation run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Model configuration
    pub model: ModelConfig,
    /// Training hyperparameters
    pub training: TrainingParams,
    /// Data configuration
    pub data: DataConfig,
    /// Multi-worker configuration
    pub distributed: DistributedConfig,
    /// Output locations
    pub output: OutputConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            model: ModelConfig::default(),
            training: TrainingParams::default(),
            data: DataConfig::default(),
            distributed: DistributedConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl RunConfig {
    /// Label scheme derived from `data.label_type`
    pub fn label_scheme(&self) -> LabelScheme {
        LabelScheme::from_label_type(self.data.label_type.clone())
    }

    /// Directory holding checkpoint snapshots: `<root>/checkpoint_<model>/checkpoints`
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.output
            .checkpoint_root
            .join(format!("checkpoint_{}", self.model.name))
            .join("checkpoints")
    }

    /// Number of workers taking part in the run
    pub fn world_size(&self) -> usize {
        if self.distributed.enabled {
            self.distributed.num_workers.max(1)
        } else {
            1
        }
    }

    /// Rejects values the training loop cannot work with
    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        if t.batch_size == 0 {
            return Err(Error::Config("training.batch_size must be positive".into()));
        }
        if t.nb_epoch == 0 {
            return Err(Error::Config("training.nb_epoch must be positive".into()));
        }
        if !(t.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "training.learning_rate must be positive, got {}",
                t.learning_rate
            )));
        }
        if t.decay_step == 0 {
            return Err(Error::Config("training.decay_step must be positive".into()));
        }
        if !(t.decay_rate > 0.0 && t.decay_rate <= 1.0) {
            return Err(Error::Config(format!(
                "training.decay_rate must be in (0, 1], got {}",
                t.decay_rate
            )));
        }
        if !(t.label_smoothing >= 0.0 && t.label_smoothing < 1.0) {
            return Err(Error::Config(format!(
                "training.label_smoothing must be in [0, 1), got {}",
                t.label_smoothing
            )));
        }
        if !(t.threshold > 0.0 && t.threshold < 1.0) {
            return Err(Error::Config(format!(
                "training.threshold must be in (0, 1), got {}",
                t.threshold
            )));
        }
        if t.backward_passes == 0 {
            return Err(Error::Config("training.backward_passes must be positive".into()));
        }
        if t.eval_every == 0 {
            return Err(Error::Config("training.eval_every must be positive".into()));
        }
        if self.data.shuffle_buffer_size == 0 {
            return Err(Error::Config("data.shuffle_buffer_size must be positive".into()));
        }
        if self.distributed.enabled && self.distributed.num_workers == 0 {
            return Err(Error::Config("distributed.num_workers must be positive".into()));
        }
        if self.model.dense_hidden.iter().any(|&h| h == 0) {
            return Err(Error::Config("model.dense_hidden sizes must be positive".into()));
        }
        if !(self.model.dropout >= 0.0 && self.model.dropout < 1.0) {
            return Err(Error::Config(format!(
                "model.dropout must be in [0, 1), got {}",
                self.model.dropout
            )));
        }
        Ok(())
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Registry name of the backbone
    pub name: String,
    /// Substitute the default architecture (Dense) for unknown names instead
    /// of failing. Off by default, so an unknown name is an error unless the
    /// lenient lookup is asked for.
    pub fallback_to_default: bool,
    /// Hidden layer widths of the dense backbone
    pub dense_hidden: Vec<usize>,
    /// Dropout rate
    pub dropout: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "ResNet18".to_string(),
            fallback_to_default: false,
            dense_hidden: vec![128, 64],
            dropout: 0.2,
        }
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Per-worker batch size
    pub batch_size: usize,
    /// Number of training epochs
    pub nb_epoch: usize,
    /// Base learning rate, scaled by the worker count
    pub learning_rate: f64,
    /// Label smoothing factor for the BCE loss
    pub label_smoothing: f64,
    /// Epoch interval between learning rate decays
    pub decay_step: usize,
    /// Multiplicative decay factor
    pub decay_rate: f64,
    /// Local batches accumulated per synchronized update
    pub backward_passes: usize,
    /// Epoch interval between validation runs
    pub eval_every: usize,
    /// Probability threshold for a positive prediction
    pub threshold: f64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            batch_size: 32,
            nb_epoch: 100,
            learning_rate: 0.001,
            label_smoothing: 0.0,
            decay_step: 10,
            decay_rate: 0.9,
            backward_passes: 1,
            eval_every: 10,
            threshold: 0.5,
        }
    }
}

/// Data configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Label nomenclature, "BigEarthNet-19" or the 43-class original
    pub label_type: String,
    /// JSON-lines files with training patches
    pub train_files: Vec<PathBuf>,
    /// JSON-lines files with validation patches
    pub val_files: Vec<PathBuf>,
    /// JSON-lines files with test patches
    pub test_files: Vec<PathBuf>,
    /// Size of the shuffle buffer
    pub shuffle_buffer_size: usize,
    /// Whether to apply random flips to training patches
    pub augment: bool,
    /// Whether to standardize bands with BigEarthNet statistics
    pub normalize: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            label_type: "BigEarthNet-19".to_string(),
            train_files: vec![PathBuf::from("data/train.jsonl")],
            val_files: vec![PathBuf::from("data/val.jsonl")],
            test_files: vec![PathBuf::from("data/test.jsonl")],
            shuffle_buffer_size: 1000,
            augment: false,
            normalize: true,
        }
    }
}

/// Multi-worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Whether to run with more than one worker
    pub enabled: bool,
    /// Number of workers in the group
    pub num_workers: usize,
    /// Collective timeout in seconds; waits forever when absent
    pub timeout_secs: Option<u64>,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            num_workers: 1,
            timeout_secs: None,
        }
    }
}

/// Output locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Parent of the `checkpoint_<model>` directory
    pub checkpoint_root: PathBuf,
    /// Root directory for scalar summaries
    pub log_dir: PathBuf,
    /// Checkpoint directory restored in evaluation mode
    pub eval_checkpoint: Option<PathBuf>,
    /// Directory for attribution dumps in evaluation mode
    pub attribution_dir: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            checkpoint_root: PathBuf::from("."),
            log_dir: PathBuf::from("logs/scalars"),
            eval_checkpoint: None,
            attribution_dir: None,
        }
    }
}
