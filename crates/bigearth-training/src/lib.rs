//! # BigEarthNet Training
//!
//! Multi-label classification of multi-resolution Sentinel-2 patches with the
//! Burn framework.
//!
//! ## Modules
//!
//! - `fusion`: resamples the 20 m and 60 m bands onto the 10 m grid and stacks all 12 bands
//! - `model`: model registry and the Dense, ResNet-18 and EfficientNet-B0 classifiers
//! - `distributed`: worker collectives (all-reduce, broadcast, barrier)
//! - `trainer`: the synchronized training loop with checkpointing and step decay
//! - `evaluator`: forward-only evaluation with an optional attribution hook
//! - `session`: seeding and orchestration of training and evaluation runs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bigearth_core::RunConfig;
//! use bigearth_training::{backend, run, RunMode};
//!
//! let config: RunConfig = bigearth_core::load_toml_config("configs/base.toml")?;
//! let report = run::<backend::TrainingBackend>(&config, RunMode::Train, backend::default_device())?;
//! println!("{}", report.test_report());
//! ```

pub mod attribution;
pub mod backend;
pub mod checkpoint;
pub mod distributed;
pub mod evaluator;
pub mod fusion;
pub mod loss;
pub mod lr_schedule;
pub mod model;
pub mod session;
pub mod summary;
pub mod trainer;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used items for convenience
pub use attribution::{AttributionHook, FeatureDump};
pub use checkpoint::{CheckpointManager, CheckpointMetadata};
pub use distributed::{Coordinator, LocalGroup, LocalWorker, SingleWorker};
pub use evaluator::{EvaluationReport, Evaluator};
pub use fusion::{fuse, FusionPlan};
pub use loss::SmoothedBceWithLogits;
pub use lr_schedule::{linear_scaled_lr, LearningRateScheduler};
pub use model::{BigEarthClassifier, BigEarthClassifierConfig, ModelFactory};
pub use session::{run, run_worker, RunContext, RunMode, RunReport};
pub use summary::{SummaryStream, SummaryWriter};
pub use trainer::{Trainer, TrainingOutcome, TrainingState};
