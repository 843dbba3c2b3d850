//! BigEarthNet dataset loading and batching library.
//!
//! This crate loads multi-resolution Sentinel-2 patches from JSON-lines
//! files, shards them across workers, shuffles, augments and normalises them,
//! and batches them into burn tensors at their native resolutions.

pub mod augmentation;
pub mod batcher;
pub mod loader;
pub mod sample;
pub mod statistics;

pub use augmentation::{Augmenter, FlipConfig};
pub use batcher::{BandBatcher, BandTensors, BigEarthBatch};
pub use loader::{
    create_batched_dataset, load_jsonl, parse_record, BatchIter, BatchedDataset, DatasetOptions,
    PatchDataset,
};
pub use sample::MultiResolutionSample;
pub use statistics::BandStatistics;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::augmentation::*;
    pub use crate::batcher::*;
    pub use crate::loader::*;
    pub use crate::sample::*;
    pub use crate::statistics::*;
}
