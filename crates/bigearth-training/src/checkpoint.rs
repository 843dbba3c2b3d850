//! Model checkpointing and state management.
//!
//! A checkpoint directory holds numbered snapshots:
//!
//! ```text
//! checkpoints/
//!   checkpoint          <- marker naming the latest snapshot
//!   ckpt-1/
//!     model.mpk
//!     optimizer.mpk
//!     metadata.json
//!   ckpt-2/
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use bigearth_core::{fused_band_order, Error, Result};
use burn::module::{AutodiffModule, Module};
use burn::optim::Optimizer;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const MARKER_FILE: &str = "checkpoint";
const SNAPSHOT_PREFIX: &str = "ckpt-";
const MODEL_FILE: &str = "model";
const OPTIMIZER_FILE: &str = "optimizer";
const METADATA_FILE: &str = "metadata.json";

/// Full precision so restored parameters are bit-identical to the saved ones
pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Metadata stored next to each snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointMetadata {
    pub epoch: usize,
    /// Validation micro F-score that triggered the snapshot
    pub micro_fscore: f64,
    pub learning_rate: f64,
    pub architecture: String,
    pub num_classes: usize,
    /// Fused channel order the model was trained with
    pub band_order: Vec<String>,
    pub timestamp: String,
}

impl CheckpointMetadata {
    pub fn new(
        epoch: usize,
        micro_fscore: f64,
        learning_rate: f64,
        architecture: impl Into<String>,
        num_classes: usize,
    ) -> Self {
        use chrono::Utc;
        Self {
            epoch,
            micro_fscore,
            learning_rate,
            architecture: architecture.into(),
            num_classes,
            band_order: fused_band_order()
                .iter()
                .map(|b| b.name().to_string())
                .collect(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize checkpoint: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| Error::Serialization(format!("Failed to deserialize checkpoint: {}", e)))
    }
}

/// Manager for numbered checkpoint snapshots
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    keep_last_n: Option<usize>,
}

impl CheckpointManager {
    /// Create a new checkpoint manager
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            keep_last_n: Some(5),
        }
    }

    /// Configure how many recent snapshots to keep
    pub fn keep_last_n(mut self, n: Option<usize>) -> Self {
        self.keep_last_n = n;
        self
    }

    /// Get checkpoint directory path
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Writes model, optimizer state and metadata as the next snapshot and
    /// marks it as the latest.
    pub fn save<B, M, O>(&self, model: &M, optimizer: &O, metadata: &CheckpointMetadata) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        fs::create_dir_all(&self.checkpoint_dir)?;

        let index = self
            .list_checkpoints()?
            .last()
            .map(|(i, _)| i + 1)
            .unwrap_or(1);
        let snapshot = self
            .checkpoint_dir
            .join(format!("{SNAPSHOT_PREFIX}{index}"));
        fs::create_dir_all(&snapshot)?;

        let recorder = CheckpointRecorder::new();
        model
            .clone()
            .save_file(snapshot.join(MODEL_FILE), &recorder)
            .map_err(|e| Error::Checkpoint(format!("Failed to save model: {e}")))?;
        Recorder::<B>::record(&recorder, optimizer.to_record(), snapshot.join(OPTIMIZER_FILE))
            .map_err(|e| Error::Checkpoint(format!("Failed to save optimizer: {e}")))?;
        metadata.save(&snapshot.join(METADATA_FILE))?;

        fs::write(
            self.checkpoint_dir.join(MARKER_FILE),
            format!("{SNAPSHOT_PREFIX}{index}\n"),
        )?;

        info!(
            "Checkpoint saved to {} (epoch {}, micro F {:.4})",
            snapshot.display(),
            metadata.epoch,
            metadata.micro_fscore
        );

        if let Some(keep_n) = self.keep_last_n {
            self.cleanup_old_checkpoints(keep_n)?;
        }

        Ok(snapshot)
    }

    /// Latest snapshot: the one named by the marker file, else the highest index
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        let marker = self.checkpoint_dir.join(MARKER_FILE);
        if marker.is_file() {
            let name = fs::read_to_string(&marker)?;
            let snapshot = self.checkpoint_dir.join(name.trim());
            if snapshot.is_dir() {
                return Ok(Some(snapshot));
            }
            warn!(
                "Checkpoint marker names missing snapshot {}",
                snapshot.display()
            );
        }
        Ok(self.list_checkpoints()?.pop().map(|(_, path)| path))
    }

    /// Restores model parameters from a snapshot
    pub fn restore_model<B, M>(&self, snapshot: &Path, model: M, device: &B::Device) -> Result<M>
    where
        B: Backend,
        M: Module<B>,
    {
        let recorder = CheckpointRecorder::new();
        let model = model
            .load_file(snapshot.join(MODEL_FILE), &recorder, device)
            .map_err(|e| {
                Error::Checkpoint(format!(
                    "Failed to load model from {}: {e}",
                    snapshot.display()
                ))
            })?;
        info!("Model restored from {}", snapshot.display());
        Ok(model)
    }

    pub fn load_metadata(&self, snapshot: &Path) -> Result<CheckpointMetadata> {
        CheckpointMetadata::load(&snapshot.join(METADATA_FILE))
    }

    /// All snapshots as `(index, path)`, ordered by index
    pub fn list_checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.checkpoint_dir.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let index = path
                .file_name()
                .and_then(|s| s.to_str())
                .and_then(extract_index_from_dirname);
            if let Some(index) = index {
                checkpoints.push((index, path));
            }
        }
        checkpoints.sort_by_key(|(i, _)| *i);
        Ok(checkpoints)
    }

    /// Clean up old snapshots, keeping only the last N
    fn cleanup_old_checkpoints(&self, keep_n: usize) -> Result<()> {
        let checkpoints = self.list_checkpoints()?;
        if checkpoints.len() <= keep_n {
            return Ok(());
        }

        let to_remove = checkpoints.len() - keep_n;
        for (_, path) in checkpoints.iter().take(to_remove) {
            if let Err(e) = fs::remove_dir_all(path) {
                warn!("Failed to remove old checkpoint {:?}: {}", path, e);
            } else {
                info!("Removed old checkpoint: {:?}", path);
            }
        }
        Ok(())
    }
}

/// Snapshot index from a directory name such as `ckpt-12`
pub fn extract_index_from_dirname(name: &str) -> Option<usize> {
    name.strip_prefix(SNAPSHOT_PREFIX)
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BigEarthClassifierConfig;
    use crate::test_utils::param_bits;
    use crate::BigEarthClassifier;
    use bigearth_core::ModelArchitecture;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    fn tiny_model(device: &<TestBackend as Backend>::Device) -> BigEarthClassifier<TestBackend> {
        BigEarthClassifierConfig::new(ModelArchitecture::Dense, 19)
            .with_dense_hidden(vec![2])
            .init(device)
    }

    fn model_bytes(model: &BigEarthClassifier<TestBackend>) -> Vec<u32> {
        param_bits::<TestBackend, _>(model)
    }

    #[test]
    fn test_extract_index_from_dirname() {
        assert_eq!(extract_index_from_dirname("ckpt-5"), Some(5));
        assert_eq!(extract_index_from_dirname("ckpt-123"), Some(123));
        assert_eq!(extract_index_from_dirname("checkpoint"), None);
        assert_eq!(extract_index_from_dirname("ckpt-x"), None);
    }

    #[test]
    fn test_metadata_save_load() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metadata.json");

        let original = CheckpointMetadata::new(10, 0.75, 0.004, "ResNet18", 19);
        original.save(&path)?;
        let loaded = CheckpointMetadata::load(&path)?;

        assert_eq!(loaded, original);
        assert_eq!(loaded.band_order[0], "B04");
        assert_eq!(loaded.band_order[11], "B09");
        Ok(())
    }

    #[test]
    fn test_latest_of_empty_dir() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path().join("missing"));
        assert!(manager.latest()?.is_none());
        Ok(())
    }

    #[test]
    fn test_save_and_restore() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let device = Default::default();
        let manager = CheckpointManager::new(temp_dir.path().join("checkpoints"));

        let model = tiny_model(&device);
        let optimizer = AdamConfig::new().init::<TestBackend, BigEarthClassifier<TestBackend>>();

        let first = manager.save::<TestBackend, _, _>(
            &model,
            &optimizer,
            &CheckpointMetadata::new(0, 0.1, 0.001, "Dense", 19),
        )?;
        let second = manager.save::<TestBackend, _, _>(
            &model,
            &optimizer,
            &CheckpointMetadata::new(1, 0.2, 0.001, "Dense", 19),
        )?;
        assert!(first.ends_with("ckpt-1"));
        assert!(second.ends_with("ckpt-2"));
        assert_eq!(manager.latest()?, Some(second.clone()));
        assert_eq!(manager.load_metadata(&second)?.epoch, 1);

        // A freshly initialised model differs until restored
        let other = tiny_model(&device);
        assert_ne!(model_bytes(&other), model_bytes(&model));
        let restored = manager.restore_model::<TestBackend, _>(&second, other, &device)?;
        assert_eq!(model_bytes(&restored), model_bytes(&model));

        assert!(second.join(format!("{OPTIMIZER_FILE}.mpk")).exists());
        Ok(())
    }

    #[test]
    fn test_latest_falls_back_to_highest_index() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();
        fs::create_dir_all(dir.join("ckpt-2"))?;
        fs::create_dir_all(dir.join("ckpt-10"))?;
        fs::create_dir_all(dir.join("other"))?;

        let manager = CheckpointManager::new(dir.clone());
        assert_eq!(manager.latest()?, Some(dir.join("ckpt-10")));

        fs::write(dir.join(MARKER_FILE), "ckpt-2\n")?;
        assert_eq!(manager.latest()?, Some(dir.join("ckpt-2")));

        fs::write(dir.join(MARKER_FILE), "ckpt-99\n")?;
        assert_eq!(manager.latest()?, Some(dir.join("ckpt-10")));
        Ok(())
    }

    #[test]
    fn test_cleanup_keeps_last_n() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let device = Default::default();
        let manager =
            CheckpointManager::new(temp_dir.path().to_path_buf()).keep_last_n(Some(2));
        let model = tiny_model(&device);
        let optimizer = AdamConfig::new().init::<TestBackend, BigEarthClassifier<TestBackend>>();

        for epoch in 0..4 {
            let metadata = CheckpointMetadata::new(epoch, 0.1 * epoch as f64, 0.001, "Dense", 19);
            manager.save::<TestBackend, _, _>(&model, &optimizer, &metadata)?;
        }

        let indices: Vec<usize> = manager.list_checkpoints()?.into_iter().map(|(i, _)| i).collect();
        assert_eq!(indices, vec![3, 4]);
        assert_eq!(manager.latest()?, Some(temp_dir.path().join("ckpt-4")));
        Ok(())
    }
}
