//! Per-sample attribution hooks called by the evaluator.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bigearth_core::Result;
use bigearth_dataset::BandTensors;
use burn::tensor::{activation, backend::Backend};
use serde::Serialize;
use tracing::info;

use crate::evaluator::tensor_to_vec;
use crate::model::BigEarthClassifier;

/// Called by the evaluator once per sample.
///
/// `bands` holds a single patch (batch dimension of 1). Errors are logged
/// by the caller and never stop the evaluation.
pub trait AttributionHook<B: Backend> {
    fn attribute(
        &mut self,
        model: &BigEarthClassifier<B>,
        bands: &BandTensors<B>,
        labels: &[f32],
        patch_name: &str,
    ) -> Result<()>;

    /// Called once after the last sample
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct FeatureRecord<'a> {
    patch_name: &'a str,
    labels: Vec<usize>,
    probabilities: Vec<f32>,
    features: Vec<f32>,
}

/// Writes one JSON line per sample with the true labels, the predicted
/// probabilities and the backbone feature vector.
pub struct FeatureDump {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
}

impl FeatureDump {
    /// Creates `<dir>/<file_name>`, truncating an existing file
    pub fn create(dir: &Path, file_name: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(file_name);
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl<B: Backend> AttributionHook<B> for FeatureDump {
    fn attribute(
        &mut self,
        model: &BigEarthClassifier<B>,
        bands: &BandTensors<B>,
        labels: &[f32],
        patch_name: &str,
    ) -> Result<()> {
        let features = model.features(bands)?;
        let probabilities = activation::sigmoid(model.logits_from_features(features.clone()));

        let record = FeatureRecord {
            patch_name,
            labels: labels
                .iter()
                .enumerate()
                .filter(|(_, &v)| v >= 0.5)
                .map(|(i, _)| i)
                .collect(),
            probabilities: tensor_to_vec(probabilities)?,
            features: tensor_to_vec(features)?,
        };

        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        info!(
            "Wrote {} attribution records to {}",
            self.written,
            self.path.display()
        );
        Ok(())
    }
}
