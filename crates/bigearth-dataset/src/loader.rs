//! JSON-lines patch loading, sharding and shuffle-buffer batching.
//!
//! Each line of an input file is one patch:
//!
//! ```json
//! {"patch_name": "S2A_...", "B01": [[...]], ..., "BigEarthNet-19_labels_multi_hot": [0, 1, ...]}
//! ```
//!
//! Band rasters may be nested (`[[row], ...]`) or flat row-major arrays.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use bigearth_core::{Band, Error, LabelScheme, Result};
use burn::data::dataset::Dataset;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::augmentation::{Augmenter, FlipConfig};
use crate::sample::{check_raster_len, MultiResolutionSample};
use crate::statistics::BandStatistics;

const SHUFFLE_STREAM: u64 = 0;
const AUGMENT_STREAM: u64 = 1;

#[derive(Deserialize)]
#[serde(untagged)]
enum Raster {
    Nested(Vec<Vec<f32>>),
    Flat(Vec<f32>),
}

impl Raster {
    fn into_flat(self, band: Band) -> Result<Vec<f32>> {
        match self {
            Raster::Flat(values) => {
                check_raster_len(band, values.len())?;
                Ok(values)
            }
            Raster::Nested(rows) => {
                let size = band.native_size();
                let height = rows.len();
                let width = rows.first().map(Vec::len).unwrap_or(0);
                if height != size || rows.iter().any(|r| r.len() != size) {
                    return Err(Error::ShapeMismatch {
                        band,
                        expected: vec![size, size],
                        actual: vec![height, width],
                    });
                }
                Ok(rows.into_iter().flatten().collect())
            }
        }
    }
}

/// Parses one JSON record into a validated sample
pub fn parse_record(line: &str, scheme: &LabelScheme) -> Result<MultiResolutionSample> {
    let mut record: serde_json::Map<String, Value> = serde_json::from_str(line)?;

    let patch_name = match record.remove("patch_name") {
        Some(Value::String(name)) => name,
        Some(other) => other.to_string(),
        None => String::new(),
    };

    let mut bands = BTreeMap::new();
    for band in Band::ALL {
        let value = record.remove(band.name()).ok_or_else(|| Error::MissingBand {
            band,
            context: format!("patch '{patch_name}'"),
        })?;
        let raster: Raster = serde_json::from_value(value).map_err(|e| {
            Error::Dataset(format!("Band {band} of patch '{patch_name}': {e}"))
        })?;
        bands.insert(band, raster.into_flat(band)?);
    }

    let field = scheme.field_name();
    let labels = record.remove(&field).ok_or_else(|| {
        Error::Dataset(format!("Patch '{patch_name}' has no '{field}' field"))
    })?;
    let labels: Vec<f32> = serde_json::from_value(labels)?;

    MultiResolutionSample::new(patch_name, bands, labels, scheme)
}

/// Reads every record of a JSON-lines file, in file order
pub fn load_jsonl(path: &Path, scheme: &LabelScheme) -> Result<Vec<MultiResolutionSample>> {
    if !path.exists() {
        return Err(Error::NotFound(format!(
            "Dataset file not found: {}",
            path.display()
        )));
    }

    let reader = BufReader::new(File::open(path)?);
    let mut samples = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let sample = parse_record(&line, scheme).map_err(|e| match e {
            Error::Serialization(msg) => Error::Dataset(format!(
                "{}:{}: {}",
                path.display(),
                line_no + 1,
                msg
            )),
            other => other,
        })?;
        samples.push(sample);
    }

    debug!("Loaded {} patches from {}", samples.len(), path.display());
    Ok(samples)
}

/// In-memory patch collection implementing burn's `Dataset`
#[derive(Debug, Clone, Default)]
pub struct PatchDataset {
    samples: Vec<MultiResolutionSample>,
}

impl PatchDataset {
    pub fn new(samples: Vec<MultiResolutionSample>) -> Self {
        Self { samples }
    }

    pub fn from_files(files: &[PathBuf], scheme: &LabelScheme) -> Result<Self> {
        let mut samples = Vec::new();
        for file in files {
            samples.extend(load_jsonl(file, scheme)?);
        }
        Ok(Self { samples })
    }

    /// Keeps the records with `index % num_workers == worker_index`
    pub fn shard(self, num_workers: usize, worker_index: usize) -> Result<Self> {
        if num_workers == 0 || worker_index >= num_workers {
            return Err(Error::InvalidArgument(format!(
                "Invalid shard {worker_index} of {num_workers}"
            )));
        }
        let samples = self
            .samples
            .into_iter()
            .enumerate()
            .filter(|(i, _)| i % num_workers == worker_index)
            .map(|(_, s)| s)
            .collect();
        Ok(Self { samples })
    }

    /// Truncates to `len` samples
    pub fn truncate(mut self, len: usize) -> Self {
        self.samples.truncate(len);
        self
    }

    pub fn samples(&self) -> &[MultiResolutionSample] {
        &self.samples
    }

    fn samples_mut(&mut self) -> &mut [MultiResolutionSample] {
        &mut self.samples
    }
}

impl Dataset<MultiResolutionSample> for PatchDataset {
    fn get(&self, index: usize) -> Option<MultiResolutionSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Options for [`create_batched_dataset`]
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub files: Vec<PathBuf>,
    pub batch_size: usize,
    pub shuffle_buffer_size: usize,
    pub label_scheme: LabelScheme,
    pub num_workers: usize,
    pub worker_index: usize,
    pub augment: bool,
    /// Standardise bands with the BigEarthNet statistics
    pub normalize: bool,
    /// Shuffle through the shuffle buffer each epoch
    pub shuffle: bool,
    /// Drop trailing records so every worker's shard has the same length
    pub equalize_shards: bool,
    pub seed: u64,
}

impl DatasetOptions {
    /// Options for a training split: shuffled and equalised across workers
    pub fn training(files: Vec<PathBuf>, batch_size: usize, label_scheme: LabelScheme) -> Self {
        Self {
            files,
            batch_size,
            shuffle_buffer_size: 1000,
            label_scheme,
            num_workers: 1,
            worker_index: 0,
            augment: false,
            normalize: true,
            shuffle: true,
            equalize_shards: true,
            seed: 42,
        }
    }

    /// Options for a validation or test split: in order, every record kept
    pub fn evaluation(files: Vec<PathBuf>, batch_size: usize, label_scheme: LabelScheme) -> Self {
        Self {
            shuffle: false,
            equalize_shards: false,
            ..Self::training(files, batch_size, label_scheme)
        }
    }
}

/// Loads, shards and prepares a split, returning a restartable batch source
pub fn create_batched_dataset(options: DatasetOptions) -> Result<BatchedDataset> {
    let dataset = PatchDataset::from_files(&options.files, &options.label_scheme)?;
    BatchedDataset::from_dataset(dataset, options)
}

/// A worker's shard of a split, iterated in batches
#[derive(Debug, Clone)]
pub struct BatchedDataset {
    dataset: PatchDataset,
    batch_size: usize,
    shuffle_buffer_size: usize,
    shuffle: bool,
    augmenter: Option<Augmenter>,
    seed: u64,
    total_records: usize,
}

impl BatchedDataset {
    pub fn from_dataset(dataset: PatchDataset, options: DatasetOptions) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(Error::InvalidArgument("batch_size must be positive".into()));
        }

        let total_records = dataset.len();
        let mut shard = dataset.shard(options.num_workers, options.worker_index)?;
        if options.equalize_shards {
            shard = shard.truncate(total_records / options.num_workers);
        }

        if options.normalize {
            let stats = BandStatistics::bigearthnet();
            for sample in shard.samples_mut() {
                stats.normalize(sample);
            }
        }

        info!(
            "Worker {}/{}: {} of {} patches, batch size {}",
            options.worker_index,
            options.num_workers,
            shard.len(),
            total_records,
            options.batch_size
        );

        Ok(Self {
            dataset: shard,
            batch_size: options.batch_size,
            shuffle_buffer_size: options.shuffle_buffer_size.max(1),
            shuffle: options.shuffle,
            augmenter: options
                .augment
                .then(|| Augmenter::new(FlipConfig::default())),
            seed: options.seed ^ (options.worker_index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
            total_records,
        })
    }

    /// Number of patches in this worker's shard
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Number of patches across all shards
    pub fn total_records(&self) -> usize {
        self.total_records
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches per epoch, the last one possibly partial
    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    pub fn dataset(&self) -> &PatchDataset {
        &self.dataset
    }

    /// Sample order for an epoch, drawn through the shuffle buffer
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let n = self.len();
        if !self.shuffle {
            return (0..n).collect();
        }
        let mut rng = self.rng(epoch, SHUFFLE_STREAM);
        shuffle_buffer_order(n, self.shuffle_buffer_size, &mut rng)
    }

    /// Iterates the batches of an epoch. Each call restarts from the beginning.
    pub fn iter_batches(&self, epoch: usize) -> BatchIter<'_> {
        BatchIter {
            source: self,
            order: self.epoch_order(epoch),
            position: 0,
            rng: self.rng(epoch, AUGMENT_STREAM),
        }
    }

    fn rng(&self, epoch: usize, stream: u64) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        rng.set_stream(stream);
        rng
    }
}

/// Iterator over the batches of one epoch
pub struct BatchIter<'a> {
    source: &'a BatchedDataset,
    order: Vec<usize>,
    position: usize,
    rng: ChaCha8Rng,
}

impl Iterator for BatchIter<'_> {
    type Item = Vec<MultiResolutionSample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.source.batch_size).min(self.order.len());
        let mut batch: Vec<_> = self.order[self.position..end]
            .iter()
            .filter_map(|&i| self.source.dataset.get(i))
            .collect();
        self.position = end;

        if let Some(augmenter) = &self.source.augmenter {
            for sample in &mut batch {
                augmenter.augment(sample, &mut self.rng);
            }
        }
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self
            .order
            .len()
            .saturating_sub(self.position)
            .div_ceil(self.source.batch_size);
        (remaining, Some(remaining))
    }
}

/// Streaming shuffle: a buffer of `buffer_size` elements is filled from the
/// input, and each output draws a random slot which is then refilled with
/// the next input element.
pub fn shuffle_buffer_order<R: Rng>(n: usize, buffer_size: usize, rng: &mut R) -> Vec<usize> {
    let mut order = Vec::with_capacity(n);
    let mut buffer: Vec<usize> = Vec::with_capacity(buffer_size.min(n));
    let mut next = 0;

    while next < n && buffer.len() < buffer_size {
        buffer.push(next);
        next += 1;
    }
    while !buffer.is_empty() {
        let slot = rng.gen_range(0..buffer.len());
        order.push(buffer[slot]);
        if next < n {
            buffer[slot] = next;
            next += 1;
        } else {
            buffer.swap_remove(slot);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record_json(name: &str, fill: f32, nested: bool, scheme: &LabelScheme) -> String {
        let mut record = serde_json::Map::new();
        record.insert("patch_name".into(), Value::String(name.into()));
        for band in Band::ALL {
            let size = band.native_size();
            let value = if nested {
                serde_json::json!(vec![vec![fill; size]; size])
            } else {
                serde_json::json!(vec![fill; size * size])
            };
            record.insert(band.name().into(), value);
        }
        let mut labels = vec![0; scheme.num_classes];
        labels[1] = 1;
        record.insert(scheme.field_name(), serde_json::json!(labels));
        Value::Object(record).to_string()
    }

    fn write_jsonl(count: usize, scheme: &LabelScheme) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..count {
            writeln!(
                file,
                "{}",
                record_json(&format!("patch_{i}"), i as f32, i % 2 == 0, scheme)
            )
            .unwrap();
        }
        file
    }

    #[test]
    fn test_parse_nested_and_flat() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let nested = parse_record(&record_json("a", 1.5, true, &scheme), &scheme).unwrap();
        let flat = parse_record(&record_json("a", 1.5, false, &scheme), &scheme).unwrap();
        assert_eq!(nested, flat);
        assert_eq!(nested.band(Band::B11).len(), 3600);
        assert_eq!(nested.positive_labels(), vec![1]);
    }

    #[test]
    fn test_parse_missing_band() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let mut record: Value =
            serde_json::from_str(&record_json("a", 0.0, false, &scheme)).unwrap();
        record.as_object_mut().unwrap().remove("B09");
        let err = parse_record(&record.to_string(), &scheme).unwrap_err();
        assert!(matches!(err, Error::MissingBand { band: Band::B09, .. }));
    }

    #[test]
    fn test_parse_nested_shape_mismatch() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let mut record: Value =
            serde_json::from_str(&record_json("a", 0.0, false, &scheme)).unwrap();
        record["B01"] = serde_json::json!(vec![vec![0.0; 60]; 60]);
        let err = parse_record(&record.to_string(), &scheme).unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch { band: Band::B01, .. }
        ));
    }

    #[test]
    fn test_parse_wrong_label_type() {
        let scheme19 = LabelScheme::from_label_type("BigEarthNet-19");
        let scheme43 = LabelScheme::from_label_type("original");
        let err = parse_record(&record_json("a", 0.0, false, &scheme19), &scheme43).unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let err = load_jsonl(Path::new("/nonexistent/train.jsonl"), &scheme).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_shards_are_disjoint_and_equalised() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let file = write_jsonl(10, &scheme);

        let mut seen = Vec::new();
        for worker in 0..3 {
            let mut options =
                DatasetOptions::training(vec![file.path().to_path_buf()], 2, scheme.clone());
            options.num_workers = 3;
            options.worker_index = worker;
            options.normalize = false;
            let dataset = create_batched_dataset(options).unwrap();
            assert_eq!(dataset.len(), 3);
            assert_eq!(dataset.total_records(), 10);
            seen.extend(
                dataset
                    .dataset()
                    .samples()
                    .iter()
                    .map(|s| s.patch_name().to_string()),
            );
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn test_evaluation_shards_keep_every_record() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let file = write_jsonl(5, &scheme);
        let total: usize = (0..2)
            .map(|worker| {
                let mut options =
                    DatasetOptions::evaluation(vec![file.path().to_path_buf()], 4, scheme.clone());
                options.num_workers = 2;
                options.worker_index = worker;
                create_batched_dataset(options).unwrap().len()
            })
            .sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_batches_cover_shard() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let file = write_jsonl(7, &scheme);
        let options = DatasetOptions::evaluation(vec![file.path().to_path_buf()], 3, scheme);
        let dataset = create_batched_dataset(options).unwrap();
        let sizes: Vec<usize> = dataset.iter_batches(0).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(dataset.num_batches(), 3);
    }

    #[test]
    fn test_shuffle_is_deterministic_per_epoch() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let file = write_jsonl(12, &scheme);
        let mut options =
            DatasetOptions::training(vec![file.path().to_path_buf()], 4, scheme.clone());
        options.shuffle_buffer_size = 4;
        options.normalize = false;
        let a = create_batched_dataset(options.clone()).unwrap();
        let b = create_batched_dataset(options).unwrap();

        assert_eq!(a.epoch_order(0), b.epoch_order(0));
        assert_ne!(a.epoch_order(0), a.epoch_order(1));

        let mut sorted = a.epoch_order(3);
        sorted.sort_unstable();
        assert_eq!(sorted, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffle_buffer_of_one_keeps_order() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        assert_eq!(shuffle_buffer_order(5, 1, &mut rng), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_shuffle_buffer_is_local() {
        // With a buffer of 2, the k-th output can be at most index k + 1
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let order = shuffle_buffer_order(50, 2, &mut rng);
        for (k, &i) in order.iter().enumerate() {
            assert!(i <= k + 1);
        }
    }
}
