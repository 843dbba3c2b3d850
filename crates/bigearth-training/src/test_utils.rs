//! Builders for small synthetic patches and splits used by the tests.

use std::fs;
use std::path::{Path, PathBuf};

use bigearth_core::{Band, LabelScheme, RunConfig};
use bigearth_dataset::{BatchedDataset, DatasetOptions, MultiResolutionSample, PatchDataset};
use burn::module::{Module, ModuleVisitor, ParamId};
use burn::tensor::{backend::Backend, Tensor};
use serde_json::{json, Map, Value};

struct ParamBits(Vec<u32>);

impl<B: Backend> ModuleVisitor<B> for ParamBits {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let values = tensor
            .clone()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();
        self.0.extend(values.into_iter().map(f32::to_bits));
    }
}

/// Bit patterns of every float parameter, in visit order
pub fn param_bits<B: Backend, M: Module<B>>(model: &M) -> Vec<u32> {
    let mut bits = ParamBits(Vec::new());
    model.visit(&mut bits);
    bits.0
}

/// Patch with every raster filled with `fill` and the given positive classes
pub fn labelled_sample(
    name: &str,
    fill: f32,
    positives: &[usize],
    scheme: &LabelScheme,
) -> MultiResolutionSample {
    let bands = Band::ALL
        .iter()
        .map(|&b| (b, vec![fill; b.num_pixels()]))
        .collect();
    let mut labels = vec![0.0; scheme.num_classes];
    for &p in positives {
        labels[p] = 1.0;
    }
    MultiResolutionSample::new(name, bands, labels, scheme).unwrap()
}

/// Patch with the first class positive
pub fn constant_sample(name: &str, fill: f32, scheme: &LabelScheme) -> MultiResolutionSample {
    labelled_sample(name, fill, &[0], scheme)
}

/// `n` patches whose fill value and labels vary with their index
pub fn synthetic_samples(prefix: &str, n: usize, scheme: &LabelScheme) -> Vec<MultiResolutionSample> {
    (0..n)
        .map(|i| {
            let positives = [i % scheme.num_classes, (i * 7 + 3) % scheme.num_classes];
            labelled_sample(
                &format!("{prefix}_{i}"),
                (i % 5) as f32 * 0.25,
                &positives,
                scheme,
            )
        })
        .collect()
}

/// Unnormalised, unshuffled batched source over in-memory patches
pub fn in_memory_split(
    samples: Vec<MultiResolutionSample>,
    batch_size: usize,
    scheme: &LabelScheme,
    num_workers: usize,
    worker_index: usize,
    training: bool,
) -> BatchedDataset {
    let base = if training {
        DatasetOptions::training(Vec::new(), batch_size, scheme.clone())
    } else {
        DatasetOptions::evaluation(Vec::new(), batch_size, scheme.clone())
    };
    let options = DatasetOptions {
        num_workers,
        worker_index,
        normalize: false,
        ..base
    };
    BatchedDataset::from_dataset(PatchDataset::new(samples), options).unwrap()
}

/// Writes patches as JSON lines in the on-disk record format
pub fn write_jsonl(path: &Path, samples: &[MultiResolutionSample], scheme: &LabelScheme) {
    let lines: Vec<String> = samples
        .iter()
        .map(|s| {
            let mut record = Map::new();
            record.insert("patch_name".into(), json!(s.patch_name()));
            for band in Band::ALL {
                record.insert(band.name().into(), json!(s.band(band)));
            }
            record.insert(scheme.field_name(), json!(s.labels()));
            Value::Object(record).to_string()
        })
        .collect();
    fs::write(path, lines.join("\n")).unwrap();
}

/// Writes train/val/test splits under `dir` and returns a small dense run
pub fn tiny_run(dir: &Path, train: usize, eval: usize) -> RunConfig {
    let mut config = RunConfig::default();
    let scheme = config.label_scheme();

    let split = |name: &str, n: usize| -> PathBuf {
        let path = dir.join(format!("{name}.jsonl"));
        write_jsonl(&path, &synthetic_samples(name, n, &scheme), &scheme);
        path
    };

    config.data.train_files = vec![split("train", train)];
    config.data.val_files = vec![split("val", eval)];
    config.data.test_files = vec![split("test", eval)];
    config.data.shuffle_buffer_size = 8;
    config.model.name = "Dense".into();
    config.model.dense_hidden = vec![4, 4];
    config.training.batch_size = 2;
    config.training.nb_epoch = 2;
    config.training.eval_every = 1;
    config.training.learning_rate = 0.01;
    config.output.checkpoint_root = dir.to_path_buf();
    config.output.log_dir = dir.join("logs");
    config
}
