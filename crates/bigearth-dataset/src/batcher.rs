//! Burn batching for multi-resolution patches.
//!
//! Bands keep their native resolutions in the batch; resampling onto the
//! common grid happens inside the model.

use std::collections::BTreeMap;

use bigearth_core::{Band, Error, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

use crate::sample::MultiResolutionSample;

/// Band rasters of a batch, each `[batch, height, width]` at native size
#[derive(Clone, Debug)]
pub struct BandTensors<B: Backend> {
    tensors: BTreeMap<Band, Tensor<B, 3>>,
}

impl<B: Backend> Default for BandTensors<B> {
    fn default() -> Self {
        Self {
            tensors: BTreeMap::new(),
        }
    }
}

impl<B: Backend> BandTensors<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, band: Band, tensor: Tensor<B, 3>) {
        self.tensors.insert(band, tensor);
    }

    pub fn with(mut self, band: Band, tensor: Tensor<B, 3>) -> Self {
        self.insert(band, tensor);
        self
    }

    pub fn get(&self, band: Band) -> Result<Tensor<B, 3>> {
        self.tensors
            .get(&band)
            .cloned()
            .ok_or_else(|| Error::MissingBand {
                band,
                context: "band tensors".to_string(),
            })
    }

    pub fn contains(&self, band: Band) -> bool {
        self.tensors.contains_key(&band)
    }

    pub fn bands(&self) -> impl Iterator<Item = Band> + '_ {
        self.tensors.keys().copied()
    }

    /// Batch dimension of the first band, 0 when empty
    pub fn batch_size(&self) -> usize {
        self.tensors
            .values()
            .next()
            .map(|t| t.dims()[0])
            .unwrap_or(0)
    }

    /// Single-sample view `[1, h, w]` of every band
    pub fn select(&self, index: usize) -> Self {
        Self {
            tensors: self
                .tensors
                .iter()
                .map(|(&band, t)| (band, t.clone().narrow(0, index, 1)))
                .collect(),
        }
    }

    /// Builds band tensors from validated samples
    pub fn from_samples(samples: &[MultiResolutionSample], device: &B::Device) -> Self {
        let batch_size = samples.len();
        let tensors = Band::ALL
            .iter()
            .map(|&band| {
                let size = band.native_size();
                let data: Vec<f32> = samples
                    .iter()
                    .flat_map(|s| s.band(band).iter().copied())
                    .collect();
                let tensor = Tensor::<B, 3>::from_floats(
                    TensorData::new(data, [batch_size, size, size]),
                    device,
                );
                (band, tensor)
            })
            .collect();
        Self { tensors }
    }
}

/// A batch of BigEarthNet patches
#[derive(Clone, Debug)]
pub struct BigEarthBatch<B: Backend> {
    /// Native-resolution band rasters
    pub bands: BandTensors<B>,
    /// Multi-hot targets with shape [batch_size, num_classes]
    pub targets: Tensor<B, 2, Int>,
    /// Multi-hot targets, row-major, for metric accumulation
    pub labels: Vec<f32>,
    pub patch_names: Vec<String>,
}

impl<B: Backend> BigEarthBatch<B> {
    pub fn len(&self) -> usize {
        self.patch_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patch_names.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.targets.dims()[1]
    }
}

/// Batcher turning patches into [`BigEarthBatch`]es
#[derive(Clone, Debug, Default)]
pub struct BandBatcher;

impl BandBatcher {
    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> Batcher<B, MultiResolutionSample, BigEarthBatch<B>> for BandBatcher {
    fn batch(&self, items: Vec<MultiResolutionSample>, device: &B::Device) -> BigEarthBatch<B> {
        let batch_size = items.len();
        let num_classes = items.first().map(|s| s.num_classes()).unwrap_or(0);

        let bands = BandTensors::from_samples(&items, device);

        let labels: Vec<f32> = items
            .iter()
            .flat_map(|s| s.labels().iter().copied())
            .collect();
        let targets_data: Vec<i64> = labels.iter().map(|&v| i64::from(v >= 0.5)).collect();
        let targets = Tensor::<B, 2, Int>::from_data(
            TensorData::new(targets_data, [batch_size, num_classes]),
            device,
        );

        let patch_names = items.iter().map(|s| s.patch_name().to_string()).collect();

        BigEarthBatch {
            bands,
            targets,
            labels,
            patch_names,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::test_utils::constant_sample;
    use bigearth_core::LabelScheme;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_batch_shapes() {
        let device = Default::default();
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let items = vec![
            constant_sample("a", 1.0, &scheme),
            constant_sample("b", 2.0, &scheme),
            constant_sample("c", 3.0, &scheme),
        ];

        let batch: BigEarthBatch<TestBackend> = BandBatcher::new().batch(items, &device);

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.num_classes(), 19);
        assert_eq!(batch.targets.dims(), [3, 19]);
        assert_eq!(batch.bands.batch_size(), 3);
        assert_eq!(batch.bands.get(Band::B02).unwrap().dims(), [3, 120, 120]);
        assert_eq!(batch.bands.get(Band::B12).unwrap().dims(), [3, 60, 60]);
        assert_eq!(batch.bands.get(Band::B01).unwrap().dims(), [3, 20, 20]);
        assert_eq!(batch.patch_names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_select_single_sample() {
        let device = Default::default();
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let items = vec![
            constant_sample("a", 1.0, &scheme),
            constant_sample("b", 2.0, &scheme),
        ];
        let batch: BigEarthBatch<TestBackend> = BandBatcher::new().batch(items, &device);

        let single = batch.bands.select(1);
        let b09 = single.get(Band::B09).unwrap();
        assert_eq!(b09.dims(), [1, 20, 20]);
        let values = b09.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn test_missing_band_lookup() {
        let tensors = BandTensors::<TestBackend>::new();
        assert!(matches!(
            tensors.get(Band::B04),
            Err(Error::MissingBand { band: Band::B04, .. })
        ));
        assert_eq!(tensors.batch_size(), 0);
    }
}
