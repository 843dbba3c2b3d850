//! Geometric augmentation for multi-resolution patches.
//!
//! Flips are drawn once per sample and applied to every band, so all
//! resolutions stay co-registered.

use rand::Rng;

use crate::sample::MultiResolutionSample;

/// Configuration for random flips
#[derive(Clone, Debug)]
pub struct FlipConfig {
    /// Probability of applying horizontal flip (0.0 - 1.0)
    pub horizontal_flip_prob: f64,
    /// Probability of applying vertical flip (0.0 - 1.0)
    pub vertical_flip_prob: f64,
}

impl Default for FlipConfig {
    fn default() -> Self {
        Self {
            horizontal_flip_prob: 0.5,
            vertical_flip_prob: 0.5,
        }
    }
}

impl FlipConfig {
    /// Disable all augmentations
    pub fn none() -> Self {
        Self {
            horizontal_flip_prob: 0.0,
            vertical_flip_prob: 0.0,
        }
    }
}

/// Applies random flips consistently across the bands of a sample
#[derive(Clone, Debug, Default)]
pub struct Augmenter {
    config: FlipConfig,
}

impl Augmenter {
    pub fn new(config: FlipConfig) -> Self {
        Self { config }
    }

    pub fn augment<R: Rng>(&self, sample: &mut MultiResolutionSample, rng: &mut R) {
        let horizontal = rng.gen_bool(self.config.horizontal_flip_prob);
        let vertical = rng.gen_bool(self.config.vertical_flip_prob);
        if !horizontal && !vertical {
            return;
        }

        for (band, raster) in sample.bands_mut() {
            let size = band.native_size();
            if horizontal {
                flip_horizontal(raster, size);
            }
            if vertical {
                flip_vertical(raster, size);
            }
        }
    }
}

/// Mirrors a square row-major raster left to right
pub fn flip_horizontal(raster: &mut [f32], size: usize) {
    for row in raster.chunks_exact_mut(size) {
        row.reverse();
    }
}

/// Mirrors a square row-major raster top to bottom
pub fn flip_vertical(raster: &mut [f32], size: usize) {
    for y in 0..size / 2 {
        let (top, bottom) = raster.split_at_mut((size - 1 - y) * size);
        top[y * size..(y + 1) * size].swap_with_slice(&mut bottom[..size]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::test_utils::constant_sample;
    use bigearth_core::{Band, LabelScheme};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_flip_horizontal() {
        let mut raster = vec![1.0, 2.0, 3.0, 4.0];
        flip_horizontal(&mut raster, 2);
        assert_eq!(raster, vec![2.0, 1.0, 4.0, 3.0]);
    }

    #[test]
    fn test_flip_vertical() {
        let mut raster = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        flip_vertical(&mut raster, 3);
        assert_eq!(raster, vec![7.0, 8.0, 9.0, 4.0, 5.0, 6.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_flips_are_consistent_across_bands() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let mut sample = constant_sample("p", 0.0, &scheme);
        // Mark the top-left pixel of every band
        for (_, raster) in sample.bands_mut() {
            raster[0] = 1.0;
        }

        let augmenter = Augmenter::new(FlipConfig {
            horizontal_flip_prob: 1.0,
            vertical_flip_prob: 1.0,
        });
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        augmenter.augment(&mut sample, &mut rng);

        // Both flips move the marker to the bottom-right corner at every resolution
        for band in Band::ALL {
            let raster = sample.band(band);
            assert_eq!(raster[raster.len() - 1], 1.0, "band {band}");
            assert_eq!(raster[0], 0.0, "band {band}");
        }
    }

    #[test]
    fn test_no_flip_keeps_sample() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let original = constant_sample("p", 2.0, &scheme);
        let mut sample = original.clone();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        Augmenter::new(FlipConfig::none()).augment(&mut sample, &mut rng);
        assert_eq!(sample, original);
    }
}
