//! Multi-resolution band fusion.
//!
//! The 20 m and 60 m band groups are bicubically resampled onto the 120x120
//! grid of the 10 m bands, then all 12 bands are concatenated along the
//! channel axis in the fixed order:
//!
//! `[B04 B03 B02 B08][B05 B06 B07 B8A B11 B12][B01 B09]`

use bigearth_core::{BandGroup, Error, Result, FUSED_SIZE};
use bigearth_dataset::BandTensors;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::tensor::{backend::Backend, Tensor};
use tracing::info;

/// Fuses native-resolution bands into a `[batch, 12, 120, 120]` tensor
pub fn fuse<B: Backend>(bands: &BandTensors<B>) -> Result<Tensor<B, 4>> {
    let mut batch_size: Option<usize> = None;
    let mut groups = Vec::with_capacity(BandGroup::FUSION_ORDER.len());

    for group in BandGroup::FUSION_ORDER {
        let size = group.native_size();
        let mut channels = Vec::with_capacity(group.bands().len());

        for &band in group.bands() {
            let tensor = bands.get(band)?;
            let [n, h, w] = tensor.dims();
            if h != size || w != size {
                return Err(Error::ShapeMismatch {
                    band,
                    expected: vec![size, size],
                    actual: vec![h, w],
                });
            }
            match batch_size {
                Some(expected) if expected != n => {
                    return Err(Error::ShapeMismatch {
                        band,
                        expected: vec![expected, size, size],
                        actual: vec![n, h, w],
                    });
                }
                Some(_) => {}
                None => batch_size = Some(n),
            }
            channels.push(tensor);
        }

        let stacked: Tensor<B, 4> = Tensor::stack(channels, 1);
        let resized = if size == FUSED_SIZE {
            stacked
        } else {
            interpolate(
                stacked,
                [FUSED_SIZE, FUSED_SIZE],
                InterpolateOptions::new(InterpolateMode::Bicubic),
            )
        };
        groups.push(resized);
    }

    Ok(Tensor::cat(groups, 1))
}

/// One stage of the fusion pipeline, for logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionStage {
    pub group: BandGroup,
    pub channels: usize,
    pub input_size: usize,
    pub output_size: usize,
}

/// Static description of the fusion pipeline
#[derive(Debug, Clone)]
pub struct FusionPlan {
    pub stages: Vec<FusionStage>,
}

impl FusionPlan {
    pub fn new() -> Self {
        let stages = BandGroup::FUSION_ORDER
            .iter()
            .map(|&group| FusionStage {
                group,
                channels: group.bands().len(),
                input_size: group.native_size(),
                output_size: FUSED_SIZE,
            })
            .collect();
        Self { stages }
    }

    pub fn output_channels(&self) -> usize {
        self.stages.iter().map(|s| s.channels).sum()
    }

    /// Logs the shape of every fusion stage
    pub fn log_summary(&self) {
        for stage in &self.stages {
            let bands: Vec<&str> = stage.group.bands().iter().map(|b| b.name()).collect();
            info!(
                "  fusion {:>3}: {} bands [{}] {}x{} -> {}x{}",
                stage.group.to_string(),
                stage.channels,
                bands.join(" "),
                stage.input_size,
                stage.input_size,
                stage.output_size,
                stage.output_size
            );
        }
        info!(
            "  fused input: [batch, {}, {}, {}]",
            self.output_channels(),
            FUSED_SIZE,
            FUSED_SIZE
        );
    }
}

impl Default for FusionPlan {
    fn default() -> Self {
        Self::new()
    }
}
