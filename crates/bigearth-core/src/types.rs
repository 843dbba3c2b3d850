//! Core type definitions for Sentinel-2 bands, label schemes and models.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Number of channels in the fused input tensor
pub const FUSED_CHANNELS: usize = 12;

/// Spatial size (height and width) of the fused input tensor
pub const FUSED_SIZE: usize = 120;

/// A Sentinel-2 spectral band
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Band {
    B01,
    B02,
    B03,
    B04,
    B05,
    B06,
    B07,
    B08,
    B8A,
    B09,
    B11,
    B12,
}

impl Band {
    /// All bands in acquisition order
    pub const ALL: [Band; 12] = [
        Band::B01,
        Band::B02,
        Band::B03,
        Band::B04,
        Band::B05,
        Band::B06,
        Band::B07,
        Band::B08,
        Band::B8A,
        Band::B09,
        Band::B11,
        Band::B12,
    ];

    /// Band key as it appears in dataset records
    pub fn name(&self) -> &'static str {
        match self {
            Band::B01 => "B01",
            Band::B02 => "B02",
            Band::B03 => "B03",
            Band::B04 => "B04",
            Band::B05 => "B05",
            Band::B06 => "B06",
            Band::B07 => "B07",
            Band::B08 => "B08",
            Band::B8A => "B8A",
            Band::B09 => "B09",
            Band::B11 => "B11",
            Band::B12 => "B12",
        }
    }

    /// Resolution group this band belongs to
    pub fn group(&self) -> BandGroup {
        match self {
            Band::B02 | Band::B03 | Band::B04 | Band::B08 => BandGroup::TenMeter,
            Band::B05 | Band::B06 | Band::B07 | Band::B8A | Band::B11 | Band::B12 => {
                BandGroup::TwentyMeter
            }
            Band::B01 | Band::B09 => BandGroup::SixtyMeter,
        }
    }

    /// Native raster side length in pixels
    pub fn native_size(&self) -> usize {
        self.group().native_size()
    }

    /// Number of pixels in a native raster
    pub fn num_pixels(&self) -> usize {
        let size = self.native_size();
        size * size
    }
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Band {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Band::ALL
            .iter()
            .copied()
            .find(|band| band.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidArgument(format!("Unknown band '{s}'")))
    }
}

/// Bands sharing a native ground resolution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BandGroup {
    /// 10 m bands, 120x120 pixels
    TenMeter,
    /// 20 m bands, 60x60 pixels
    TwentyMeter,
    /// 60 m bands, 20x20 pixels
    SixtyMeter,
}

impl BandGroup {
    /// Groups in fused channel order
    pub const FUSION_ORDER: [BandGroup; 3] = [
        BandGroup::TenMeter,
        BandGroup::TwentyMeter,
        BandGroup::SixtyMeter,
    ];

    /// Bands of this group in fused channel order
    pub fn bands(&self) -> &'static [Band] {
        match self {
            BandGroup::TenMeter => &[Band::B04, Band::B03, Band::B02, Band::B08],
            BandGroup::TwentyMeter => &[
                Band::B05,
                Band::B06,
                Band::B07,
                Band::B8A,
                Band::B11,
                Band::B12,
            ],
            BandGroup::SixtyMeter => &[Band::B01, Band::B09],
        }
    }

    pub fn native_size(&self) -> usize {
        match self {
            BandGroup::TenMeter => 120,
            BandGroup::TwentyMeter => 60,
            BandGroup::SixtyMeter => 20,
        }
    }
}

impl std::fmt::Display for BandGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BandGroup::TenMeter => write!(f, "10m"),
            BandGroup::TwentyMeter => write!(f, "20m"),
            BandGroup::SixtyMeter => write!(f, "60m"),
        }
    }
}

/// Fixed channel order of the fused tensor. Part of the checkpoint contract.
pub fn fused_band_order() -> Vec<Band> {
    BandGroup::FUSION_ORDER
        .iter()
        .flat_map(|group| group.bands().iter().copied())
        .collect()
}

/// Label nomenclature used by a dataset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelScheme {
    /// Label type name, e.g. "BigEarthNet-19"
    pub label_type: String,
    /// Width of the multi-hot label vector
    pub num_classes: usize,
}

impl LabelScheme {
    /// Resolves a label type name. "BigEarthNet-19" has 19 classes, anything else 43.
    pub fn from_label_type(label_type: impl Into<String>) -> Self {
        let label_type = label_type.into();
        let num_classes = if label_type == "BigEarthNet-19" { 19 } else { 43 };
        Self {
            label_type,
            num_classes,
        }
    }

    /// Record field holding the multi-hot label vector
    pub fn field_name(&self) -> String {
        format!("{}_labels_multi_hot", self.label_type)
    }
}

/// Data split type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataSplit {
    /// Training data
    Train,
    /// Validation data
    Validation,
    /// Test data
    Test,
}

impl std::fmt::Display for DataSplit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSplit::Train => write!(f, "train"),
            DataSplit::Validation => write!(f, "validation"),
            DataSplit::Test => write!(f, "test"),
        }
    }
}

/// Model architecture registry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// Flatten followed by fully connected layers
    Dense,
    /// ResNet-18 with a 12 to 3 channel reducer
    ResNet18,
    /// EfficientNet-B0 with a 12-channel stem
    EfficientNetB0,
}

impl ModelArchitecture {
    pub const ALL: [ModelArchitecture; 3] = [
        ModelArchitecture::Dense,
        ModelArchitecture::ResNet18,
        ModelArchitecture::EfficientNetB0,
    ];

    /// Architecture substituted for unknown names when fallback is enabled
    pub const DEFAULT: ModelArchitecture = ModelArchitecture::Dense;

    pub fn name(&self) -> &'static str {
        match self {
            ModelArchitecture::Dense => "Dense",
            ModelArchitecture::ResNet18 => "ResNet18",
            ModelArchitecture::EfficientNetB0 => "EfficientNetB0",
        }
    }

    /// Parses a model name, optionally substituting the default for unknown names.
    pub fn resolve(name: &str, fallback_to_default: bool) -> Result<Self> {
        match name.parse::<ModelArchitecture>() {
            Ok(arch) => Ok(arch),
            Err(Error::UnknownModel(_)) if fallback_to_default => {
                tracing::warn!(
                    "Unknown model '{}', falling back to {}",
                    name,
                    Self::DEFAULT
                );
                Ok(Self::DEFAULT)
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Display for ModelArchitecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ModelArchitecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "dense" => Ok(ModelArchitecture::Dense),
            "resnet18" => Ok(ModelArchitecture::ResNet18),
            "efficientnetb0" => Ok(ModelArchitecture::EfficientNetB0),
            _ => Err(Error::UnknownModel(s.to_string())),
        }
    }
}
