//! Multi-resolution Sentinel-2 patches.

use std::collections::BTreeMap;

use bigearth_core::{Band, Error, LabelScheme, Result};

/// A single BigEarthNet patch: 12 rasters at their native sizes plus labels.
///
/// Construction validates every band, so a sample that exists always holds a
/// full band set with the expected raster sizes.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiResolutionSample {
    patch_name: String,
    bands: BTreeMap<Band, Vec<f32>>,
    labels: Vec<f32>,
}

impl MultiResolutionSample {
    pub fn new(
        patch_name: impl Into<String>,
        bands: BTreeMap<Band, Vec<f32>>,
        labels: Vec<f32>,
        scheme: &LabelScheme,
    ) -> Result<Self> {
        let patch_name = patch_name.into();

        for band in Band::ALL {
            let raster = bands.get(&band).ok_or_else(|| Error::MissingBand {
                band,
                context: format!("patch '{patch_name}'"),
            })?;
            check_raster_len(band, raster.len())?;
        }

        if labels.len() != scheme.num_classes {
            return Err(Error::Dataset(format!(
                "Patch '{}' has {} labels, expected {} for {}",
                patch_name,
                labels.len(),
                scheme.num_classes,
                scheme.label_type
            )));
        }

        Ok(Self {
            patch_name,
            bands,
            labels,
        })
    }

    pub fn patch_name(&self) -> &str {
        &self.patch_name
    }

    /// Row-major raster of a band at its native size
    pub fn band(&self, band: Band) -> &[f32] {
        // Every band is present after validation in `new`
        self.bands.get(&band).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn labels(&self) -> &[f32] {
        &self.labels
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    /// Indices of the positive labels
    pub fn positive_labels(&self) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, &v)| v >= 0.5)
            .map(|(i, _)| i)
            .collect()
    }

    pub(crate) fn bands_mut(&mut self) -> impl Iterator<Item = (&Band, &mut Vec<f32>)> {
        self.bands.iter_mut()
    }
}

/// Checks that a flat raster has exactly the band's native pixel count
pub fn check_raster_len(band: Band, len: usize) -> Result<()> {
    if len == band.num_pixels() {
        return Ok(());
    }
    let side = (len as f64).sqrt().round() as usize;
    let actual = if side * side == len {
        vec![side, side]
    } else {
        vec![len]
    };
    Err(Error::ShapeMismatch {
        band,
        expected: vec![band.native_size(), band.native_size()],
        actual,
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    fn full_bands() -> BTreeMap<Band, Vec<f32>> {
        Band::ALL
            .iter()
            .map(|&b| (b, vec![0.0; b.num_pixels()]))
            .collect()
    }

    #[test]
    fn test_valid_sample() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let mut labels = vec![0.0; 19];
        labels[3] = 1.0;
        labels[7] = 1.0;
        let sample = MultiResolutionSample::new("S2A_patch", full_bands(), labels, &scheme).unwrap();
        assert_eq!(sample.patch_name(), "S2A_patch");
        assert_eq!(sample.band(Band::B01).len(), 400);
        assert_eq!(sample.positive_labels(), vec![3, 7]);
    }

    #[test]
    fn test_missing_band_is_fatal() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let mut bands = full_bands();
        bands.remove(&Band::B8A);
        let err = MultiResolutionSample::new("p", bands, vec![0.0; 19], &scheme).unwrap_err();
        assert!(matches!(err, Error::MissingBand { band: Band::B8A, .. }));
    }

    #[test]
    fn test_wrong_raster_size_is_fatal() {
        let scheme = LabelScheme::from_label_type("BigEarthNet-19");
        let mut bands = full_bands();
        bands.insert(Band::B05, vec![0.0; 120 * 120]);
        let err = MultiResolutionSample::new("p", bands, vec![0.0; 19], &scheme).unwrap_err();
        match err {
            Error::ShapeMismatch {
                band,
                expected,
                actual,
            } => {
                assert_eq!(band, Band::B05);
                assert_eq!(expected, vec![60, 60]);
                assert_eq!(actual, vec![120, 120]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_label_width_checked() {
        let scheme = LabelScheme::from_label_type("original");
        let err = MultiResolutionSample::new("p", full_bands(), vec![0.0; 19], &scheme).unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
    }
}
