//! Per-band normalisation statistics.

use std::collections::BTreeMap;

use bigearth_core::Band;

use crate::sample::MultiResolutionSample;

/// Per-band mean and standard deviation used to standardise rasters
#[derive(Debug, Clone, PartialEq)]
pub struct BandStatistics {
    pub mean: BTreeMap<Band, f32>,
    pub std: BTreeMap<Band, f32>,
}

impl BandStatistics {
    /// Published statistics of the BigEarthNet archive
    pub fn bigearthnet() -> Self {
        let table: [(Band, f32, f32); 12] = [
            (Band::B01, 340.767_7, 554.812_6),
            (Band::B02, 429.943, 572.416_4),
            (Band::B03, 614.216_8, 582.879_45),
            (Band::B04, 590.235_7, 675.887_5),
            (Band::B05, 950.683_7, 729.898_3),
            (Band::B06, 1792.462_9, 1096.014_8),
            (Band::B07, 2075.468, 1273.453_9),
            (Band::B08, 2218.945_6, 1365.455_9),
            (Band::B8A, 2266.460_4, 1356.137_9),
            (Band::B09, 2246.060_5, 1302.329_3),
            (Band::B11, 1594.426_9, 1079.190_7),
            (Band::B12, 1009.327_3, 818.867_5),
        ];
        Self {
            mean: table.iter().map(|&(b, m, _)| (b, m)).collect(),
            std: table.iter().map(|&(b, _, s)| (b, s)).collect(),
        }
    }

    /// Standardises every band of a sample in place
    pub fn normalize(&self, sample: &mut MultiResolutionSample) {
        for (band, raster) in sample.bands_mut() {
            let mean = self.mean.get(band).copied().unwrap_or(0.0);
            let std = self.std.get(band).copied().unwrap_or(1.0);
            let std = if std > f32::EPSILON { std } else { 1.0 };
            raster.iter_mut().for_each(|v| *v = (*v - mean) / std);
        }
    }
}

impl Default for BandStatistics {
    fn default() -> Self {
        Self::bigearthnet()
    }
}
