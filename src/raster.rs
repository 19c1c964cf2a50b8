use crate::error::{ProcessingError, Result};
use crate::geo::{GeoExtent, GeoTransform};
use ndarray::{Array3, Axis};

/// Source of georeferenced pixel blocks.
///
/// Implementations resample the requested extent to the requested pixel
/// size and return a `(bands, height, width)` array in the source's band
/// order. Pixels falling outside [`RasterSource::extent`] read as zero.
pub trait RasterSource: Send + Sync {
    fn extent(&self) -> GeoExtent;

    fn band_count(&self) -> usize;

    fn read_block(&self, extent: &GeoExtent, size: (usize, usize)) -> Result<Array3<f32>>;
}

/// Raster band (0-based) feeding each model input channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelsMapping {
    bands: Vec<usize>,
}

impl ChannelsMapping {
    pub fn new(bands: Vec<usize>) -> Self {
        Self { bands }
    }

    /// Model channel `i` reads raster band `i`.
    pub fn default_for_bands(count: usize) -> Self {
        Self {
            bands: (0..count).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn bands(&self) -> &[usize] {
        &self.bands
    }

    pub fn validate_against(&self, band_count: usize) -> Result<()> {
        if let Some(&band) = self.bands.iter().find(|&&b| b >= band_count) {
            return Err(ProcessingError::configuration(format!(
                "channel mapping references band {} but the raster has {} bands",
                band, band_count
            )));
        }
        Ok(())
    }

    /// Reorders `block` bands into model channel order.
    pub fn apply(&self, block: &Array3<f32>) -> Result<Array3<f32>> {
        self.validate_against(block.len_of(Axis(0)))?;
        Ok(block.select(Axis(0), &self.bands))
    }
}

/// Raster held entirely in memory, sampled with nearest neighbour.
#[derive(Debug, Clone)]
pub struct InMemoryRaster {
    data: Array3<f32>,
    transform: GeoTransform,
}

impl InMemoryRaster {
    pub fn new(data: Array3<f32>, transform: GeoTransform) -> Result<Self> {
        let (_, height, width) = data.dim();
        if width == 0 || height == 0 {
            return Err(ProcessingError::InvalidDimensions(width, height));
        }
        if transform.pixel_width() <= 0.0 {
            return Err(ProcessingError::InvalidPixelSize(transform.pixel_width()));
        }
        Ok(Self { data, transform })
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn transform(&self) -> GeoTransform {
        self.transform
    }
}

impl RasterSource for InMemoryRaster {
    fn extent(&self) -> GeoExtent {
        let (_, height, width) = self.data.dim();
        self.transform.extent_of(0, 0, width, height)
    }

    fn band_count(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    fn read_block(&self, extent: &GeoExtent, size: (usize, usize)) -> Result<Array3<f32>> {
        let (out_width, out_height) = size;
        let (bands, height, width) = self.data.dim();
        let step_x = extent.width() / out_width as f64;
        let step_y = extent.height() / out_height as f64;

        let mut block = Array3::<f32>::zeros((bands, out_height, out_width));
        for row in 0..out_height {
            let y = extent.y_max - (row as f64 + 0.5) * step_y;
            for col in 0..out_width {
                let x = extent.x_min + (col as f64 + 0.5) * step_x;
                let (src_col, src_row) = self.transform.geo_to_pixel(x, y);
                if src_col < 0.0 || src_row < 0.0 {
                    continue;
                }
                let (src_col, src_row) = (src_col as usize, src_row as usize);
                if src_col >= width || src_row >= height {
                    continue;
                }
                for band in 0..bands {
                    block[[band, row, col]] = self.data[[band, src_row, src_col]];
                }
            }
        }
        Ok(block)
    }
}
