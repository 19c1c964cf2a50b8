use crate::area::ProcessingGrid;
use crate::error::{ProcessingError, Result};
use crate::geo::{GeoExtent, GeoTransform};
use crate::raster::RasterSource;
use gdal::cpl::CslStringList;
use gdal::raster::{Buffer, ResampleAlg};
use gdal::{Dataset, DriverManager, Metadata};
use log::{debug, info};
use ndarray::{s, Array2, Array3};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RasterMetadata {
    pub width: usize,
    pub height: usize,
    pub band_count: usize,
    pub geotransform: GeoTransform,
    pub projection: String,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

/// Extract metadata from a dataset without reading any pixels
pub fn extract_metadata_from_dataset(dataset: &Dataset) -> Result<RasterMetadata> {
    let (width, height) = dataset.raster_size();
    if width == 0 || height == 0 {
        return Err(ProcessingError::InvalidDimensions(width, height));
    }

    let geotransform = dataset.geo_transform()?;
    let pixel_width = geotransform[1].abs();
    let pixel_height = geotransform[5].abs();
    if pixel_width <= 0.0 {
        return Err(ProcessingError::InvalidPixelSize(pixel_width));
    }
    if geotransform[2] != 0.0 || geotransform[4] != 0.0 {
        return Err(ProcessingError::configuration(
            "rotated rasters are not supported, warp the input to a north-up grid first",
        ));
    }

    Ok(RasterMetadata {
        width,
        height,
        band_count: dataset.raster_count(),
        geotransform: GeoTransform(geotransform),
        projection: dataset.projection(),
        pixel_width,
        pixel_height,
    })
}

/// GeoTIFF (or any GDAL-readable raster) opened lazily per read.
///
/// GDAL datasets cannot be shared between threads, so every block read opens
/// its own handle and parallel tile reads stay independent.
#[derive(Debug, Clone)]
pub struct GdalRaster {
    path: PathBuf,
    metadata: RasterMetadata,
}

impl GdalRaster {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening input raster: {}", path.display());
        let dataset = Dataset::open(&path)?;
        let metadata = extract_metadata_from_dataset(&dataset)?;

        debug!("Raster dimensions: {}x{}", metadata.width, metadata.height);
        debug!(
            "Pixel size: {:.6} x {:.6}",
            metadata.pixel_width, metadata.pixel_height
        );
        Ok(Self { path, metadata })
    }

    pub fn metadata(&self) -> &RasterMetadata {
        &self.metadata
    }
}

impl RasterSource for GdalRaster {
    fn extent(&self) -> GeoExtent {
        self.metadata
            .geotransform
            .extent_of(0, 0, self.metadata.width, self.metadata.height)
    }

    fn band_count(&self) -> usize {
        self.metadata.band_count
    }

    fn read_block(&self, extent: &GeoExtent, size: (usize, usize)) -> Result<Array3<f32>> {
        let (width, height) = size;
        let mut block = Array3::<f32>::zeros((self.metadata.band_count, height, width));
        let raster_size = (self.metadata.width, self.metadata.height);
        let Some(window) = self
            .metadata
            .geotransform
            .block_window(raster_size, extent, size)
        else {
            return Ok(block);
        };
        let (x_off, y_off, win_w, win_h) = window.source;
        let (dst_x, dst_y, dst_w, dst_h) = window.target;

        let dataset = Dataset::open(&self.path)?;
        for band_index in 1..=self.metadata.band_count {
            let rasterband = dataset.rasterband(band_index)?;
            let buffer = rasterband.read_as::<f32>(
                (x_off as isize, y_off as isize),
                (win_w, win_h),
                (dst_w, dst_h),
                Some(ResampleAlg::NearestNeighbour),
            )?;
            let data_vec: Vec<f32> = buffer.into_iter().collect();
            let band = Array2::from_shape_vec((dst_h, dst_w), data_vec)?;
            // Pixels outside the raster stay zero
            block
                .slice_mut(s![band_index - 1, dst_y..dst_y + dst_h, dst_x..dst_x + dst_w])
                .assign(&band);
        }

        Ok(block)
    }
}

/// Reads a mask raster onto the processing grid; non-zero pixels are processed.
pub fn read_mask_on_grid(path: impl AsRef<Path>, grid: &ProcessingGrid) -> Result<Array2<bool>> {
    let mask_raster = GdalRaster::open(path)?;
    let extent = grid.transform.extent_of(0, 0, grid.width, grid.height);
    let block = mask_raster.read_block(&extent, (grid.width, grid.height))?;
    let mask = block.slice(s![0, .., ..]).mapv(|v| v != 0.0);
    debug!(
        "Mask covers {} of {} grid pixels",
        mask.iter().filter(|&&inside| inside).count(),
        mask.len()
    );
    Ok(mask)
}

/// Create an output dataset with the given creation options
pub fn create_output_dataset(
    path: &str,
    width: usize,
    height: usize,
    num_bands: usize,
    options: Vec<String>,
) -> Result<Dataset> {
    info!("Creating output dataset: {}", path);

    let driver = DriverManager::get_driver_by_name("GTiff")?;

    let dataset = if options.is_empty() {
        driver.create_with_band_type::<f32, _>(path, width, height, num_bands)?
    } else {
        let mut gdal_options = CslStringList::new();
        for opt in options {
            gdal_options.add_string(&opt)?;
        }

        driver.create_with_band_type_with_options::<f32, _>(
            path,
            width,
            height,
            num_bands,
            &gdal_options,
        )?
    };

    Ok(dataset)
}

/// Write result layers as a multi-band float32 GeoTIFF
pub fn write_multiband_output(
    path: &str,
    layers: &[Array2<f32>],
    channels: &[usize],
    transform: &GeoTransform,
    projection: &str,
    options: Vec<String>,
) -> Result<Dataset> {
    let (height, width) = layers
        .first()
        .map(|layer| layer.dim())
        .ok_or_else(|| ProcessingError::configuration("no result layers to write"))?;

    let mut dataset = create_output_dataset(path, width, height, layers.len(), options)?;
    dataset.set_geo_transform(&transform.0)?;
    dataset.set_projection(projection)?;

    for (i, (layer, &channel)) in layers.iter().zip(channels).enumerate() {
        let band_index = i + 1;
        debug!("Writing band {} for model channel {}", band_index, channel);

        let mut raster_band = dataset.rasterband(band_index)?;
        // Row-major iteration matches GDAL's buffer layout
        let values: Vec<f32> = layer.iter().copied().collect();
        let mut buffer = Buffer::new((width, height), values);
        raster_band.write((0, 0), (width, height), &mut buffer)?;

        raster_band.set_description(&format!("channel_{:02}", channel))?;
        raster_band.set_no_data_value(Some(f64::NAN))?;
    }

    info!("Successfully wrote {} bands to {}", layers.len(), path);
    Ok(dataset)
}
