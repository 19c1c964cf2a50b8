use crate::error::{ProcessingError, Result};
use gdal::Dataset;
use log::{debug, info};

/// Validate compression type
pub fn validate_compression(compression: &str) -> Result<()> {
    let valid_types = ["DEFLATE", "LZW", "ZSTD", "NONE"];
    if !valid_types.contains(&compression) {
        return Err(ProcessingError::InvalidCompression(compression.to_string()));
    }
    Ok(())
}

/// Validate output block size (must be multiple of 16)
pub fn validate_block_size(block_size: usize) -> Result<()> {
    if block_size == 0 || block_size % 16 != 0 {
        return Err(ProcessingError::configuration(format!(
            "output block size must be a positive multiple of 16, got {}",
            block_size
        )));
    }
    Ok(())
}

/// Creation options for a tiled, compressed GeoTIFF
pub fn create_dataset_options(compression: &str, block_size: usize) -> Vec<String> {
    vec![
        format!("COMPRESS={}", compression),
        "TILED=YES".to_string(),
        format!("BLOCKXSIZE={}", block_size),
        format!("BLOCKYSIZE={}", block_size),
        "BIGTIFF=IF_SAFER".to_string(),
    ]
}

/// Overview factors, powers of 2 until the smaller side drops below 256 px
pub fn overview_levels(width: usize, height: usize) -> Vec<i32> {
    let min_dim = width.min(height);
    let mut levels = Vec::new();
    let mut level = 2;
    while min_dim / level >= 256 {
        levels.push(level as i32);
        level *= 2;
    }
    levels
}

/// Build internal overviews so result layers display quickly in GIS viewers
pub fn build_overviews(dataset: &mut Dataset) -> Result<()> {
    let (width, height) = dataset.raster_size();
    let levels = overview_levels(width, height);

    if levels.is_empty() {
        debug!("Raster too small for overviews ({}x{}), skipping", width, height);
        return Ok(());
    }

    info!("Creating {} overview levels: {:?}", levels.len(), levels);
    // Empty bands list means build for all bands
    dataset.build_overviews("AVERAGE", &levels, &[])?;
    Ok(())
}
