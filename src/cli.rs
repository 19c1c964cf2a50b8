use crate::error::{ProcessingError, Result};
use crate::geo::GeoExtent;
use crate::model::ModelKind;
use crate::params::{
    ModelOutputFormat, ProcessedAreaType, ProcessingOverlap, ProcessingParameters,
};
use crate::raster::ChannelsMapping;
use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKindArg {
    Segmentation,
    Regression,
    Detection,
}

impl From<ModelKindArg> for ModelKind {
    fn from(kind: ModelKindArg) -> Self {
        match kind {
            ModelKindArg::Segmentation => ModelKind::Segmentation,
            ModelKindArg::Regression => ModelKind::Regression,
            ModelKindArg::Detection => ModelKind::Detection,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "ortho-infer")]
#[command(about = "Run a tiled ONNX model over a georeferenced raster")]
#[command(version)]
pub struct Args {
    /// Input raster path (GeoTIFF orthophoto)
    #[arg(short, long, value_name = "FILE")]
    pub input: String,

    /// ONNX model path
    #[arg(short, long, value_name = "FILE")]
    pub model: String,

    /// Model kind
    #[arg(short, long, value_enum)]
    pub kind: ModelKindArg,

    /// Output GeoTIFF path (multi-band float32); required unless detecting
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<String>,

    /// Processing resolution in cm per pixel
    #[arg(short, long, value_name = "CM", default_value_t = 3.0)]
    pub resolution: f64,

    /// Tile size in pixels (default: model input size)
    #[arg(long, value_name = "PX")]
    pub tile_size: Option<usize>,

    /// Tiles per inference call
    #[arg(short, long, value_name = "N", default_value_t = 1)]
    pub batch_size: usize,

    /// Tile overlap in percent of the tile size
    #[arg(long, value_name = "PERCENT", default_value_t = 15.0, conflicts_with = "overlap_px")]
    pub overlap_percent: f64,

    /// Tile overlap in pixels
    #[arg(long, value_name = "PX")]
    pub overlap_px: Option<usize>,

    /// Comma-separated 1-based input bands in model channel order (default: first N bands)
    #[arg(long, value_name = "BANDS", value_delimiter = ',')]
    pub bands: Option<Vec<usize>>,

    /// Multiply regression outputs by this factor
    #[arg(long, value_name = "FACTOR", default_value_t = 1.0)]
    pub output_scaling: f64,

    /// Write only this model output channel
    #[arg(long, value_name = "CHANNEL")]
    pub single_class: Option<usize>,

    /// Minimum class probability for segmentation
    #[arg(long, value_name = "P", default_value_t = 0.5)]
    pub pixel_threshold: f32,

    /// Minimum detection confidence
    #[arg(long, value_name = "P", default_value_t = 0.5)]
    pub confidence_threshold: f32,

    /// IoU above which overlapping detections are suppressed
    #[arg(long, value_name = "IOU", default_value_t = 0.4)]
    pub iou_threshold: f32,

    /// Process only this extent: x_min,y_min,x_max,y_max in raster CRS units
    #[arg(long, value_name = "EXTENT", value_delimiter = ',', allow_negative_numbers = true, conflicts_with = "mask")]
    pub extent: Option<Vec<f64>>,

    /// Process only non-zero pixels of this mask raster
    #[arg(long, value_name = "FILE")]
    pub mask: Option<String>,

    /// Cache tile outputs for the duration of the run
    #[arg(long)]
    pub local_cache: bool,

    /// Output compression: DEFLATE, LZW, ZSTD, NONE
    #[arg(long, value_name = "TYPE", default_value = "DEFLATE")]
    pub compression: String,

    /// Output GeoTIFF block size in pixels (multiple of 16)
    #[arg(long, value_name = "PX", default_value_t = 512)]
    pub block_size: usize,

    /// Build overviews in the output
    #[arg(long)]
    pub overviews: bool,

    /// Number of threads (default: all available)
    #[arg(short, long, value_name = "N")]
    pub threads: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn processed_area_type(&self) -> ProcessedAreaType {
        if self.mask.is_some() {
            ProcessedAreaType::FromPolygons
        } else if self.extent.is_some() {
            ProcessedAreaType::VisiblePart
        } else {
            ProcessedAreaType::EntireLayer
        }
    }

    pub fn visible_extent(&self) -> Option<GeoExtent> {
        match self.extent.as_deref() {
            Some(&[x_min, y_min, x_max, y_max]) => Some(GeoExtent::new(x_min, y_min, x_max, y_max)),
            _ => None,
        }
    }

    pub fn channels_mapping(&self, model_channels: usize) -> Result<ChannelsMapping> {
        match &self.bands {
            None => Ok(ChannelsMapping::default_for_bands(model_channels)),
            Some(bands) => {
                let zero_based = bands
                    .iter()
                    .map(|&band| {
                        band.checked_sub(1).ok_or_else(|| {
                            ProcessingError::configuration("band numbers start at 1")
                        })
                    })
                    .collect::<Result<Vec<usize>>>()?;
                Ok(ChannelsMapping::new(zero_based))
            }
        }
    }

    /// Maps the options onto processing parameters for a model with the given input.
    pub fn processing_parameters(
        &self,
        model_tile_size: usize,
        model_channels: usize,
    ) -> Result<ProcessingParameters> {
        let overlap = match self.overlap_px {
            Some(px) => ProcessingOverlap::Pixels(px),
            None => ProcessingOverlap::Percent(self.overlap_percent),
        };
        let format = match self.single_class {
            Some(channel) => ModelOutputFormat::SingleClassAsLayer(channel),
            None => ModelOutputFormat::AllClassesAsSeparateLayers,
        };

        let params = ProcessingParameters::new(
            self.tile_size.unwrap_or(model_tile_size),
            self.channels_mapping(model_channels)?,
        )
        .with_resolution_cm_per_px(self.resolution)
        .with_batch_size(self.batch_size)
        .with_local_cache(self.local_cache)
        .with_processed_area_type(self.processed_area_type())
        .with_output_scaling(self.output_scaling)
        .with_overlap(overlap)
        .with_output_format(format)
        .with_pixel_classification_threshold(self.pixel_threshold)
        .with_confidence_threshold(self.confidence_threshold)
        .with_iou_threshold(self.iou_threshold);

        params.validate()?;
        Ok(params)
    }
}
