use crate::error::{ProcessingError, Result};
use crate::raster::ChannelsMapping;
use log::debug;

/// How much adjacent tiles overlap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessingOverlap {
    /// Percentage of the tile size, truncated to whole pixels.
    Percent(f64),
    /// Fixed number of pixels.
    Pixels(usize),
}

impl ProcessingOverlap {
    pub fn overlap_px(&self, tile_size_px: usize) -> Result<usize> {
        match *self {
            ProcessingOverlap::Percent(percent) => {
                if !percent.is_finite() || percent < 0.0 {
                    return Err(ProcessingError::configuration(format!(
                        "overlap percentage must be a non-negative number, got {}",
                        percent
                    )));
                }
                Ok((tile_size_px as f64 * percent / 100.0) as usize)
            }
            ProcessingOverlap::Pixels(px) => Ok(px),
        }
    }

    /// Distance between consecutive tile origins. Always at least one pixel.
    pub fn stride_px(&self, tile_size_px: usize) -> Result<usize> {
        let overlap = self.overlap_px(tile_size_px)?;
        if overlap >= tile_size_px {
            return Err(ProcessingError::configuration(format!(
                "overlap of {} px leaves no stride for {} px tiles",
                overlap, tile_size_px
            )));
        }
        Ok(tile_size_px - overlap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessedAreaType {
    EntireLayer,
    FromPolygons,
    VisiblePart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelOutputFormat {
    AllClassesAsSeparateLayers,
    /// Only the given output channel is returned.
    SingleClassAsLayer(usize),
}

impl ModelOutputFormat {
    /// Output channel indices to emit for a model with `channels` outputs.
    pub fn selected_channels(&self, channels: usize) -> Result<Vec<usize>> {
        match *self {
            ModelOutputFormat::AllClassesAsSeparateLayers => Ok((0..channels).collect()),
            ModelOutputFormat::SingleClassAsLayer(class) if class < channels => Ok(vec![class]),
            ModelOutputFormat::SingleClassAsLayer(class) => Err(ProcessingError::configuration(
                format!(
                    "selected class {} does not exist, model has {} output channels",
                    class, channels
                ),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessingParameters {
    pub resolution_cm_per_px: f64,
    pub tile_size_px: usize,
    pub batch_size: usize,
    pub local_cache: bool,
    pub processed_area_type: ProcessedAreaType,
    pub input_channels_mapping: ChannelsMapping,
    pub output_scaling: f64,
    pub processing_overlap: ProcessingOverlap,
    pub model_output_format: ModelOutputFormat,
    /// Segmentation: minimum winning probability for a pixel to be classified.
    pub pixel_classification_threshold: f32,
    /// Detection: minimum `objectness * class score` for a box to be kept.
    pub confidence_threshold: f32,
    /// Detection: IoU above which overlapping boxes of one class are suppressed.
    pub iou_threshold: f32,
}

impl ProcessingParameters {
    pub fn new(tile_size_px: usize, input_channels_mapping: ChannelsMapping) -> Self {
        Self {
            resolution_cm_per_px: 3.0,
            tile_size_px,
            batch_size: 1,
            local_cache: false,
            processed_area_type: ProcessedAreaType::EntireLayer,
            input_channels_mapping,
            output_scaling: 1.0,
            processing_overlap: ProcessingOverlap::Percent(15.0),
            model_output_format: ModelOutputFormat::AllClassesAsSeparateLayers,
            pixel_classification_threshold: 0.5,
            confidence_threshold: 0.5,
            iou_threshold: 0.4,
        }
    }

    pub fn with_resolution_cm_per_px(mut self, resolution: f64) -> Self {
        self.resolution_cm_per_px = resolution;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_local_cache(mut self, enabled: bool) -> Self {
        self.local_cache = enabled;
        self
    }

    pub fn with_processed_area_type(mut self, area_type: ProcessedAreaType) -> Self {
        self.processed_area_type = area_type;
        self
    }

    pub fn with_output_scaling(mut self, scaling: f64) -> Self {
        self.output_scaling = scaling;
        self
    }

    pub fn with_overlap(mut self, overlap: ProcessingOverlap) -> Self {
        self.processing_overlap = overlap;
        self
    }

    pub fn with_output_format(mut self, format: ModelOutputFormat) -> Self {
        self.model_output_format = format;
        self
    }

    pub fn with_pixel_classification_threshold(mut self, threshold: f32) -> Self {
        self.pixel_classification_threshold = threshold;
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    /// Processing resolution in map units (meters) per pixel.
    pub fn resolution_m_per_px(&self) -> f64 {
        self.resolution_cm_per_px / 100.0
    }

    pub fn stride_px(&self) -> Result<usize> {
        self.processing_overlap.stride_px(self.tile_size_px)
    }

    /// Checks everything that can be checked without the model or raster.
    pub fn validate(&self) -> Result<()> {
        if self.tile_size_px == 0 {
            return Err(ProcessingError::configuration("tile size must be positive"));
        }
        if self.batch_size == 0 {
            return Err(ProcessingError::configuration("batch size must be positive"));
        }
        if !self.resolution_cm_per_px.is_finite() || self.resolution_cm_per_px <= 0.0 {
            return Err(ProcessingError::configuration(format!(
                "resolution must be positive, got {} cm/px",
                self.resolution_cm_per_px
            )));
        }
        if !self.output_scaling.is_finite() {
            return Err(ProcessingError::configuration("output scaling must be finite"));
        }
        if self.input_channels_mapping.is_empty() {
            return Err(ProcessingError::configuration(
                "input channels mapping must select at least one band",
            ));
        }
        for (name, value) in [
            ("pixel classification threshold", self.pixel_classification_threshold),
            ("confidence threshold", self.confidence_threshold),
            ("IoU threshold", self.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ProcessingError::configuration(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        let stride = self.stride_px()?;
        debug!(
            "Parameters: tile={}px stride={}px batch={} resolution={}cm/px cache={}",
            self.tile_size_px, stride, self.batch_size, self.resolution_cm_per_px, self.local_cache
        );
        Ok(())
    }
}
