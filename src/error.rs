use crate::geo::GeoExtent;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[cfg(feature = "onnx")]
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Failed to read tile at {extent}: {reason}")]
    TileRead { extent: GeoExtent, reason: String },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Invalid raster dimensions: {0}x{1}")]
    InvalidDimensions(usize, usize),

    #[error("Pixel size is non-positive: {0}")]
    InvalidPixelSize(f64),

    #[error("Invalid compression type: {0}")]
    InvalidCompression(String),
}

impl ProcessingError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn unsupported_model(msg: impl Into<String>) -> Self {
        Self::UnsupportedModel(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ProcessingError>;
