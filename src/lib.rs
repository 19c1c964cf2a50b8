// Library exports for embedding and testing

pub mod area;
pub mod cache;
pub mod cli;
#[cfg(feature = "gdal")]
pub mod cog;
#[cfg(feature = "gdal")]
pub mod crs;
pub mod error;
pub mod geo;
#[cfg(feature = "gdal")]
pub mod io;
pub mod model;
pub mod params;
pub mod processor;
pub mod raster;
pub mod reassembly;
pub mod scheduler;
pub mod tiling;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use area::ProcessedArea;
pub use cache::TileCache;
pub use error::{ProcessingError, Result};
pub use geo::{GeoExtent, GeoTransform};
pub use model::{Model, ModelKind, ModelRuntime};
pub use params::{ModelOutputFormat, ProcessedAreaType, ProcessingOverlap, ProcessingParameters};
pub use processor::{CancellationToken, MapProcessor, ProcessingOutcome, ProcessorState};
pub use raster::{ChannelsMapping, InMemoryRaster, RasterSource};
pub use tiling::{TileWindow, TilingGrid};
