use crate::error::{ProcessingError, Result};
use crate::geo::{GeoExtent, GeoTransform};
use crate::params::ProcessedAreaType;
use crate::raster::RasterSource;
use log::debug;
use ndarray::{s, Array2};

/// The whole raster resampled to the processing resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessingGrid {
    pub transform: GeoTransform,
    pub width: usize,
    pub height: usize,
}

impl ProcessingGrid {
    pub fn for_source(source: &dyn RasterSource, resolution_m_per_px: f64) -> Result<Self> {
        if !resolution_m_per_px.is_finite() || resolution_m_per_px <= 0.0 {
            return Err(ProcessingError::InvalidPixelSize(resolution_m_per_px));
        }
        let extent = source.extent();
        let width = (extent.width() / resolution_m_per_px).round() as usize;
        let height = (extent.height() / resolution_m_per_px).round() as usize;
        if width == 0 || height == 0 {
            return Err(ProcessingError::InvalidDimensions(width, height));
        }

        let transform = GeoTransform::north_up(extent.x_min, extent.y_max, resolution_m_per_px);
        Ok(Self {
            transform,
            width,
            height,
        })
    }

    /// Pixel rectangle `(col, row, width, height)` covering `extent`, clipped
    /// to the grid.
    fn pixel_bounds_of(&self, extent: &GeoExtent) -> Option<(usize, usize, usize, usize)> {
        let (c0, r0) = self.transform.geo_to_pixel(extent.x_min, extent.y_max);
        let (c1, r1) = self.transform.geo_to_pixel(extent.x_max, extent.y_min);

        let col_min = c0.floor().max(0.0) as usize;
        let row_min = r0.floor().max(0.0) as usize;
        let col_max = (c1.ceil().max(0.0) as usize).min(self.width);
        let row_max = (r1.ceil().max(0.0) as usize).min(self.height);

        if col_max <= col_min || row_max <= row_min {
            None
        } else {
            Some((col_min, row_min, col_max - col_min, row_max - row_min))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedArea {
    area_type: ProcessedAreaType,
    grid: ProcessingGrid,
    col: usize,
    row: usize,
    width: usize,
    height: usize,
    /// `true` where pixels are processed, shaped `(height, width)`.
    mask: Option<Array2<bool>>,
}

impl ProcessedArea {
    pub fn entire_layer(source: &dyn RasterSource, resolution_m_per_px: f64) -> Result<Self> {
        let grid = ProcessingGrid::for_source(source, resolution_m_per_px)?;
        debug!("Processed area: entire layer {}x{} px", grid.width, grid.height);
        Ok(Self {
            area_type: ProcessedAreaType::EntireLayer,
            grid,
            col: 0,
            row: 0,
            width: grid.width,
            height: grid.height,
            mask: None,
        })
    }

    /// Part of the raster inside `visible_extent` (e.g. the current map view).
    pub fn visible_part(
        source: &dyn RasterSource,
        resolution_m_per_px: f64,
        visible_extent: &GeoExtent,
    ) -> Result<Self> {
        let grid = ProcessingGrid::for_source(source, resolution_m_per_px)?;
        let (col, row, width, height) = grid.pixel_bounds_of(visible_extent).ok_or_else(|| {
            ProcessingError::configuration(format!(
                "visible extent {} does not intersect the raster",
                visible_extent
            ))
        })?;
        debug!(
            "Processed area: visible part at ({}, {}) {}x{} px",
            col, row, width, height
        );
        Ok(Self {
            area_type: ProcessedAreaType::VisiblePart,
            grid,
            col,
            row,
            width,
            height,
            mask: None,
        })
    }

    /// Area described by a rasterised polygon mask on the processing grid.
    pub fn from_polygons(
        source: &dyn RasterSource,
        resolution_m_per_px: f64,
        grid_mask: &Array2<bool>,
    ) -> Result<Self> {
        let grid = ProcessingGrid::for_source(source, resolution_m_per_px)?;
        if grid_mask.dim() != (grid.height, grid.width) {
            return Err(ProcessingError::configuration(format!(
                "polygon mask is {:?} but the processing grid is ({}, {})",
                grid_mask.dim(),
                grid.height,
                grid.width
            )));
        }

        let mut bounds: Option<(usize, usize, usize, usize)> = None;
        for ((r, c), &inside) in grid_mask.indexed_iter() {
            if !inside {
                continue;
            }
            bounds = Some(match bounds {
                None => (c, r, c, r),
                Some((c0, r0, c1, r1)) => (c0.min(c), r0.min(r), c1.max(c), r1.max(r)),
            });
        }
        let (c0, r0, c1, r1) = bounds.ok_or_else(|| {
            ProcessingError::configuration("polygon mask does not cover any raster pixel")
        })?;

        let mask = grid_mask.slice(s![r0..=r1, c0..=c1]).to_owned();
        debug!(
            "Processed area: polygons bounding ({}, {}) {}x{} px",
            c0,
            r0,
            c1 - c0 + 1,
            r1 - r0 + 1
        );
        Ok(Self {
            area_type: ProcessedAreaType::FromPolygons,
            grid,
            col: c0,
            row: r0,
            width: c1 - c0 + 1,
            height: r1 - r0 + 1,
            mask: Some(mask),
        })
    }

    pub fn area_type(&self) -> ProcessedAreaType {
        self.area_type
    }

    pub fn grid(&self) -> &ProcessingGrid {
        &self.grid
    }

    /// Top-left pixel of the area on the processing grid.
    pub fn offset(&self) -> (usize, usize) {
        (self.col, self.row)
    }

    /// `(height, width)` in pixels, matching the result array shape.
    pub fn dim(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn mask(&self) -> Option<&Array2<bool>> {
        self.mask.as_ref()
    }

    /// Georeferencing of the result arrays.
    pub fn transform(&self) -> GeoTransform {
        self.grid.transform.shifted(self.col, self.row)
    }

    pub fn extent(&self) -> GeoExtent {
        self.grid
            .transform
            .extent_of(self.col, self.row, self.width, self.height)
    }

    /// Whether the area-relative pixel is processed.
    pub fn is_inside(&self, row: usize, col: usize) -> bool {
        if row >= self.height || col >= self.width {
            return false;
        }
        self.mask.as_ref().map_or(true, |m| m[[row, col]])
    }

    /// Whether a grid-space rectangle touches at least one processed pixel.
    pub fn intersects(&self, col: usize, row: usize, width: usize, height: usize) -> bool {
        let c0 = col.max(self.col);
        let r0 = row.max(self.row);
        let c1 = (col + width).min(self.col + self.width);
        let r1 = (row + height).min(self.row + self.height);
        if c1 <= c0 || r1 <= r0 {
            return false;
        }

        match &self.mask {
            None => true,
            Some(mask) => mask
                .slice(s![r0 - self.row..r1 - self.row, c0 - self.col..c1 - self.col])
                .iter()
                .any(|&inside| inside),
        }
    }
}
