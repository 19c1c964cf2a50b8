use crate::area::ProcessedArea;
use crate::error::{ProcessingError, Result};
use crate::geo::GeoExtent;
use crate::params::ProcessingOverlap;
use log::debug;

/// One model-sized square window on the processing grid.
#[derive(Debug, Clone, PartialEq)]
pub struct TileWindow {
    /// Position in row-major traversal order.
    pub index: usize,
    pub col: usize,
    pub row: usize,
    pub size: usize,
    // Part of the window inside the raster; smaller than `size` only when the
    // raster itself is smaller than a tile.
    pub valid_width: usize,
    pub valid_height: usize,
    /// Extent of the valid part, used for reading and error reports.
    pub extent: GeoExtent,
}

impl TileWindow {
    pub fn col_end(&self) -> usize {
        self.col + self.valid_width
    }

    pub fn row_end(&self) -> usize {
        self.row + self.valid_height
    }

    pub fn is_padded(&self) -> bool {
        self.valid_width < self.size || self.valid_height < self.size
    }
}

pub struct TilingGrid<'a> {
    area: &'a ProcessedArea,
    tile_size: usize,
    stride: usize,
    // (col, row) of every emitted window, row-major
    origins: Vec<(usize, usize)>,
    pub num_tiles_x: usize,
    pub num_tiles_y: usize,
    pub total_tiles: usize,
}

impl<'a> TilingGrid<'a> {
    pub fn new(
        area: &'a ProcessedArea,
        tile_size: usize,
        overlap: &ProcessingOverlap,
    ) -> Result<Self> {
        if tile_size == 0 {
            return Err(ProcessingError::configuration("tile size must be positive"));
        }
        let stride = overlap.stride_px(tile_size)?;

        let grid = area.grid();
        let (area_col, area_row) = area.offset();
        let (area_height, area_width) = area.dim();

        let xs = axis_positions(area_col, area_width, grid.width, tile_size, stride);
        let ys = axis_positions(area_row, area_height, grid.height, tile_size, stride);

        let mut origins = Vec::with_capacity(xs.len() * ys.len());
        for &row in &ys {
            for &col in &xs {
                if area.intersects(col, row, tile_size, tile_size) {
                    origins.push((col, row));
                }
            }
        }

        let total_tiles = origins.len();
        debug!(
            "TilingGrid: {}x{} area, tile_size={}, stride={} → {}x{} positions, {} tiles to process",
            area_width,
            area_height,
            tile_size,
            stride,
            xs.len(),
            ys.len(),
            total_tiles
        );

        Ok(Self {
            area,
            tile_size,
            stride,
            origins,
            num_tiles_x: xs.len(),
            num_tiles_y: ys.len(),
            total_tiles,
        })
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn iter(&self) -> TileIterator<'_, 'a> {
        TileIterator::new(self)
    }

    pub fn get_window(&self, tile_idx: usize) -> Option<TileWindow> {
        let &(col, row) = self.origins.get(tile_idx)?;
        let grid = self.area.grid();

        let valid_width = self.tile_size.min(grid.width - col);
        let valid_height = self.tile_size.min(grid.height - row);
        let extent = grid.transform.extent_of(col, row, valid_width, valid_height);

        Some(TileWindow {
            index: tile_idx,
            col,
            row,
            size: self.tile_size,
            valid_width,
            valid_height,
            extent,
        })
    }
}

/// Origins along one axis covering `[start, start + len)`.
///
/// Windows advance by `stride`; one that would cross the raster edge is
/// pulled back to end on it. Rasters smaller than a tile get a single window
/// at 0.
fn axis_positions(
    start: usize,
    len: usize,
    raster_len: usize,
    tile_size: usize,
    stride: usize,
) -> Vec<usize> {
    let end = start + len;
    let mut positions: Vec<usize> = Vec::new();
    let mut pos = start;

    loop {
        let placed = if raster_len >= tile_size {
            pos.min(raster_len - tile_size)
        } else {
            0
        };
        if positions.last() != Some(&placed) {
            positions.push(placed);
        }
        if pos + tile_size >= end {
            break;
        }
        pos += stride;
    }

    positions
}

pub struct TileIterator<'g, 'a> {
    grid: &'g TilingGrid<'a>,
    current_idx: usize,
}

impl<'g, 'a> TileIterator<'g, 'a> {
    fn new(grid: &'g TilingGrid<'a>) -> Self {
        Self {
            grid,
            current_idx: 0,
        }
    }
}

impl<'g, 'a> Iterator for TileIterator<'g, 'a> {
    type Item = TileWindow;

    fn next(&mut self) -> Option<Self::Item> {
        let window = self.grid.get_window(self.current_idx)?;
        self.current_idx += 1;
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.grid.total_tiles - self.current_idx;
        (remaining, Some(remaining))
    }
}

impl<'g, 'a> ExactSizeIterator for TileIterator<'g, 'a> {}
