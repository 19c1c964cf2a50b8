use std::fmt;

/// Axis-aligned rectangle in map units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoExtent {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl GeoExtent {
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        Self {
            x_min: x_min.min(x_max),
            y_min: y_min.min(y_max),
            x_max: x_max.max(x_min),
            y_max: y_max.max(y_min),
        }
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

}

impl fmt::Display for GeoExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.3}, {:.3}] - [{:.3}, {:.3}]",
            self.x_min, self.y_min, self.x_max, self.y_max
        )
    }
}

/// GDAL-ordered affine transform: `[x0, pixel_width, row_rotation, y0,
/// column_rotation, pixel_height]`, `pixel_height` negative for north-up
/// rasters. Rotation terms are carried through but never interpreted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    /// North-up transform with square pixels anchored at the top-left corner.
    pub fn north_up(x_origin: f64, y_origin: f64, pixel_size: f64) -> Self {
        Self([x_origin, pixel_size, 0.0, y_origin, 0.0, -pixel_size])
    }

    pub fn origin(&self) -> (f64, f64) {
        (self.0[0], self.0[3])
    }

    pub fn pixel_width(&self) -> f64 {
        self.0[1].abs()
    }

    /// Map coordinates of a (possibly fractional) pixel corner.
    pub fn pixel_to_geo(&self, col: f64, row: f64) -> (f64, f64) {
        let t = &self.0;
        (
            t[0] + col * t[1] + row * t[2],
            t[3] + col * t[4] + row * t[5],
        )
    }

    /// Fractional pixel position of a map coordinate (rotation ignored).
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let t = &self.0;
        ((x - t[0]) / t[1], (y - t[3]) / t[5])
    }

    /// Extent covered by a pixel rectangle.
    pub fn extent_of(&self, col: usize, row: usize, width: usize, height: usize) -> GeoExtent {
        let (x0, y0) = self.pixel_to_geo(col as f64, row as f64);
        let (x1, y1) = self.pixel_to_geo((col + width) as f64, (row + height) as f64);
        GeoExtent::new(x0, y0, x1, y1)
    }

    /// Transform of a sub-grid starting at the given pixel offset.
    pub fn shifted(&self, col: usize, row: usize) -> GeoTransform {
        let (x, y) = self.pixel_to_geo(col as f64, row as f64);
        let mut t = self.0;
        t[0] = x;
        t[3] = y;
        GeoTransform(t)
    }

    /// Where a read of `extent` into a `size` buffer lands on a raster of
    /// `raster_size` pixels with this transform.
    ///
    /// The part of the extent outside the raster is cut away on both sides:
    /// the source window covers only raster pixels and the target window is
    /// the matching sub-rectangle of the buffer, so nothing gets stretched.
    pub fn block_window(
        &self,
        raster_size: (usize, usize),
        extent: &GeoExtent,
        size: (usize, usize),
    ) -> Option<BlockWindow> {
        let (c0, r0) = self.geo_to_pixel(extent.x_min, extent.y_max);
        let (c1, r1) = self.geo_to_pixel(extent.x_max, extent.y_min);
        let (x_off, x_len, src_x, src_w) = clip_axis(c0, c1, raster_size.0, size.0)?;
        let (y_off, y_len, src_y, src_h) = clip_axis(r0, r1, raster_size.1, size.1)?;
        Some(BlockWindow {
            source: (src_x, src_y, src_w, src_h),
            target: (x_off, y_off, x_len, y_len),
        })
    }
}

/// Pixel rectangles `(x_off, y_off, width, height)` of a clipped block read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockWindow {
    pub source: (usize, usize, usize, usize),
    pub target: (usize, usize, usize, usize),
}

/// One axis of [`GeoTransform::block_window`]: `start..end` in source pixels
/// spread over `out` buffer pixels, clipped to `0..len`.
fn clip_axis(start: f64, end: f64, len: usize, out: usize) -> Option<(usize, usize, usize, usize)> {
    if out == 0 || !start.is_finite() || !end.is_finite() || end <= start {
        return None;
    }
    // Tolerance keeps edge-aligned reads from losing a pixel to rounding.
    const EPS: f64 = 1e-6;
    let step = (end - start) / out as f64;
    let first = ((0.0 - start) / step - EPS).ceil().max(0.0) as usize;
    let last = (((len as f64 - start) / step + EPS).floor().max(0.0) as usize).min(out);
    if last <= first {
        return None;
    }

    let src_start = (start + first as f64 * step).round().max(0.0) as usize;
    let src_end = ((start + last as f64 * step).round().max(0.0) as usize).min(len);
    if src_end <= src_start {
        return None;
    }
    Some((first, last - first, src_start, src_end - src_start))
}
