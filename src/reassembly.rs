use crate::area::ProcessedArea;
use crate::error::{ProcessingError, Result};
use crate::params::ModelOutputFormat;
use crate::tiling::TileWindow;
use log::debug;
use ndarray::{s, Array2, Array3, Zip};

/// Value of pixels no tile wrote to, or outside the processed area.
pub const NO_DATA: f32 = f32::NAN;

/// Stitches tile outputs into area-sized layers; in overlaps the last tile wins.
pub struct Reassembler<'a> {
    area: &'a ProcessedArea,
    canvases: Vec<Array2<f32>>,
    tiles_written: usize,
}

impl<'a> Reassembler<'a> {
    pub fn new(area: &'a ProcessedArea, channels: usize) -> Self {
        let canvases = (0..channels)
            .map(|_| Array2::from_elem(area.dim(), NO_DATA))
            .collect();
        Self {
            area,
            canvases,
            tiles_written: 0,
        }
    }

    pub fn channels(&self) -> usize {
        self.canvases.len()
    }

    /// Copies the part of `tile` inside the area onto every channel canvas.
    pub fn write_tile(&mut self, window: &TileWindow, tile: &Array3<f32>) -> Result<()> {
        let (channels, tile_h, tile_w) = tile.dim();
        if channels != self.canvases.len() || tile_h != window.size || tile_w != window.size {
            return Err(ProcessingError::Inference(format!(
                "tile output {:?} does not fit {} channels of {} px",
                tile.dim(),
                self.canvases.len(),
                window.size
            )));
        }

        let (area_col, area_row) = self.area.offset();
        let (area_h, area_w) = self.area.dim();

        let c0 = window.col.max(area_col);
        let r0 = window.row.max(area_row);
        let c1 = window.col_end().min(area_col + area_w);
        let r1 = window.row_end().min(area_row + area_h);
        if c1 <= c0 || r1 <= r0 {
            return Ok(());
        }

        for (channel, canvas) in self.canvases.iter_mut().enumerate() {
            canvas
                .slice_mut(s![r0 - area_row..r1 - area_row, c0 - area_col..c1 - area_col])
                .assign(&tile.slice(s![
                    channel,
                    r0 - window.row..r1 - window.row,
                    c0 - window.col..c1 - window.col
                ]));
        }
        self.tiles_written += 1;
        Ok(())
    }

    /// Scales, masks and selects the output layers.
    pub fn finalize(
        self,
        output_scaling: f64,
        format: &ModelOutputFormat,
    ) -> Result<Vec<Array2<f32>>> {
        let selected = format.selected_channels(self.canvases.len())?;
        let scaling = output_scaling as f32;
        let area = self.area;

        let mut canvases: Vec<Option<Array2<f32>>> = self.canvases.into_iter().map(Some).collect();
        let mut layers = Vec::with_capacity(selected.len());
        for channel in selected {
            let mut canvas = canvases[channel].take().ok_or_else(|| {
                ProcessingError::configuration(format!("output channel {} selected twice", channel))
            })?;

            if scaling != 1.0 {
                canvas.mapv_inplace(|v| v * scaling);
            }
            if let Some(mask) = area.mask() {
                Zip::from(&mut canvas).and(mask).for_each(|value, &inside| {
                    if !inside {
                        *value = NO_DATA;
                    }
                });
            }
            layers.push(canvas);
        }

        debug!(
            "Reassembled {} layers of {:?} from {} tiles",
            layers.len(),
            area.dim(),
            self.tiles_written
        );
        Ok(layers)
    }
}
