//! Rasters and runtimes shared by the unit tests.

use crate::error::{ProcessingError, Result};
use crate::geo::{GeoExtent, GeoTransform};
use crate::model::ModelRuntime;
use crate::raster::{InMemoryRaster, RasterSource};
use ndarray::{Array3, Array4, ArrayD, ArrayView4, Axis, IxDyn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Raster whose values depend on band and position, top-left at (0, 0).
pub fn gradient_raster(width: usize, height: usize, bands: usize, pixel_size: f64) -> InMemoryRaster {
    let data = Array3::from_shape_fn((bands, height, width), |(b, r, c)| {
        ((b * 50 + r * 3 + c * 2) % 256) as f32
    });
    InMemoryRaster::new(data, GeoTransform::north_up(0.0, 0.0, pixel_size)).unwrap()
}

/// Georeferenced like `inner` but every read fails.
pub struct FailingRaster {
    inner: InMemoryRaster,
}

impl FailingRaster {
    pub fn new(inner: InMemoryRaster) -> Self {
        Self { inner }
    }
}

impl RasterSource for FailingRaster {
    fn extent(&self) -> GeoExtent {
        self.inner.extent()
    }

    fn band_count(&self) -> usize {
        self.inner.band_count()
    }

    fn read_block(&self, _extent: &GeoExtent, _size: (usize, usize)) -> Result<Array3<f32>> {
        Err(ProcessingError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "truncated block",
        )))
    }
}

#[derive(Default)]
struct CallLog {
    calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl CallLog {
    fn record(&self, batch: usize) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(batch);
    }
}

/// Regressor whose every output channel is the per-pixel mean of the input
/// channels.
pub struct MeanRuntime {
    identity: String,
    input_shape: Vec<i64>,
    output_shapes: Vec<Vec<i64>>,
    output_channels: usize,
    log: CallLog,
}

impl MeanRuntime {
    pub fn new(tile: usize, channels: usize) -> Self {
        let t = tile as i64;
        Self {
            identity: format!("mean-{}px", tile),
            input_shape: vec![-1, channels as i64, t, t],
            output_shapes: vec![vec![-1, 1, t, t]],
            output_channels: 1,
            log: CallLog::default(),
        }
    }

    pub fn with_output_channels(mut self, channels: usize) -> Self {
        self.output_channels = channels;
        self.output_shapes[0][1] = channels as i64;
        self
    }

    pub fn with_extra_output_layer(mut self) -> Self {
        let first = self.output_shapes[0].clone();
        self.output_shapes.push(first);
        self
    }

    pub fn with_input_shape(mut self, shape: Vec<i64>) -> Self {
        self.input_shape = shape;
        self
    }

    pub fn with_fixed_batch(mut self, batch: usize) -> Self {
        self.input_shape[0] = batch as i64;
        self.output_shapes[0][0] = batch as i64;
        self
    }

    pub fn calls(&self) -> usize {
        self.log.calls.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.log.batch_sizes.lock().unwrap().clone()
    }
}

impl ModelRuntime for MeanRuntime {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn input_shape(&self) -> &[i64] {
        &self.input_shape
    }

    fn output_shapes(&self) -> &[Vec<i64>] {
        &self.output_shapes
    }

    fn run(&self, batch: ArrayView4<'_, f32>) -> Result<Vec<ArrayD<f32>>> {
        let (n, _, h, w) = batch.dim();
        if self.input_shape[0] > 0 && self.input_shape[0] as usize != n {
            return Err(ProcessingError::Inference(format!(
                "fixed batch of {} got {}",
                self.input_shape[0], n
            )));
        }
        self.log.record(n);

        let mean = batch
            .mean_axis(Axis(1))
            .ok_or_else(|| ProcessingError::Inference("empty channel axis".to_string()))?;
        let mut out = Array4::<f32>::zeros((n, self.output_channels, h, w));
        for mut channel in out.axis_iter_mut(Axis(1)) {
            channel.assign(&mean);
        }
        Ok(vec![out.into_dyn()])
    }
}

/// One output channel per tile, filled with the mean of the whole tile.
pub struct ConstantTileRuntime {
    input_shape: Vec<i64>,
    output_shapes: Vec<Vec<i64>>,
}

impl ConstantTileRuntime {
    pub fn new(tile: usize, channels: usize) -> Self {
        let t = tile as i64;
        Self {
            input_shape: vec![-1, channels as i64, t, t],
            output_shapes: vec![vec![-1, 1, t, t]],
        }
    }
}

impl ModelRuntime for ConstantTileRuntime {
    fn identity(&self) -> &str {
        "constant-tile"
    }

    fn input_shape(&self) -> &[i64] {
        &self.input_shape
    }

    fn output_shapes(&self) -> &[Vec<i64>] {
        &self.output_shapes
    }

    fn run(&self, batch: ArrayView4<'_, f32>) -> Result<Vec<ArrayD<f32>>> {
        let (n, _, h, w) = batch.dim();
        let mut out = Array4::<f32>::zeros((n, 1, h, w));
        for (tile, mut target) in batch.outer_iter().zip(out.outer_iter_mut()) {
            target.fill(tile.mean().unwrap_or(0.0));
        }
        Ok(vec![out.into_dyn()])
    }
}

/// Detector reporting the same single-class box for every tile.
pub struct DetectionRuntime {
    input_shape: Vec<i64>,
    output_shapes: Vec<Vec<i64>>,
    bbox: [f32; 4],
}

impl DetectionRuntime {
    /// `bbox` is `[cx, cy, w, h]` in tile pixels.
    pub fn new(tile: usize, channels: usize, bbox: [f32; 4]) -> Self {
        let t = tile as i64;
        Self {
            input_shape: vec![-1, channels as i64, t, t],
            output_shapes: vec![vec![-1, 1, 6]],
            bbox,
        }
    }
}

impl ModelRuntime for DetectionRuntime {
    fn identity(&self) -> &str {
        "fixed-box-detector"
    }

    fn input_shape(&self) -> &[i64] {
        &self.input_shape
    }

    fn output_shapes(&self) -> &[Vec<i64>] {
        &self.output_shapes
    }

    fn run(&self, batch: ArrayView4<'_, f32>) -> Result<Vec<ArrayD<f32>>> {
        let n = batch.len_of(Axis(0));
        let [cx, cy, w, h] = self.bbox;
        let row = [cx, cy, w, h, 1.0, 1.0];
        let values: Vec<f32> = (0..n).flat_map(|_| row).collect();
        let out = ArrayD::from_shape_vec(IxDyn(&[n, 1, 6]), values)?;
        Ok(vec![out])
    }
}
