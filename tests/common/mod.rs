#![allow(dead_code)]

use ndarray::{Array3, Array4, ArrayD, ArrayView4, Axis};
use ortho_infer::{GeoTransform, InMemoryRaster, ModelRuntime, ProcessingError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// RGBA-like raster with position-dependent values, 1 m pixels, top-left at (500000, 6000000).
pub fn rgba_raster(width: usize, height: usize) -> InMemoryRaster {
    let data = Array3::from_shape_fn((4, height, width), |(b, r, c)| {
        if b == 3 {
            255.0
        } else {
            ((b * 40 + r * 7 + c * 3) % 256) as f32
        }
    });
    InMemoryRaster::new(data, GeoTransform::north_up(500_000.0, 6_000_000.0, 1.0)).unwrap()
}

/// Regressor producing the per-pixel mean of its input channels.
pub struct PixelMeanRegressor {
    input_shape: Vec<i64>,
    output_shapes: Vec<Vec<i64>>,
    calls: AtomicUsize,
    tiles: AtomicUsize,
    delay: Duration,
}

impl PixelMeanRegressor {
    pub fn new(tile: usize, channels: usize) -> Self {
        let t = tile as i64;
        Self {
            input_shape: vec![-1, channels as i64, t, t],
            output_shapes: vec![vec![-1, 1, t, t]],
            calls: AtomicUsize::new(0),
            tiles: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_fixed_batch(mut self, batch: usize) -> Self {
        self.input_shape[0] = batch as i64;
        self.output_shapes[0][0] = batch as i64;
        self
    }

    pub fn with_output_layers(mut self, layers: usize) -> Self {
        let first = self.output_shapes[0].clone();
        self.output_shapes = vec![first; layers];
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Tiles submitted across all calls, padding included.
    pub fn tiles(&self) -> usize {
        self.tiles.load(Ordering::SeqCst)
    }
}

impl ModelRuntime for PixelMeanRegressor {
    fn identity(&self) -> &str {
        "pixel-mean-regressor"
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
                "model exported with batch {} received {}",
                self.input_shape[0], n
            )));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tiles.fetch_add(n, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let mean = batch
            .mean_axis(Axis(1))
            .ok_or_else(|| ProcessingError::Inference("no channels".to_string()))?;
        let mut out = Array4::<f32>::zeros((n, 1, h, w));
        out.index_axis_mut(Axis(1), 0).assign(&mean);
        Ok(vec![out.into_dyn()])
    }
}
