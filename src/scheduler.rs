use crate::cache::{Claim, Lookup, TileCache, TileCacheKey};
use crate::error::{ProcessingError, Result};
use crate::model::{Model, RawTileOutput};
use crate::params::ProcessingParameters;
use crate::raster::RasterSource;
use crate::tiling::TileWindow;
use log::debug;
use ndarray::{s, Array3};
use rayon::prelude::*;

/// A window together with the model's raw output for it.
#[derive(Debug, Clone)]
pub struct ScheduledTile {
    pub window: TileWindow,
    pub output: RawTileOutput,
}

pub struct BatchScheduler<'a> {
    model: &'a Model,
    source: &'a dyn RasterSource,
    params: &'a ProcessingParameters,
    cache: Option<&'a TileCache>,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(
        model: &'a Model,
        source: &'a dyn RasterSource,
        params: &'a ProcessingParameters,
        cache: Option<&'a TileCache>,
    ) -> Self {
        Self {
            model,
            source,
            params,
            cache,
        }
    }

    /// Splits windows into consecutive batches of at most `batch_size`.
    pub fn batches<'w>(&self, windows: &'w [TileWindow]) -> std::slice::Chunks<'w, TileWindow> {
        windows.chunks(self.params.batch_size.max(1))
    }

    fn cache_key(&self, window: &TileWindow) -> TileCacheKey {
        TileCacheKey::new(
            (window.extent.x_min, window.extent.y_max),
            self.params.resolution_m_per_px(),
            self.model.identity(),
            self.params.input_channels_mapping.clone(),
        )
    }

    /// Produces one output per window of `batch`, in the same order.
    pub fn process_batch(&self, batch: &[TileWindow]) -> Result<Vec<ScheduledTile>> {
        let mut outputs: Vec<Option<RawTileOutput>> = vec![None; batch.len()];
        let mut jobs: Vec<(usize, Option<Claim<'a>>)> = Vec::new();
        let mut in_flight: Vec<(usize, TileCacheKey)> = Vec::new();

        match self.cache {
            None => jobs.extend((0..batch.len()).map(|i| (i, None))),
            Some(cache) => {
                for (i, window) in batch.iter().enumerate() {
                    let key = self.cache_key(window);
                    match cache.try_claim(&key) {
                        Lookup::Hit(output) => outputs[i] = Some(output),
                        Lookup::Claimed(claim) => jobs.push((i, Some(claim))),
                        Lookup::InFlight => in_flight.push((i, key)),
                    }
                }
            }
        }

        let cached = batch.len() - jobs.len() - in_flight.len();
        let inferred = jobs.len();
        self.compute(batch, jobs, &mut outputs)?;

        // Our own claims are all fulfilled now, so waiting cannot deadlock.
        if let Some(cache) = self.cache {
            for (i, key) in in_flight {
                match cache.wait_for(&key) {
                    Lookup::Hit(output) => outputs[i] = Some(output),
                    Lookup::Claimed(claim) => {
                        self.compute(batch, vec![(i, Some(claim))], &mut outputs)?
                    }
                    Lookup::InFlight => {
                        return Err(ProcessingError::Inference(format!(
                            "tile at {} is still in flight after waiting",
                            batch[i].extent
                        )))
                    }
                }
            }
        }

        debug!(
            "Batch of {} tiles starting at #{}: {} cached, {} inferred",
            batch.len(),
            batch.first().map_or(0, |w| w.index),
            cached,
            inferred
        );

        batch
            .iter()
            .zip(outputs)
            .map(|(window, output)| {
                let output = output.ok_or_else(|| {
                    ProcessingError::Inference(format!("no output produced for tile at {}", window.extent))
                })?;
                Ok(ScheduledTile {
                    window: window.clone(),
                    output,
                })
            })
            .collect()
    }

    /// Reads and infers the `jobs` windows of `batch` in one model call.
    fn compute(
        &self,
        batch: &[TileWindow],
        jobs: Vec<(usize, Option<Claim<'a>>)>,
        outputs: &mut [Option<RawTileOutput>],
    ) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let indices: Vec<usize> = jobs.iter().map(|(i, _)| *i).collect();
        let mut tiles: Vec<Array3<f32>> = indices
            .par_iter()
            .map(|&i| self.read_tile(&batch[i]))
            .collect::<Result<Vec<_>>>()?;

        // Fixed-shape runtimes need full batches; padding outputs are dropped.
        let real = tiles.len();
        if let Some(last) = tiles.last().cloned() {
            while tiles.len() < self.params.batch_size {
                tiles.push(last.clone());
            }
        }

        let mut results = self.model.infer(&tiles)?;
        results.truncate(real);

        for ((i, claim), output) in jobs.into_iter().zip(results) {
            if let Some(claim) = claim {
                claim.fulfil(output.clone());
            }
            outputs[i] = Some(output);
        }
        Ok(())
    }

    /// Reads one window in model channel order, zero-padded to the tile size.
    pub fn read_tile(&self, window: &TileWindow) -> Result<Array3<f32>> {
        let tile_read_error = |reason: String| ProcessingError::TileRead {
            extent: window.extent,
            reason,
        };

        let block = self
            .source
            .read_block(&window.extent, (window.valid_width, window.valid_height))
            .and_then(|block| self.params.input_channels_mapping.apply(&block))
            .map_err(|e| tile_read_error(e.to_string()))?;

        let channels = self.params.input_channels_mapping.len();
        if block.dim() != (channels, window.valid_height, window.valid_width) {
            return Err(tile_read_error(format!(
                "source returned {:?}, expected ({}, {}, {})",
                block.dim(),
                channels,
                window.valid_height,
                window.valid_width
            )));
        }

        if !window.is_padded() {
            return Ok(block);
        }
        let mut tile = Array3::<f32>::zeros((channels, window.size, window.size));
        tile.slice_mut(s![.., ..window.valid_height, ..window.valid_width])
            .assign(&block);
        Ok(tile)
    }
}
