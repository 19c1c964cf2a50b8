use crate::area::ProcessedArea;
use crate::cache::TileCache;
use crate::error::{ProcessingError, Result};
use crate::geo::{GeoExtent, GeoTransform};
use crate::model::{detector, Model, ModelKind, Postprocessed, TileDetection};
use crate::params::ProcessingParameters;
use crate::raster::RasterSource;
use crate::reassembly::Reassembler;
use crate::scheduler::BatchScheduler;
use crate::tiling::{TileWindow, TilingGrid};
use log::{debug, info, warn};
use ndarray::Array2;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Completed,
    Cancelled,
}

/// Shared flag checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Dense result layers of a regression or segmentation run.
#[derive(Debug, Clone)]
pub struct MapResult {
    pub layers: Vec<Array2<f32>>,
    /// Model output channel behind each layer.
    pub channels: Vec<usize>,
    pub transform: GeoTransform,
    pub extent: GeoExtent,
}

/// Detection in processed-area pixel space and map coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct MapDetection {
    /// `[x_min, y_min, x_max, y_max]` relative to the area's top-left pixel.
    pub bbox: [f64; 4],
    pub extent: GeoExtent,
    pub class_id: usize,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub enum MapOutput {
    Layers(MapResult),
    Detections(Vec<MapDetection>),
}

type ProgressCallback<'a> = Box<dyn Fn(usize, usize) + Send + Sync + 'a>;

/// Single-use run of one model over one area: `Idle -> Running -> Completed |
/// Failed | Cancelled`. Only a completed run exposes output.
pub struct MapProcessor<'a> {
    source: &'a dyn RasterSource,
    area: ProcessedArea,
    model: Arc<Model>,
    params: ProcessingParameters,
    cache: Option<Arc<TileCache>>,
    cancel: CancellationToken,
    progress: Option<ProgressCallback<'a>>,
    state: ProcessorState,
    output: Option<MapOutput>,
}

impl<'a> MapProcessor<'a> {
    pub fn new(
        source: &'a dyn RasterSource,
        area: ProcessedArea,
        model: Arc<Model>,
        params: ProcessingParameters,
    ) -> Self {
        Self {
            source,
            area,
            model,
            params,
            cache: None,
            cancel: CancellationToken::new(),
            progress: None,
            state: ProcessorState::Idle,
            output: None,
        }
    }

    fn for_kind(
        kind: ModelKind,
        source: &'a dyn RasterSource,
        area: ProcessedArea,
        model: Arc<Model>,
        params: ProcessingParameters,
    ) -> Result<Self> {
        if model.kind() != kind {
            return Err(ProcessingError::configuration(format!(
                "{} processor cannot run a {} model",
                kind,
                model.kind()
            )));
        }
        Ok(Self::new(source, area, model, params))
    }

    pub fn regression(
        source: &'a dyn RasterSource,
        area: ProcessedArea,
        model: Arc<Model>,
        params: ProcessingParameters,
    ) -> Result<Self> {
        Self::for_kind(ModelKind::Regression, source, area, model, params)
    }

    pub fn segmentation(
        source: &'a dyn RasterSource,
        area: ProcessedArea,
        model: Arc<Model>,
        params: ProcessingParameters,
    ) -> Result<Self> {
        Self::for_kind(ModelKind::Segmentation, source, area, model, params)
    }

    pub fn detection(
        source: &'a dyn RasterSource,
        area: ProcessedArea,
        model: Arc<Model>,
        params: ProcessingParameters,
    ) -> Result<Self> {
        Self::for_kind(ModelKind::Detection, source, area, model, params)
    }

    /// Tile cache used when `local_cache` is enabled. Share one instance
    /// between runs to reuse results; without one the run creates its own.
    pub fn with_cache(mut self, cache: Arc<TileCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&Arc<TileCache>> {
        self.cache.as_ref()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Called with `(processed_tiles, total_tiles)` after every batch.
    pub fn with_progress(mut self, callback: impl Fn(usize, usize) + Send + Sync + 'a) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn area(&self) -> &ProcessedArea {
        &self.area
    }

    pub fn result(&self) -> Option<&MapResult> {
        match &self.output {
            Some(MapOutput::Layers(result)) => Some(result),
            _ => None,
        }
    }

    /// One array per output layer of a completed dense run.
    pub fn result_imgs(&self) -> Option<&[Array2<f32>]> {
        self.result().map(|r| r.layers.as_slice())
    }

    pub fn detections(&self) -> Option<&[MapDetection]> {
        match &self.output {
            Some(MapOutput::Detections(detections)) => Some(detections),
            _ => None,
        }
    }

    pub fn take_output(&mut self) -> Option<MapOutput> {
        self.output.take()
    }

    pub fn run(&mut self) -> Result<ProcessingOutcome> {
        if self.state != ProcessorState::Idle {
            return Err(ProcessingError::configuration(format!(
                "processor can only run once, current state is {:?}",
                self.state
            )));
        }
        self.state = ProcessorState::Running;
        if self.params.local_cache && self.cache.is_none() {
            debug!("Local cache enabled without a shared cache, using a private one");
            self.cache = Some(Arc::new(TileCache::new()));
        }
        let started = Instant::now();
        info!(
            "Starting {} processing of {:?} px area",
            self.model.kind(),
            self.area.dim()
        );

        match self.execute() {
            Ok(Some(output)) => {
                self.state = ProcessorState::Completed;
                self.output = Some(output);
                info!("Processing completed in {:.2?}", started.elapsed());
                Ok(ProcessingOutcome::Completed)
            }
            Ok(None) => {
                self.state = ProcessorState::Cancelled;
                info!("Processing cancelled after {:.2?}", started.elapsed());
                Ok(ProcessingOutcome::Cancelled)
            }
            Err(e) => {
                self.state = ProcessorState::Failed;
                warn!("Processing failed: {}", e);
                Err(e)
            }
        }
    }

    fn check_setup(&self) -> Result<()> {
        self.params.validate()?;
        self.model.check_parameters(&self.params)?;
        self.params
            .input_channels_mapping
            .validate_against(self.source.band_count())?;

        if self.area.area_type() != self.params.processed_area_type {
            return Err(ProcessingError::configuration(format!(
                "parameters request {:?} but the area was built as {:?}",
                self.params.processed_area_type,
                self.area.area_type()
            )));
        }
        let grid_pixel = self.area.grid().transform.pixel_width();
        if (grid_pixel - self.params.resolution_m_per_px()).abs() > 1e-9 {
            return Err(ProcessingError::configuration(format!(
                "area grid uses {} m/px but parameters request {} m/px",
                grid_pixel,
                self.params.resolution_m_per_px()
            )));
        }
        Ok(())
    }

    /// `None` when cancelled.
    fn execute(&self) -> Result<Option<MapOutput>> {
        self.check_setup()?;

        let grid = TilingGrid::new(
            &self.area,
            self.params.tile_size_px,
            &self.params.processing_overlap,
        )?;
        let windows: Vec<TileWindow> = grid.iter().collect();
        let total = windows.len();
        info!(
            "Processing {} tiles of {} px (stride {} px) in batches of {}",
            total,
            grid.tile_size(),
            grid.stride(),
            self.params.batch_size
        );

        let cache = if self.params.local_cache {
            self.cache.as_deref()
        } else {
            None
        };

        let scheduler = BatchScheduler::new(&self.model, self.source, &self.params, cache);
        let mut sink = match self.model.kind() {
            ModelKind::Regression | ModelKind::Segmentation => TileSink::Dense(Reassembler::new(
                &self.area,
                self.model.number_of_output_channels(),
            )),
            ModelKind::Detection => TileSink::Detections(Vec::new()),
        };

        let mut processed = 0;
        for batch in scheduler.batches(&windows) {
            if self.cancel.is_cancelled() {
                debug!("Cancellation observed after {} of {} tiles", processed, total);
                return Ok(None);
            }

            for tile in scheduler.process_batch(batch)? {
                let postprocessed = self.model.postprocess(&tile.output, &self.params)?;
                sink.accept(&self.area, &tile.window, postprocessed)?;
            }

            processed += batch.len();
            if let Some(progress) = &self.progress {
                progress(processed, total);
            }
        }

        sink.finish(&self.area, &self.params, self.model.kind()).map(Some)
    }
}

enum TileSink<'a> {
    Dense(Reassembler<'a>),
    Detections(Vec<MapDetection>),
}

impl TileSink<'_> {
    fn accept(
        &mut self,
        area: &ProcessedArea,
        window: &TileWindow,
        postprocessed: Postprocessed,
    ) -> Result<()> {
        match (self, postprocessed) {
            (TileSink::Dense(reassembler), Postprocessed::Dense(tile)) => {
                reassembler.write_tile(window, &tile)
            }
            (TileSink::Detections(found), Postprocessed::Detections(tile_detections)) => {
                found.extend(
                    tile_detections
                        .iter()
                        .filter_map(|d| to_map_detection(area, window, d)),
                );
                Ok(())
            }
            _ => Err(ProcessingError::Inference(
                "postprocessed tile does not match the processor output".to_string(),
            )),
        }
    }

    fn finish(
        self,
        area: &ProcessedArea,
        params: &ProcessingParameters,
        kind: ModelKind,
    ) -> Result<MapOutput> {
        match self {
            TileSink::Dense(reassembler) => {
                let channels = params
                    .model_output_format
                    .selected_channels(reassembler.channels())?;
                // Segmentation masks are class indicators and are never rescaled.
                let scaling = match kind {
                    ModelKind::Regression => params.output_scaling,
                    _ => 1.0,
                };
                let layers = reassembler.finalize(scaling, &params.model_output_format)?;
                Ok(MapOutput::Layers(MapResult {
                    layers,
                    channels,
                    transform: area.transform(),
                    extent: area.extent(),
                }))
            }
            TileSink::Detections(found) => {
                let before = found.len();
                let kept = non_max_suppression(found, params.iou_threshold as f64);
                debug!("Non-maximum suppression kept {} of {} detections", kept.len(), before);
                Ok(MapOutput::Detections(kept))
            }
        }
    }
}

/// Moves a tile box into area space; drops boxes centred outside the area.
fn to_map_detection(
    area: &ProcessedArea,
    window: &TileWindow,
    detection: &TileDetection,
) -> Option<MapDetection> {
    let (area_col, area_row) = area.offset();
    let clip_x = |v: f32| (v as f64).clamp(0.0, window.valid_width as f64);
    let clip_y = |v: f32| (v as f64).clamp(0.0, window.valid_height as f64);

    let x_min = window.col as f64 + clip_x(detection.bbox[0]) - area_col as f64;
    let y_min = window.row as f64 + clip_y(detection.bbox[1]) - area_row as f64;
    let x_max = window.col as f64 + clip_x(detection.bbox[2]) - area_col as f64;
    let y_max = window.row as f64 + clip_y(detection.bbox[3]) - area_row as f64;
    if x_max <= x_min || y_max <= y_min {
        return None;
    }

    let center_x = (x_min + x_max) / 2.0;
    let center_y = (y_min + y_max) / 2.0;
    if center_x < 0.0 || center_y < 0.0 {
        return None;
    }
    if !area.is_inside(center_y as usize, center_x as usize) {
        return None;
    }

    let transform = area.transform();
    let (gx0, gy0) = transform.pixel_to_geo(x_min, y_min);
    let (gx1, gy1) = transform.pixel_to_geo(x_max, y_max);
    Some(MapDetection {
        bbox: [x_min, y_min, x_max, y_max],
        extent: GeoExtent::new(gx0, gy0, gx1, gy1),
        class_id: detection.class_id,
        confidence: detection.confidence,
    })
}

/// Greedy per-class suppression, highest confidence first.
pub fn non_max_suppression(mut detections: Vec<MapDetection>, iou_threshold: f64) -> Vec<MapDetection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(CmpOrdering::Equal)
    });

    let mut kept: Vec<MapDetection> = Vec::new();
    for candidate in detections {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && detector::iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
