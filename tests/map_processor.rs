mod common;

use common::{rgba_raster, PixelMeanRegressor};
use ndarray::{Array2, Array3};
use ortho_infer::processor::MapProcessor;
use ortho_infer::{
    ChannelsMapping, GeoExtent, InMemoryRaster, Model, ModelKind, ProcessedArea,
    ProcessedAreaType, ProcessingError, ProcessingOutcome, ProcessingOverlap,
    ProcessingParameters, ProcessorState, RasterSource, Result, TileCache,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WIDTH: usize = 829;
const HEIGHT: usize = 561;

fn scenario_params(batch_size: usize) -> ProcessingParameters {
    ProcessingParameters::new(512, ChannelsMapping::new(vec![0, 1, 2]))
        .with_resolution_cm_per_px(100.0)
        .with_batch_size(batch_size)
        .with_overlap(ProcessingOverlap::Percent(20.0))
}

fn run_regression(
    raster: &dyn RasterSource,
    runtime: Arc<PixelMeanRegressor>,
    params: ProcessingParameters,
    cache: Option<Arc<TileCache>>,
) -> Result<Vec<Array2<f32>>> {
    let model = Arc::new(Model::load(runtime, ModelKind::Regression)?);
    let area = ProcessedArea::entire_layer(raster, params.resolution_m_per_px())?;
    let mut processor = MapProcessor::regression(raster, area, model, params)?;
    if let Some(cache) = cache {
        processor = processor.with_cache(cache);
    }
    processor.run()?;
    Ok(processor.result_imgs().map(|imgs| imgs.to_vec()).unwrap_or_default())
}

fn expected_value(raster: &InMemoryRaster, row: usize, col: usize) -> f32 {
    let data = raster.data();
    (0..3).map(|b| data[[b, row, col]] / 255.0).sum::<f32>() / 3.0
}

#[test]
fn test_rgba_scenario_is_batch_size_invariant() {
    let raster = rgba_raster(WIDTH, HEIGHT);

    let single = run_regression(
        &raster,
        Arc::new(PixelMeanRegressor::new(512, 3)),
        scenario_params(1),
        None,
    )
    .unwrap();
    let batched_runtime = Arc::new(PixelMeanRegressor::new(512, 3).with_fixed_batch(2));
    let batched = run_regression(&raster, batched_runtime.clone(), scenario_params(2), None).unwrap();

    assert_eq!(single.len(), 1);
    assert_eq!(single[0].dim(), (HEIGHT, WIDTH));
    assert_eq!(batched[0].dim(), (HEIGHT, WIDTH));
    assert_eq!(single, batched);
    // 4 tiles in 2 full batches.
    assert_eq!(batched_runtime.calls(), 2);

    for &(row, col) in &[(0, 0), (300, 400), (560, 828), (100, 700)] {
        assert!((single[0][[row, col]] - expected_value(&raster, row, col)).abs() < 1e-5);
    }
}

#[test]
fn test_partial_batch_is_padded_for_fixed_batch_models() {
    let raster = rgba_raster(WIDTH, HEIGHT);
    let runtime = Arc::new(PixelMeanRegressor::new(512, 3).with_fixed_batch(3));
    let layers = run_regression(&raster, runtime.clone(), scenario_params(3), None).unwrap();

    assert_eq!(layers[0].dim(), (HEIGHT, WIDTH));
    // 4 tiles: a full batch of 3, then 1 tile padded to 3.
    assert_eq!(runtime.calls(), 2);
    assert_eq!(runtime.tiles(), 6);
}

#[test]
fn test_cache_does_not_change_results() {
    let raster = rgba_raster(WIDTH, HEIGHT);
    let without = run_regression(
        &raster,
        Arc::new(PixelMeanRegressor::new(512, 3)),
        scenario_params(1),
        None,
    )
    .unwrap();

    let cache = Arc::new(TileCache::new());
    let runtime = Arc::new(PixelMeanRegressor::new(512, 3));
    let first = run_regression(
        &raster,
        runtime.clone(),
        scenario_params(1).with_local_cache(true),
        Some(cache.clone()),
    )
    .unwrap();
    let second = run_regression(
        &raster,
        runtime.clone(),
        scenario_params(1).with_local_cache(true),
        Some(cache.clone()),
    )
    .unwrap();

    assert_eq!(without, first);
    assert_eq!(first, second);
    assert_eq!(runtime.calls(), 4);
    assert_eq!(cache.len(), 4);
    assert_eq!(cache.stats().hits, 4);
}

#[test]
fn test_runs_without_cache_are_idempotent() {
    let raster = rgba_raster(WIDTH, HEIGHT);
    let runtime = Arc::new(PixelMeanRegressor::new(512, 3));
    let a = run_regression(&raster, runtime.clone(), scenario_params(1), None).unwrap();
    let b = run_regression(&raster, runtime.clone(), scenario_params(1), None).unwrap();

    assert_eq!(a, b);
    assert_eq!(runtime.calls(), 8);
}

#[test]
fn test_two_output_layers_are_unsupported() {
    let runtime = Arc::new(PixelMeanRegressor::new(512, 3).with_output_layers(2));
    let result = Model::load(runtime.clone(), ModelKind::Regression);

    assert!(matches!(result, Err(ProcessingError::UnsupportedModel(_))));
    assert_eq!(runtime.calls(), 0);
}

#[test]
fn test_overlap_as_large_as_tile_is_a_configuration_error() {
    let raster = rgba_raster(WIDTH, HEIGHT);
    let runtime = Arc::new(PixelMeanRegressor::new(512, 3));
    let params = scenario_params(1).with_overlap(ProcessingOverlap::Pixels(512));

    let model = Arc::new(Model::load(runtime.clone(), ModelKind::Regression).unwrap());
    let area = ProcessedArea::entire_layer(&raster, 1.0).unwrap();
    let mut processor = MapProcessor::regression(&raster, area, model, params).unwrap();

    assert!(matches!(processor.run(), Err(ProcessingError::Configuration(_))));
    assert_eq!(processor.state(), ProcessorState::Failed);
    assert_eq!(runtime.calls(), 0);
}

/// Fails every read that reaches east of `fail_east_of`.
struct PartlyBrokenRaster {
    inner: InMemoryRaster,
    fail_east_of: f64,
}

impl RasterSource for PartlyBrokenRaster {
    fn extent(&self) -> GeoExtent {
        self.inner.extent()
    }

    fn band_count(&self) -> usize {
        self.inner.band_count()
    }

    fn read_block(&self, extent: &GeoExtent, size: (usize, usize)) -> Result<Array3<f32>> {
        if extent.x_max > self.fail_east_of {
            return Err(ProcessingError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "corrupt strip",
            )));
        }
        self.inner.read_block(extent, size)
    }
}

#[test]
fn test_read_failure_fails_the_run_with_tile_extent() {
    let raster = PartlyBrokenRaster {
        inner: rgba_raster(WIDTH, HEIGHT),
        fail_east_of: 500_600.0,
    };
    let runtime = Arc::new(PixelMeanRegressor::new(512, 3));
    let model = Arc::new(Model::load(runtime, ModelKind::Regression).unwrap());
    let area = ProcessedArea::entire_layer(&raster, 1.0).unwrap();
    let mut processor = MapProcessor::regression(&raster, area, model, scenario_params(1)).unwrap();

    match processor.run() {
        // Second tile, columns 317..829.
        Err(ProcessingError::TileRead { extent, .. }) => {
            assert_eq!(extent.x_min, 500_317.0);
            assert_eq!(extent.x_max, 500_829.0);
        }
        other => panic!("expected TileRead, got {:?}", other),
    }
    assert_eq!(processor.state(), ProcessorState::Failed);
    assert!(processor.result_imgs().is_none());
}

#[test]
fn test_visible_part_output_is_aligned_to_the_area() {
    let raster = rgba_raster(WIDTH, HEIGHT);
    let runtime = Arc::new(PixelMeanRegressor::new(512, 3));
    let model = Arc::new(Model::load(runtime, ModelKind::Regression).unwrap());
    let visible = GeoExtent::new(500_100.0, 5_999_700.0, 500_400.0, 5_999_950.0);
    let area = ProcessedArea::visible_part(&raster, 1.0, &visible).unwrap();
    assert_eq!(area.offset(), (100, 50));
    assert_eq!(area.dim(), (250, 300));

    let params = scenario_params(1).with_processed_area_type(ProcessedAreaType::VisiblePart);
    let mut processor = MapProcessor::regression(&raster, area, model, params).unwrap();
    assert_eq!(processor.run().unwrap(), ProcessingOutcome::Completed);

    let result = processor.result().unwrap();
    assert_eq!(result.layers[0].dim(), (250, 300));
    assert_eq!(result.transform.origin(), (500_100.0, 5_999_950.0));
    for &(row, col) in &[(0, 0), (249, 299), (120, 10)] {
        let value = result.layers[0][[row, col]];
        assert!((value - expected_value(&raster, row + 50, col + 100)).abs() < 1e-5);
    }
}

#[test]
fn test_area_type_must_match_parameters() {
    let raster = rgba_raster(WIDTH, HEIGHT);
    let runtime = Arc::new(PixelMeanRegressor::new(512, 3));
    let model = Arc::new(Model::load(runtime, ModelKind::Regression).unwrap());
    let area = ProcessedArea::entire_layer(&raster, 1.0).unwrap();
    let params = scenario_params(1).with_processed_area_type(ProcessedAreaType::FromPolygons);

    let mut processor = MapProcessor::regression(&raster, area, model, params).unwrap();
    assert!(matches!(processor.run(), Err(ProcessingError::Configuration(_))));
}

#[test]
fn test_concurrent_runs_sharing_a_cache_compute_each_tile_once() {
    let raster = rgba_raster(WIDTH, HEIGHT);
    let runtime = Arc::new(PixelMeanRegressor::new(512, 3).with_delay(Duration::from_millis(30)));
    let cache = Arc::new(TileCache::new());

    let results: Vec<Vec<Array2<f32>>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let runtime = runtime.clone();
                let cache = cache.clone();
                let raster = &raster;
                scope.spawn(move || {
                    run_regression(
                        raster,
                        runtime,
                        scenario_params(1).with_local_cache(true),
                        Some(cache),
                    )
                    .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(runtime.tiles(), 4);
    assert_eq!(results[0], results[1]);
    assert_eq!(results[1], results[2]);
}
