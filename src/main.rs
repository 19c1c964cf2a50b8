use clap::Parser;
use env_logger::Env;
use log::{info, warn};
use std::sync::Arc;

use ortho_infer::area::{ProcessedArea, ProcessingGrid};
use ortho_infer::cli::Args;
use ortho_infer::error::{ProcessingError, Result};
use ortho_infer::model::onnx::OnnxRuntime;
use ortho_infer::model::{Model, ModelKind};
use ortho_infer::params::ProcessedAreaType;
use ortho_infer::processor::{MapOutput, MapProcessor, ProcessingOutcome};
use ortho_infer::{cog, crs, io};

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    info!("=== Ortho Inference ===");

    if let Some(n_threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build_global()
            .map_err(|e| ProcessingError::configuration(format!("thread pool: {}", e)))?;
        info!("Using {} threads", n_threads);
    } else {
        info!("Using all available threads");
    }

    cog::validate_compression(&args.compression)?;
    cog::validate_block_size(args.block_size)?;
    let kind = ModelKind::from(args.kind);
    if kind != ModelKind::Detection && args.output.is_none() {
        return Err(ProcessingError::configuration(
            "--output is required for segmentation and regression models",
        ));
    }

    let raster = io::GdalRaster::open(&args.input)?;
    let metadata = raster.metadata().clone();
    info!(
        "Raster size: {}x{}, {} bands",
        metadata.width, metadata.height, metadata.band_count
    );
    if (metadata.pixel_width - metadata.pixel_height).abs() > 1e-9 {
        warn!(
            "Non-square pixels detected ({:.6} x {:.6}), using width for calculations",
            metadata.pixel_width, metadata.pixel_height
        );
    }
    crs::check_metric_crs(&metadata.projection);

    let runtime = Arc::new(OnnxRuntime::load(&args.model)?);
    let model = Arc::new(Model::load(runtime, kind)?);
    let (tile_size, _) = model.input_size_in_pixels();
    let params = args.processing_parameters(tile_size, model.number_of_input_channels())?;
    let resolution = params.resolution_m_per_px();

    let area = match params.processed_area_type {
        ProcessedAreaType::EntireLayer => ProcessedArea::entire_layer(&raster, resolution)?,
        ProcessedAreaType::VisiblePart => {
            let extent = args
                .visible_extent()
                .ok_or_else(|| ProcessingError::configuration("--extent needs 4 values"))?;
            ProcessedArea::visible_part(&raster, resolution, &extent)?
        }
        ProcessedAreaType::FromPolygons => {
            let mask_path = args
                .mask
                .as_deref()
                .ok_or_else(|| ProcessingError::configuration("--mask is missing"))?;
            let grid = ProcessingGrid::for_source(&raster, resolution)?;
            let mask = io::read_mask_on_grid(mask_path, &grid)?;
            ProcessedArea::from_polygons(&raster, resolution, &mask)?
        }
    };
    let (area_height, area_width) = area.dim();
    info!("Processed area: {}x{} px at {} m/px", area_width, area_height, resolution);

    let mut processor = MapProcessor::new(&raster, area, Arc::clone(&model), params)
        .with_progress(|done, total| info!("Processed {}/{} tiles", done, total));

    if processor.run()? == ProcessingOutcome::Cancelled {
        warn!("Processing was cancelled, nothing written");
        return Ok(());
    }

    match processor.take_output() {
        Some(MapOutput::Layers(result)) => {
            let output = args
                .output
                .as_deref()
                .ok_or_else(|| ProcessingError::configuration("--output is missing"))?;
            let options = cog::create_dataset_options(&args.compression, args.block_size);
            let mut dataset = io::write_multiband_output(
                output,
                &result.layers,
                &result.channels,
                &result.transform,
                &metadata.projection,
                options,
            )?;
            if args.overviews {
                cog::build_overviews(&mut dataset)?;
            }
        }
        Some(MapOutput::Detections(detections)) => {
            info!("Found {} detections", detections.len());
            println!("class_id,confidence,x_min,y_min,x_max,y_max");
            for d in &detections {
                println!(
                    "{},{:.4},{:.3},{:.3},{:.3},{:.3}",
                    d.class_id,
                    d.confidence,
                    d.extent.x_min,
                    d.extent.y_min,
                    d.extent.x_max,
                    d.extent.y_max
                );
            }
        }
        None => warn!("Processing finished without output"),
    }

    info!("=== Done! ===");
    Ok(())
}
