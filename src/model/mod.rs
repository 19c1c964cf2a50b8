//! Loaded models and their kind-specific pre/post-processing.

pub mod detector;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod regressor;
pub mod segmentor;

use crate::error::{ProcessingError, Result};
use crate::params::ProcessingParameters;
use log::debug;
use ndarray::{s, Array3, Array4, ArrayD, ArrayView4, Axis};
use std::fmt;
use std::sync::Arc;

pub use detector::TileDetection;

/// Orthophoto bands are 8-bit; models take them scaled to `[0, 1]`.
const INPUT_NORMALIZATION: f32 = 1.0 / 255.0;

/// Raw output of one tile, batch axis removed, shared with the tile cache.
pub type RawTileOutput = Arc<ArrayD<f32>>;

/// Executes a network on NCHW `f32` batches.
pub trait ModelRuntime: Send + Sync {
    /// Stable identifier, part of every tile cache key.
    fn identity(&self) -> &str;

    /// `(batch, channels, height, width)`; non-positive entries are dynamic.
    fn input_shape(&self) -> &[i64];

    /// Declared shape of every output layer, same convention as the input.
    fn output_shapes(&self) -> &[Vec<i64>];

    /// Runs one batch and returns one array per output layer.
    fn run(&self, batch: ArrayView4<'_, f32>) -> Result<Vec<ArrayD<f32>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Segmentation,
    Regression,
    Detection,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelKind::Segmentation => "Segmentor",
            ModelKind::Regression => "Regressor",
            ModelKind::Detection => "Detector",
        };
        f.write_str(name)
    }
}

/// Kind-specific postprocessed tile.
#[derive(Debug, Clone, PartialEq)]
pub enum Postprocessed {
    /// `(channels, tile, tile)` values ready for the canvas.
    Dense(Array3<f32>),
    Detections(Vec<TileDetection>),
}

/// Declared dimension, `None` when dynamic.
pub(crate) fn static_dim(dim: i64) -> Option<usize> {
    if dim > 0 {
        Some(dim as usize)
    } else {
        None
    }
}

pub struct Model {
    runtime: Arc<dyn ModelRuntime>,
    kind: ModelKind,
    input_size: usize,
    input_channels: usize,
    output_channels: usize,
    fixed_batch_size: Option<usize>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("identity", &self.runtime.identity())
            .field("kind", &self.kind)
            .field("input_size", &self.input_size)
            .field("input_channels", &self.input_channels)
            .field("output_channels", &self.output_channels)
            .field("fixed_batch_size", &self.fixed_batch_size)
            .finish()
    }
}

impl Model {
    /// Validates the runtime's declared shapes for `kind`.
    pub fn load(runtime: Arc<dyn ModelRuntime>, kind: ModelKind) -> Result<Self> {
        let input = runtime.input_shape();
        if input.len() != 4 {
            return Err(ProcessingError::unsupported_model(format!(
                "{} input should have 4 dimensions: (Batch_size, Channels, H, W). Actually has: {:?}",
                kind, input
            )));
        }
        let (input_height, input_width) = match (static_dim(input[2]), static_dim(input[3])) {
            (Some(h), Some(w)) => (h, w),
            _ => {
                return Err(ProcessingError::unsupported_model(format!(
                    "{} input must have a fixed tile size. Has: {:?}",
                    kind, input
                )))
            }
        };
        if input_height != input_width {
            return Err(ProcessingError::unsupported_model(format!(
                "{} can handle only square input tiles. Has: {:?}",
                kind, input
            )));
        }
        let input_channels = static_dim(input[1]).ok_or_else(|| {
            ProcessingError::unsupported_model(format!(
                "{} input must declare its channel count. Has: {:?}",
                kind, input
            ))
        })?;

        let outputs = runtime.output_shapes();
        let output_channels = match kind {
            ModelKind::Regression => regressor::check_loaded_model_outputs(outputs, input_width)?,
            ModelKind::Segmentation => segmentor::check_loaded_model_outputs(outputs, input_width)?,
            ModelKind::Detection => detector::check_loaded_model_outputs(outputs)?,
        };

        let fixed_batch_size = static_dim(input[0]);
        debug!(
            "Loaded {} '{}': {}x{} input, {} input channels, {} output channels, batch {:?}",
            kind,
            runtime.identity(),
            input_width,
            input_height,
            input_channels,
            output_channels,
            fixed_batch_size
        );

        Ok(Self {
            runtime,
            kind,
            input_size: input_width,
            input_channels,
            output_channels,
            fixed_batch_size,
        })
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn identity(&self) -> &str {
        self.runtime.identity()
    }

    pub fn input_size_in_pixels(&self) -> (usize, usize) {
        (self.input_size, self.input_size)
    }

    pub fn number_of_input_channels(&self) -> usize {
        self.input_channels
    }

    pub fn number_of_output_channels(&self) -> usize {
        self.output_channels
    }

    /// Batch size the runtime was exported with, if it is not dynamic.
    pub fn fixed_batch_size(&self) -> Option<usize> {
        self.fixed_batch_size
    }

    /// Checks that `params` can drive this model.
    pub fn check_parameters(&self, params: &ProcessingParameters) -> Result<()> {
        if params.tile_size_px != self.input_size {
            return Err(ProcessingError::configuration(format!(
                "tile size {} px differs from the model input size {} px",
                params.tile_size_px, self.input_size
            )));
        }
        if params.input_channels_mapping.len() != self.input_channels {
            return Err(ProcessingError::configuration(format!(
                "channel mapping provides {} channels, model expects {}",
                params.input_channels_mapping.len(),
                self.input_channels
            )));
        }
        if let Some(fixed) = self.fixed_batch_size {
            if fixed != params.batch_size {
                return Err(ProcessingError::configuration(format!(
                    "model was exported with batch size {}, parameters request {}",
                    fixed, params.batch_size
                )));
            }
        }
        Ok(())
    }

    /// Stacks `(channels, tile, tile)` tiles into a normalised NCHW batch.
    pub fn preprocess(&self, tiles: &[Array3<f32>]) -> Result<Array4<f32>> {
        let size = self.input_size;
        let mut batch = Array4::<f32>::zeros((tiles.len(), self.input_channels, size, size));
        for (i, tile) in tiles.iter().enumerate() {
            if tile.dim() != (self.input_channels, size, size) {
                return Err(ProcessingError::Inference(format!(
                    "tile {} has shape {:?}, expected ({}, {}, {})",
                    i,
                    tile.dim(),
                    self.input_channels,
                    size,
                    size
                )));
            }
            batch
                .slice_mut(s![i, .., .., ..])
                .assign(&tile.mapv(|v| v * INPUT_NORMALIZATION));
        }
        Ok(batch)
    }

    /// Runs the tiles through the runtime, one raw output per tile.
    pub fn infer(&self, tiles: &[Array3<f32>]) -> Result<Vec<RawTileOutput>> {
        let batch = self.preprocess(tiles)?;
        let mut outputs = self.runtime.run(batch.view())?;
        if outputs.len() != 1 {
            return Err(ProcessingError::Inference(format!(
                "runtime returned {} output layers, expected 1",
                outputs.len()
            )));
        }
        let output = outputs.remove(0);
        if output.ndim() == 0 || output.len_of(Axis(0)) != tiles.len() {
            return Err(ProcessingError::Inference(format!(
                "output batch {:?} does not match the {} submitted tiles",
                output.shape(),
                tiles.len()
            )));
        }

        Ok(output
            .axis_iter(Axis(0))
            .map(|tile| Arc::new(tile.to_owned()))
            .collect())
    }

    pub fn postprocess(
        &self,
        raw: &ArrayD<f32>,
        params: &ProcessingParameters,
    ) -> Result<Postprocessed> {
        match self.kind {
            ModelKind::Regression => {
                regressor::postprocessing(raw, self.input_size).map(Postprocessed::Dense)
            }
            ModelKind::Segmentation => segmentor::postprocessing(
                raw,
                self.input_size,
                params.pixel_classification_threshold,
            )
            .map(Postprocessed::Dense),
            ModelKind::Detection => {
                detector::postprocessing(raw, params.confidence_threshold)
                    .map(Postprocessed::Detections)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::ChannelsMapping;
    use crate::test_support::{ConstantTileRuntime, MeanRuntime};

    #[test]
    fn test_load_regressor_reads_channels_from_output() {
        let runtime = Arc::new(MeanRuntime::new(64, 3).with_output_channels(2));
        let model = Model::load(runtime, ModelKind::Regression).unwrap();
        assert_eq!(model.input_size_in_pixels(), (64, 64));
        assert_eq!(model.number_of_output_channels(), 2);
        assert_eq!(model.fixed_batch_size(), None);
    }

    #[test]
    fn test_two_output_layers_are_rejected() {
        let runtime = Arc::new(MeanRuntime::new(64, 3).with_extra_output_layer());
        let err = Model::load(runtime, ModelKind::Regression).unwrap_err();
        assert!(matches!(err, ProcessingError::UnsupportedModel(_)));
    }

    #[test]
    fn test_non_square_input_is_rejected() {
        let runtime = Arc::new(MeanRuntime::new(64, 3).with_input_shape(vec![-1, 3, 64, 32]));
        let err = Model::load(runtime, ModelKind::Regression).unwrap_err();
        assert!(matches!(err, ProcessingError::UnsupportedModel(_)));
    }

    #[test]
    fn test_check_parameters() {
        let runtime = Arc::new(MeanRuntime::new(64, 3).with_fixed_batch(2));
        let model = Model::load(runtime, ModelKind::Regression).unwrap();

        let params = ProcessingParameters::new(64, ChannelsMapping::default_for_bands(3))
            .with_batch_size(2);
        assert!(model.check_parameters(&params).is_ok());

        let wrong_batch = params.clone().with_batch_size(1);
        assert!(matches!(
            model.check_parameters(&wrong_batch),
            Err(ProcessingError::Configuration(_))
        ));

        let wrong_tile = ProcessingParameters::new(32, ChannelsMapping::default_for_bands(3))
            .with_batch_size(2);
        assert!(model.check_parameters(&wrong_tile).is_err());

        let wrong_channels = ProcessingParameters::new(64, ChannelsMapping::default_for_bands(4))
            .with_batch_size(2);
        assert!(model.check_parameters(&wrong_channels).is_err());
    }

    #[test]
    fn test_infer_splits_batch_per_tile() {
        let runtime = Arc::new(ConstantTileRuntime::new(8, 1));
        let model = Model::load(runtime, ModelKind::Regression).unwrap();

        let tiles = vec![
            Array3::from_elem((1, 8, 8), 51.0),
            Array3::from_elem((1, 8, 8), 102.0),
        ];
        let outputs = model.infer(&tiles).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].shape(), &[1, 8, 8]);
        // Inputs are scaled by 1/255 before reaching the runtime.
        assert!((outputs[0][[0, 0, 0]] - 0.2).abs() < 1e-6);
        assert!((outputs[1][[0, 7, 7]] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_rejects_wrong_tile_shape() {
        let runtime = Arc::new(MeanRuntime::new(8, 3));
        let model = Model::load(runtime, ModelKind::Regression).unwrap();
        let tiles = vec![Array3::zeros((3, 8, 4))];
        assert!(matches!(
            model.preprocess(&tiles),
            Err(ProcessingError::Inference(_))
        ));
    }
}
