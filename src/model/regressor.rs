use super::static_dim;
use crate::error::{ProcessingError, Result};
use ndarray::{Array3, ArrayD, Ix3};

/// Correct means a single `(batch, channels, H, W)` output layer with square,
/// input-sized masks. Returns the number of output channels.
pub(crate) fn check_loaded_model_outputs(outputs: &[Vec<i64>], input_size: usize) -> Result<usize> {
    if outputs.len() != 1 {
        return Err(ProcessingError::unsupported_model(
            "Model with multiple output layers is not supported! Use only one output layer.",
        ));
    }
    let shape = &outputs[0];
    if shape.len() != 4 {
        return Err(ProcessingError::unsupported_model(format!(
            "Regression model output should have 4 dimensions: (Batch_size, Channels, H, W). Actually has: {:?}",
            shape
        )));
    }
    if shape[2] != shape[3] {
        return Err(ProcessingError::unsupported_model(format!(
            "Regression model can handle only square outputs masks. Has: {:?}",
            shape
        )));
    }
    if let Some(size) = static_dim(shape[2]) {
        if size != input_size {
            return Err(ProcessingError::unsupported_model(format!(
                "Regression model output is {} px but its input is {} px",
                size, input_size
            )));
        }
    }

    static_dim(shape[1]).ok_or_else(|| {
        ProcessingError::unsupported_model(format!(
            "Regression model must declare its output channels. Has: {:?}",
            shape
        ))
    })
}

/// Values pass through unchanged; only the shape is checked.
pub(crate) fn postprocessing(raw: &ArrayD<f32>, tile_size: usize) -> Result<Array3<f32>> {
    let tile = raw.clone().into_dimensionality::<Ix3>()?;
    let (_, h, w) = tile.dim();
    if h != tile_size || w != tile_size {
        return Err(ProcessingError::Inference(format!(
            "regression output tile is {}x{}, expected {}x{}",
            w, h, tile_size, tile_size
        )));
    }
    Ok(tile)
}
