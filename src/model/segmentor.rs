use super::static_dim;
use crate::error::{ProcessingError, Result};
use ndarray::{s, Array3, ArrayD, Ix3};

pub(crate) fn check_loaded_model_outputs(outputs: &[Vec<i64>], input_size: usize) -> Result<usize> {
    if outputs.len() != 1 {
        return Err(ProcessingError::unsupported_model(
            "Segmentation model with multiple output layers is not supported! Use only one output layer.",
        ));
    }
    let shape = &outputs[0];
    if shape.len() != 4 {
        return Err(ProcessingError::unsupported_model(format!(
            "Segmentation model output should have 4 dimensions: (Batch_size, Classes, H, W). Actually has: {:?}",
            shape
        )));
    }
    if shape[2] != shape[3] {
        return Err(ProcessingError::unsupported_model(format!(
            "Segmentation model can handle only square outputs masks. Has: {:?}",
            shape
        )));
    }
    if let Some(size) = static_dim(shape[2]) {
        if size != input_size {
            return Err(ProcessingError::unsupported_model(format!(
                "Segmentation model output is {} px but its input is {} px",
                size, input_size
            )));
        }
    }

    static_dim(shape[1]).ok_or_else(|| {
        ProcessingError::unsupported_model(format!(
            "Segmentation model must declare its number of classes. Has: {:?}",
            shape
        ))
    })
}

/// Turns class probabilities into one-hot class masks.
///
/// Pixels whose best probability is below `threshold` fall back to class 0.
/// A single-channel output is a binary mask thresholded directly.
pub(crate) fn postprocessing(raw: &ArrayD<f32>, tile_size: usize, threshold: f32) -> Result<Array3<f32>> {
    let probabilities = raw.clone().into_dimensionality::<Ix3>()?;
    let (classes, h, w) = probabilities.dim();
    if h != tile_size || w != tile_size {
        return Err(ProcessingError::Inference(format!(
            "segmentation output tile is {}x{}, expected {}x{}",
            w, h, tile_size, tile_size
        )));
    }

    if classes == 1 {
        return Ok(probabilities.mapv(|p| if p >= threshold { 1.0 } else { 0.0 }));
    }

    let mut masks = Array3::<f32>::zeros((classes, h, w));
    for row in 0..h {
        for col in 0..w {
            let pixel = probabilities.slice(s![.., row, col]);
            let (best_class, best_probability) = pixel
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (class, &p)| {
                    if p > best.1 {
                        (class, p)
                    } else {
                        best
                    }
                });
            let class = if best_probability >= threshold { best_class } else { 0 };
            masks[[class, row, col]] = 1.0;
        }
    }
    Ok(masks)
}
