use super::static_dim;
use crate::error::{ProcessingError, Result};
use ndarray::{ArrayD, Ix2};

/// Box in tile pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct TileDetection {
    /// `[x_min, y_min, x_max, y_max]`
    pub bbox: [f32; 4],
    pub class_id: usize,
    pub confidence: f32,
}

pub(crate) fn check_loaded_model_outputs(outputs: &[Vec<i64>]) -> Result<usize> {
    if outputs.len() != 1 {
        return Err(ProcessingError::unsupported_model(
            "Detection model with multiple output layers is not supported! Use only one output layer.",
        ));
    }
    let shape = &outputs[0];
    if shape.len() != 3 {
        return Err(ProcessingError::unsupported_model(format!(
            "Detection model output should have 3 dimensions: (Batch_size, Detections, 5 + Classes). Actually has: {:?}",
            shape
        )));
    }
    match static_dim(shape[2]) {
        Some(row) if row > 5 => Ok(row - 5),
        _ => Err(ProcessingError::unsupported_model(format!(
            "Detection model rows must hold a box, objectness and at least one class score. Has: {:?}",
            shape
        ))),
    }
}

/// Rows are `[cx, cy, w, h, objectness, class scores...]` in tile pixels.
pub(crate) fn postprocessing(raw: &ArrayD<f32>, confidence_threshold: f32) -> Result<Vec<TileDetection>> {
    let rows = raw.clone().into_dimensionality::<Ix2>()?;
    let mut detections = Vec::new();

    for row in rows.outer_iter() {
        if row.len() <= 5 {
            return Err(ProcessingError::Inference(format!(
                "detection row has {} values, expected more than 5",
                row.len()
            )));
        }
        let objectness = row[4];
        let (class_id, class_score) = row
            .iter()
            .skip(5)
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (class, &score)| {
                if score > best.1 {
                    (class, score)
                } else {
                    best
                }
            });

        let confidence = objectness * class_score;
        if !confidence.is_finite() || confidence < confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        if ![cx, cy, w, h].iter().all(|v| v.is_finite()) {
            continue;
        }
        detections.push(TileDetection {
            bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            class_id,
            confidence,
        });
    }

    Ok(detections)
}

/// Intersection over union of two `[x_min, y_min, x_max, y_max]` boxes.
pub fn iou(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_check_outputs_counts_classes() {
        assert_eq!(check_loaded_model_outputs(&[vec![-1, 100, 7]]).unwrap(), 2);
        assert!(check_loaded_model_outputs(&[vec![-1, 100, 5]]).is_err());
        assert!(check_loaded_model_outputs(&[vec![-1, 1, 100, 7]]).is_err());
    }

    #[test]
    fn test_postprocessing_filters_and_converts() {
        let raw = ArrayD::from_shape_vec(
            IxDyn(&[2, 7]),
            vec![
                50.0, 40.0, 20.0, 10.0, 0.9, 0.1, 0.8, // kept, class 1
                10.0, 10.0, 4.0, 4.0, 0.3, 0.9, 0.1, // 0.27 < 0.5
            ],
        )
        .unwrap();

        let detections = postprocessing(&raw, 0.5).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_id, 1);
        assert_eq!(detections[0].bbox, [40.0, 35.0, 60.0, 45.0]);
        assert!((detections[0].confidence - 0.72).abs() < 1e-6);
    }

    #[test]
    fn test_non_finite_rows_are_dropped() {
        let raw = ArrayD::from_shape_vec(
            IxDyn(&[3, 6]),
            vec![
                f32::NAN, 40.0, 20.0, 10.0, 0.9, 1.0, // NaN centre
                50.0, 40.0, f32::INFINITY, 10.0, 0.9, 1.0, // infinite width
                50.0, 40.0, 20.0, 10.0, f32::NAN, 1.0, // NaN objectness
            ],
        )
        .unwrap();
        assert!(postprocessing(&raw, 0.5).unwrap().is_empty());
    }

    #[test]
    fn test_iou() {
        let a = [0.0, 0.0, 10.0, 10.0];
        let b = [5.0, 0.0, 15.0, 10.0];
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-9);
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
    }
}
