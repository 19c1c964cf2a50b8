use super::ModelRuntime;
use crate::error::{ProcessingError, Result};
use log::{debug, info};
use ndarray::{ArrayD, ArrayView4};
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

pub struct OnnxRuntime {
    // `Session::run` needs exclusive access.
    session: Mutex<Session>,
    identity: String,
    input_name: String,
    output_names: Vec<String>,
    input_shape: Vec<i64>,
    output_shapes: Vec<Vec<i64>>,
}

impl OnnxRuntime {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading ONNX model: {}", path.display());
        let session = Session::builder()?.commit_from_file(path)?;

        let input = session.inputs.first().ok_or_else(|| {
            ProcessingError::unsupported_model("Model declares no input layer")
        })?;
        if session.inputs.len() > 1 {
            return Err(ProcessingError::unsupported_model(format!(
                "Model with {} input layers is not supported! Use only one input layer.",
                session.inputs.len()
            )));
        }
        let input_name = input.name.clone();
        let input_shape: Vec<i64> = input
            .input_type
            .tensor_shape()
            .map(|shape| shape.iter().copied().collect())
            .ok_or_else(|| ProcessingError::unsupported_model("Model input is not a tensor"))?;

        let output_shapes = session
            .outputs
            .iter()
            .map(|output| {
                output
                    .output_type
                    .tensor_shape()
                    .map(|shape| shape.iter().copied().collect())
                    .ok_or_else(|| {
                        ProcessingError::unsupported_model(format!(
                            "Model output '{}' is not a tensor",
                            output.name
                        ))
                    })
            })
            .collect::<Result<Vec<Vec<i64>>>>()?;

        let output_names = session.outputs.iter().map(|o| o.name.clone()).collect();

        debug!(
            "ONNX input '{}' {:?}, outputs {:?}",
            input_name, input_shape, output_shapes
        );

        Ok(Self {
            session: Mutex::new(session),
            identity: path.display().to_string(),
            input_name,
            output_names,
            input_shape,
            output_shapes,
        })
    }
}

impl ModelRuntime for OnnxRuntime {
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
        let input_tensor = Tensor::from_array(batch.to_owned())?;
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![self.input_name.as_str() => input_tensor])?;

        self.output_names
            .iter()
            .map(|name| Ok(outputs[name.as_str()].try_extract_array::<f32>()?.to_owned()))
            .collect()
    }
}
