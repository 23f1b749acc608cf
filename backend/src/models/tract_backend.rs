//! ONNX image models run through tract (pure Rust, no native runtime).

use super::{Classifier, ModelError, Segmenter};
use ndarray::{ArrayD, ArrayView4, IxDyn};
use std::path::Path;
use std::sync::Mutex;
use tract_onnx::prelude::*;

type Plan = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

pub struct TractModel {
    plan: Mutex<Plan>,
}

impl TractModel {
    /// Loads an NHWC model and pins its input to `(1, size, size, 3)`.
    pub fn load(path: &Path, image_size: u32) -> Result<Self, ModelError> {
        let load_error = |e: TractError| ModelError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        let side = image_size as usize;
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(load_error)?
            .with_input_fact(0, f32::fact([1, side, side, 3]).into())
            .map_err(load_error)?
            .into_optimized()
            .map_err(load_error)?
            .into_runnable()
            .map_err(load_error)?;
        Ok(Self {
            plan: Mutex::new(plan),
        })
    }

    fn run(&self, batch: ArrayView4<'_, f32>) -> Result<ArrayD<f32>, ModelError> {
        let data: Vec<f32> = batch.iter().copied().collect();
        let input = Tensor::from_shape(batch.shape(), &data)
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let plan = self.plan.lock().map_err(|_| ModelError::Poisoned)?;
        let outputs = plan
            .run(tvec!(input.into()))
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        drop(plan);

        let output = outputs
            .first()
            .ok_or_else(|| ModelError::UnexpectedShape("model produced no outputs".to_string()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        let shape = view.shape().to_vec();
        let values: Vec<f32> = view.iter().copied().collect();
        ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| ModelError::UnexpectedShape(e.to_string()))
    }
}

impl Segmenter for TractModel {
    fn segment(&self, batch: ArrayView4<'_, f32>) -> Result<ArrayD<f32>, ModelError> {
        log::debug!("Running tract segmentation on {:?}", batch.shape());
        self.run(batch)
    }
}

impl Classifier for TractModel {
    fn classify(&self, batch: ArrayView4<'_, f32>) -> Result<ArrayD<f32>, ModelError> {
        log::debug!("Running tract classification on {:?}", batch.shape());
        self.run(batch)
    }
}
