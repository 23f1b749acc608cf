use super::{Classifier, ModelError, Segmenter};
use ndarray::{ArrayD, ArrayView4, IxDyn};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tch::{CModule, Device, Kind, Tensor};

/// TorchScript image model. Expects NHWC float input like the ONNX exports.
#[derive(Clone)]
pub struct TorchModel {
    model: Arc<Mutex<CModule>>,
    device: Device,
}

impl TorchModel {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let device = Device::cuda_if_available();
        let model = CModule::load_on_device(path, device).map_err(|e| ModelError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        log::info!("Loaded TorchScript model {} on {:?}", path.display(), device);
        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            device,
        })
    }

    fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<ArrayD<f32>, ModelError> {
        let dims: Vec<i64> = batch.shape().iter().map(|&d| d as i64).collect();
        let data: Vec<f32> = batch.iter().copied().collect();
        let input = Tensor::from_slice(&data).view(dims.as_slice()).to_device(self.device);

        let output = {
            let model = self.model.lock().map_err(|_| ModelError::Poisoned)?;
            tch::no_grad(|| model.forward_ts(&[input]))
                .map_err(|e| ModelError::Inference(e.to_string()))?
        };

        let output = output.to_kind(Kind::Float).to_device(Device::Cpu);
        let shape: Vec<usize> = output.size().iter().map(|&d| d as usize).collect();
        let output_flat = output.view([-1]);
        let num_elements = output_flat.size()[0] as usize;
        let mut output_vec = vec![0.0f32; num_elements];
        output_flat.copy_data(&mut output_vec, num_elements);

        ArrayD::from_shape_vec(IxDyn(&shape), output_vec)
            .map_err(|e| ModelError::UnexpectedShape(e.to_string()))
    }
}

impl Segmenter for TorchModel {
    fn segment(&self, batch: ArrayView4<'_, f32>) -> Result<ArrayD<f32>, ModelError> {
        self.forward(batch)
    }
}

impl Classifier for TorchModel {
    fn classify(&self, batch: ArrayView4<'_, f32>) -> Result<ArrayD<f32>, ModelError> {
        self.forward(batch)
    }
}
