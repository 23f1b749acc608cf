pub mod tabular;
#[cfg(feature = "torch")]
pub mod torch_backend;
#[cfg(feature = "tract")]
pub mod tract_backend;

use crate::config::{ModelBackend, ModelPaths};
use lesion_shared::PatientMetadata;
use ndarray::{ArrayD, ArrayView4};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Failed to load model {path}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("Model inference failed: {0}")]
    Inference(String),
    #[error("Unexpected model output shape: {0}")]
    UnexpectedShape(String),
    #[error("Model backend '{0:?}' is not compiled into this build")]
    BackendUnavailable(ModelBackend),
    #[error("Model lock poisoned")]
    Poisoned,
}

/// Output of the tabular model, resolved once when the prediction is made.
///
/// A numeric prediction that came from a class label keeps that label's text,
/// so it is reported exactly as the model emitted it.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataPrediction {
    Numeric { value: f64, text: Option<String> },
    Label(String),
}

impl MetadataPrediction {
    pub fn numeric(value: f64) -> Self {
        MetadataPrediction::Numeric { value, text: None }
    }

    /// Numeric when the raw value parses as a float, otherwise a label.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().parse::<f64>() {
            Ok(value) => MetadataPrediction::Numeric {
                value,
                text: Some(raw.trim().to_string()),
            },
            Err(_) => MetadataPrediction::Label(raw.to_string()),
        }
    }
}

impl fmt::Display for MetadataPrediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataPrediction::Numeric { text: Some(text), .. } => f.write_str(text),
            MetadataPrediction::Numeric { value, text: None } => write_float(f, *value),
            MetadataPrediction::Label(label) => f.write_str(label),
        }
    }
}

// Integral floats keep one decimal: 1.0, not 1.
fn write_float(f: &mut fmt::Formatter<'_>, value: f64) -> fmt::Result {
    if value.is_nan() {
        f.write_str("nan")
    } else if value.is_infinite() {
        f.write_str(if value > 0.0 { "inf" } else { "-inf" })
    } else if value.fract() == 0.0 {
        write!(f, "{:.1}", value)
    } else {
        write!(f, "{}", value)
    }
}

/// Index and value of the largest element. Ties keep the first index, and the
/// first NaN wins over every other value.
pub fn argmax(values: impl Iterator<Item = f64>) -> Option<(usize, f64)> {
    values.enumerate().fold(None, |best, (i, v)| match best {
        Some((_, top)) if top.is_nan() => best,
        Some((_, top)) if !v.is_nan() && v <= top => best,
        _ => Some((i, v)),
    })
}

/// Image to per-pixel lesion mask. Input is NHWC `(1, H, W, 3)`.
pub trait Segmenter: Send + Sync {
    fn segment(&self, batch: ArrayView4<'_, f32>) -> Result<ArrayD<f32>, ModelError>;
}

/// Image to class probabilities. Input is NHWC `(1, H, W, 3)`, output `(1, classes)`.
pub trait Classifier: Send + Sync {
    fn classify(&self, batch: ArrayView4<'_, f32>) -> Result<ArrayD<f32>, ModelError>;
}

pub trait MetadataPredictor: Send + Sync {
    fn predict(&self, metadata: &PatientMetadata) -> Result<MetadataPrediction, ModelError>;
}

/// The three models, loaded once at startup and shared by every request.
#[derive(Clone)]
pub struct ModelStore {
    pub segmentation: Arc<dyn Segmenter>,
    pub classification: Arc<dyn Classifier>,
    pub metadata: Arc<dyn MetadataPredictor>,
}

impl ModelStore {
    pub fn new(
        segmentation: Arc<dyn Segmenter>,
        classification: Arc<dyn Classifier>,
        metadata: Arc<dyn MetadataPredictor>,
    ) -> Self {
        Self {
            segmentation,
            classification,
            metadata,
        }
    }

    pub fn load(paths: &ModelPaths, image_size: u32) -> Result<Self, ModelError> {
        let metadata = Arc::new(tabular::TabularModel::from_path(&paths.metadata)?);
        log::info!("Loaded metadata model from {}", paths.metadata.display());

        let (segmentation, classification) = load_image_models(paths, image_size)?;
        log::info!(
            "Loaded {:?} image models: segmentation={}, classification={}",
            paths.backend,
            paths.segmentation.display(),
            paths.classification.display()
        );

        Ok(Self::new(segmentation, classification, metadata))
    }
}

type ImageModels = (Arc<dyn Segmenter>, Arc<dyn Classifier>);

fn load_image_models(paths: &ModelPaths, image_size: u32) -> Result<ImageModels, ModelError> {
    match paths.backend {
        #[cfg(feature = "tract")]
        ModelBackend::Tract => {
            let segmentation =
                tract_backend::TractModel::load(&paths.segmentation, image_size)?;
            let classification =
                tract_backend::TractModel::load(&paths.classification, image_size)?;
            Ok((Arc::new(segmentation), Arc::new(classification)))
        }
        #[cfg(feature = "torch")]
        ModelBackend::Torch => {
            let _ = image_size;
            let segmentation = torch_backend::TorchModel::load(&paths.segmentation)?;
            let classification = torch_backend::TorchModel::load(&paths.classification)?;
            Ok((Arc::new(segmentation), Arc::new(classification)))
        }
        #[allow(unreachable_patterns)]
        other => {
            let _ = image_size;
            Err(ModelError::BackendUnavailable(other))
        }
    }
}
