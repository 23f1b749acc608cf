//! Segmentation, masking, classification, metadata prediction and fusion.
//!
//! Each stage consumes the previous one's output. Model failures propagate
//! unchanged; the only local recovery is the label fallback in [`fuse`].

use crate::models::{MetadataPrediction, ModelError, ModelStore, argmax};
use crate::preprocess::PreprocessedImage;
use lesion_shared::{LesionClass, PatientMetadata};
use ndarray::{Array2, Array3, ArrayD, Axis, Ix2};
use std::fmt;

pub const UNKNOWN_LABEL: &str = "Unknown";

/// Binary lesion mask, 1.0 inside the lesion and 0.0 elsewhere.
#[derive(Debug, Clone)]
pub struct SegmentationMask(pub Array2<f32>);

impl SegmentationMask {
    pub fn is_set(&self, y: usize, x: usize) -> bool {
        self.0[[y, x]] > 0.5
    }

    pub fn coverage(&self) -> f32 {
        if self.0.is_empty() {
            return 0.0;
        }
        self.0.sum() / self.0.len() as f32
    }
}

/// One classifier output row, indexed like [`LesionClass`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClassProbabilities(pub Vec<f32>);

impl ClassProbabilities {
    /// First index of the highest probability.
    pub fn top(&self) -> (usize, f32) {
        argmax(self.0.iter().map(|&p| f64::from(p)))
            .map(|(i, p)| (i, p as f32))
            .unwrap_or((0, 0.0))
    }

    pub fn top_label(&self) -> String {
        label_for(self.top().0)
    }

    /// `bkl: 0.1000, nv: 0.6000, ...` over the fixed label set.
    pub fn breakdown(&self) -> String {
        LesionClass::labels()
            .iter()
            .zip(&self.0)
            .map(|(label, p)| format!("{}: {:.4}", label, p))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// The final label, either from averaging or taken verbatim from the metadata model.
#[derive(Debug, Clone, PartialEq)]
pub enum FusedLabel {
    Averaged(String),
    Fallback(String),
}

impl fmt::Display for FusedLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FusedLabel::Averaged(label) | FusedLabel::Fallback(label) => f.write_str(label),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InferenceOutcome {
    pub mask: SegmentationMask,
    /// Unbatched BGR tensor with background zeroed, as fed to the classifier.
    pub masked: Array3<f32>,
    pub probabilities: ClassProbabilities,
    pub metadata_prediction: MetadataPrediction,
    pub fused: FusedLabel,
}

#[derive(Clone)]
pub struct InferencePipeline {
    models: ModelStore,
    mask_threshold: f32,
}

impl InferencePipeline {
    pub fn new(models: ModelStore, mask_threshold: f32) -> Self {
        Self {
            models,
            mask_threshold,
        }
    }

    pub fn run(
        &self,
        image: &PreprocessedImage,
        metadata: &PatientMetadata,
    ) -> Result<InferenceOutcome, ModelError> {
        let raw_mask = self.models.segmentation.segment(image.batched())?;
        let mask = binarize_mask(raw_mask, self.mask_threshold, image.dimensions())?;
        log::debug!("Segmentation mask covers {:.1}% of the image", mask.coverage() * 100.0);

        let masked = apply_mask(&image.tensor, &mask);

        let raw_probs = self
            .models
            .classification
            .classify(masked.view().insert_axis(Axis(0)))?;
        let probabilities = first_row(raw_probs)?;
        let (top_idx, top_conf) = probabilities.top();
        log::debug!("Classifier top class {} ({:.4})", label_for(top_idx), top_conf);

        let metadata_prediction = self.models.metadata.predict(metadata)?;
        log::debug!("Metadata model predicted {:?}", metadata_prediction);

        let fused = fuse(&probabilities, &metadata_prediction);

        Ok(InferenceOutcome {
            mask,
            masked,
            probabilities,
            metadata_prediction,
            fused,
        })
    }
}

/// Takes batch item 0, thresholds it and squeezes singleton axes down to `(H, W)`.
pub fn binarize_mask(
    raw: ArrayD<f32>,
    threshold: f32,
    expected: (usize, usize),
) -> Result<SegmentationMask, ModelError> {
    if raw.ndim() == 0 || raw.shape()[0] == 0 {
        return Err(ModelError::UnexpectedShape(format!(
            "segmentation output {:?} has no batch item",
            raw.shape()
        )));
    }
    let first = raw.index_axis_move(Axis(0), 0);
    let squeezed: Vec<usize> = first.shape().iter().copied().filter(|&d| d != 1).collect();
    let binary = first.mapv(|v| if v > threshold { 1.0 } else { 0.0 });

    let mask = binary
        .into_shape_with_order(squeezed.clone())
        .map_err(|e| ModelError::UnexpectedShape(e.to_string()))?
        .into_dimensionality::<Ix2>()
        .map_err(|_| {
            ModelError::UnexpectedShape(format!("segmentation mask squeezed to {:?}", squeezed))
        })?;

    if mask.dim() != expected {
        return Err(ModelError::UnexpectedShape(format!(
            "segmentation mask {:?} does not match image {:?}",
            mask.dim(),
            expected
        )));
    }
    Ok(SegmentationMask(mask))
}

/// Zeroes every channel outside the mask.
pub fn apply_mask(image: &Array3<f32>, mask: &SegmentationMask) -> Array3<f32> {
    image * &mask.0.view().insert_axis(Axis(2))
}

fn first_row(raw: ArrayD<f32>) -> Result<ClassProbabilities, ModelError> {
    let row: Vec<f32> = match raw.ndim() {
        0 => Vec::new(),
        1 => raw.iter().copied().collect(),
        _ if raw.shape()[0] == 0 => Vec::new(),
        _ => raw.index_axis(Axis(0), 0).iter().copied().collect(),
    };
    if row.len() < LesionClass::COUNT {
        return Err(ModelError::UnexpectedShape(format!(
            "classifier produced {} probabilities, expected {}",
            row.len(),
            LesionClass::COUNT
        )));
    }
    Ok(ClassProbabilities(row))
}

/// Averages a numeric metadata prediction into every class probability and
/// relabels; a non-numeric prediction becomes the label verbatim.
pub fn fuse(probabilities: &ClassProbabilities, prediction: &MetadataPrediction) -> FusedLabel {
    match prediction {
        MetadataPrediction::Numeric { value, .. } => {
            let combined = probabilities.0.iter().map(|&p| (f64::from(p) + value) / 2.0);
            let idx = argmax(combined).map(|(i, _)| i).unwrap_or(0);
            FusedLabel::Averaged(label_for(idx))
        }
        MetadataPrediction::Label(label) => FusedLabel::Fallback(label.clone()),
    }
}

fn label_for(index: usize) -> String {
    LesionClass::from_index(index)
        .map(|class| class.to_string())
        .unwrap_or_else(|| UNKNOWN_LABEL.to_string())
}
