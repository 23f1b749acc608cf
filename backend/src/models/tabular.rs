//! Tabular metadata model.
//!
//! The artifact is a JSON export of a one-hot encoded linear model over the
//! four patient fields. A model with `classes` acts as a classifier (argmax
//! over per-class scores), otherwise as a single-output regressor.

use super::{MetadataPrediction, MetadataPredictor, ModelError, argmax};
use lesion_shared::PatientMetadata;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

pub const FIELD_NAMES: [&str; 4] = ["dx_type", "age", "sex", "localization"];

#[derive(Debug, Clone, Deserialize)]
pub struct NumericFeature {
    pub mean: f64,
    #[serde(default = "unit_scale")]
    pub scale: f64,
    pub weights: Vec<f64>,
}

fn unit_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct TabularModel {
    #[serde(default)]
    pub categorical: HashMap<String, HashMap<String, Vec<f64>>>,
    #[serde(default)]
    pub numeric: HashMap<String, NumericFeature>,
    pub intercept: Vec<f64>,
    #[serde(default)]
    pub classes: Option<Vec<String>>,
}

impl TabularModel {
    pub fn from_path(path: &Path) -> Result<Self, ModelError> {
        let load_error = |reason: String| ModelError::Load {
            path: path.to_path_buf(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        Self::from_json(&raw).map_err(|e| match e {
            ModelError::Load { reason, .. } => load_error(reason),
            other => other,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, ModelError> {
        let model: TabularModel = serde_json::from_str(raw).map_err(|e| ModelError::Load {
            path: "<inline>".into(),
            reason: e.to_string(),
        })?;
        model.check()?;
        Ok(model)
    }

    fn outputs(&self) -> usize {
        self.intercept.len()
    }

    fn check(&self) -> Result<(), ModelError> {
        let invalid = |reason: String| ModelError::Load {
            path: "<inline>".into(),
            reason,
        };
        if self.outputs() == 0 {
            return Err(invalid("intercept must not be empty".to_string()));
        }
        match &self.classes {
            Some(classes) if classes.len() != self.outputs() => {
                return Err(invalid(format!(
                    "{} classes but {} intercepts",
                    classes.len(),
                    self.outputs()
                )));
            }
            None if self.outputs() != 1 => {
                return Err(invalid("a regressor has exactly one output".to_string()));
            }
            _ => {}
        }

        let known = |name: &str| FIELD_NAMES.contains(&name);
        for (name, categories) in &self.categorical {
            if !known(name) {
                return Err(invalid(format!("unknown feature '{}'", name)));
            }
            for (category, weights) in categories {
                if weights.len() != self.outputs() {
                    return Err(invalid(format!(
                        "{}={} has {} weights, expected {}",
                        name,
                        category,
                        weights.len(),
                        self.outputs()
                    )));
                }
            }
        }
        for (name, feature) in &self.numeric {
            if !known(name) {
                return Err(invalid(format!("unknown feature '{}'", name)));
            }
            if feature.weights.len() != self.outputs() {
                return Err(invalid(format!(
                    "{} has {} weights, expected {}",
                    name,
                    feature.weights.len(),
                    self.outputs()
                )));
            }
            if feature.scale == 0.0 {
                return Err(invalid(format!("{} has zero scale", name)));
            }
        }
        Ok(())
    }

    /// Raw per-output scores for a single record.
    pub fn scores(&self, metadata: &PatientMetadata) -> Vec<f64> {
        let mut scores = self.intercept.clone();
        for (name, value) in record(metadata) {
            if let Some(weights) = self
                .categorical
                .get(name)
                .and_then(|categories| categories.get(value.trim()))
            {
                add_scaled(&mut scores, weights, 1.0);
            }
            if let Some(feature) = self.numeric.get(name) {
                let x = value.trim().parse::<f64>().unwrap_or(feature.mean);
                add_scaled(&mut scores, &feature.weights, (x - feature.mean) / feature.scale);
            }
        }
        scores
    }
}

impl MetadataPredictor for TabularModel {
    fn predict(&self, metadata: &PatientMetadata) -> Result<MetadataPrediction, ModelError> {
        let scores = self.scores(metadata);
        match &self.classes {
            Some(classes) => {
                let best = argmax(scores.iter().copied())
                    .map(|(i, _)| i)
                    .ok_or_else(|| ModelError::Inference("empty score vector".to_string()))?;
                let label = classes
                    .get(best)
                    .ok_or_else(|| {
                        ModelError::UnexpectedShape(format!("no class at index {}", best))
                    })?;
                Ok(MetadataPrediction::from_raw(label))
            }
            None => scores
                .first()
                .copied()
                .map(MetadataPrediction::numeric)
                .ok_or_else(|| ModelError::Inference("empty score vector".to_string())),
        }
    }
}

/// Single-row record with fixed column names.
fn record(metadata: &PatientMetadata) -> [(&'static str, &str); 4] {
    [
        (FIELD_NAMES[0], metadata.dx_type.as_str()),
        (FIELD_NAMES[1], metadata.age.as_str()),
        (FIELD_NAMES[2], metadata.sex.as_str()),
        (FIELD_NAMES[3], metadata.localization.as_str()),
    ]
}

fn add_scaled(scores: &mut [f64], weights: &[f64], factor: f64) {
    for (score, weight) in scores.iter_mut().zip(weights) {
        *score += weight * factor;
    }
}
