use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Lesion types, in the order the classifier emits probabilities.
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumIter,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LesionClass {
    Bkl,
    Nv,
    Df,
    Mel,
    Vasc,
    Bcc,
    Akiec,
}

impl LesionClass {
    pub const COUNT: usize = 7;

    /// Label for a classifier output index, if the index is in range.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::iter().nth(index)
    }

    pub fn labels() -> Vec<String> {
        Self::iter().map(|class| class.to_string()).collect()
    }
}

/// Patient attributes sent alongside the image. Absent form fields are empty.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PatientMetadata {
    #[serde(default)]
    pub dx_type: String,
    #[serde(default)]
    pub age: String,
    #[serde(default)]
    pub sex: String,
    #[serde(default)]
    pub localization: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PredictResponse {
    pub plot_image: String,
    pub cnn_output: String,
    pub all_class_probabilities: String,
    pub nlp_output: String,
    pub segmentation_output: String,
    pub final_output: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}
