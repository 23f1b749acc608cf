use crate::pipeline::InferenceOutcome;
use lesion_shared::PredictResponse;

pub const SEGMENTATION_SUMMARY: &str = "U-Net Segmentation Applied";

pub fn assemble(outcome: &InferenceOutcome, plot_image: String) -> PredictResponse {
    let (_, confidence) = outcome.probabilities.top();
    PredictResponse {
        plot_image,
        cnn_output: format!(
            "Predicted Class: {} (Confidence: {:.2})",
            outcome.probabilities.top_label(),
            confidence
        ),
        all_class_probabilities: outcome.probabilities.breakdown(),
        nlp_output: format!("NLP Prediction: {}", outcome.metadata_prediction),
        segmentation_output: SEGMENTATION_SUMMARY.to_string(),
        final_output: format!(
            "This disease is most probably classified as: {}",
            outcome.fused
        ),
    }
}
