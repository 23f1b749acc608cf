use crate::models::ModelError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use lesion_shared::ErrorResponse;

pub const REDACTED_MESSAGE: &str = "Internal server error";

#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("No image provided")]
    MissingInput,
    #[error("Image exceeds the {limit} byte upload limit")]
    PayloadTooLarge { limit: usize },
    #[error("Could not read image from path: {0}")]
    UnreadableImage(String),
    #[error("Failed to store upload: {0}")]
    Upload(#[from] std::io::Error),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Failed to render visualization: {0}")]
    Visualization(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PredictError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PredictError::MissingInput => StatusCode::BAD_REQUEST,
            PredictError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Replaces server-side detail with a fixed message. Client errors pass through.
    pub fn redacted(self) -> TransportError {
        let status = self.status_code();
        let message = if status.is_server_error() {
            REDACTED_MESSAGE.to_string()
        } else {
            self.to_string()
        };
        TransportError { status, message }
    }

    pub fn into_transport(self) -> TransportError {
        TransportError {
            status: self.status_code(),
            message: self.to_string(),
        }
    }
}

/// The error as it leaves the process: a status and the message the caller sees.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    status: StatusCode,
    message: String,
}

impl ResponseError for TransportError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status).json(ErrorResponse {
            error: self.message.clone(),
        })
    }
}
