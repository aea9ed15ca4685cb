use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::predictor::PredictorError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{message}. Supported media types: {}", supported.join(", "))]
    BadRequest {
        message: String,
        supported: Vec<String>,
    },

    #[error(transparent)]
    Predictor(#[from] PredictorError),

    #[error("Model is not loaded yet")]
    NotReady,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
    pub fn config(msg: impl Into<String>) -> Self {
        ServerError::Config(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ServerError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Config(_) | ServerError::Predictor(_) | ServerError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "detail": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}
