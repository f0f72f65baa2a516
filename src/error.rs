//! Error taxonomy for story generation and its mapping onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::genai::GenAiError;
use crate::store::StoreError;

/// Message returned for any upstream failure. Internal detail is logged, never
/// sent to the client.
pub const GENERIC_UPSTREAM_MESSAGE: &str = "could not generate the story, please try again";

#[derive(Debug, thiserror::Error)]
pub enum StoryError {
    /// Client fixable: a field is missing, has the wrong type or is too long.
    #[error("{0}")]
    InvalidInput(String),
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("too many requests")]
    RateLimited,
    /// The model refused the topic. The reason is surfaced verbatim.
    #[error("{0}")]
    PolicyRejected(String),
    /// Operator fixable: the generation credential is missing.
    #[error("service not configured")]
    Unconfigured,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),
    #[error("story not found")]
    NotFound,
    #[error("request too large")]
    PayloadTooLarge,
    #[error("audio could not be generated")]
    AudioUnavailable,
}

/// JSON body of every error response.
#[derive(Debug, Serialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
}

impl StoryError {
    pub fn status(&self) -> StatusCode {
        match self {
            StoryError::InvalidInput(_) | StoryError::PolicyRejected(_) => StatusCode::BAD_REQUEST,
            StoryError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            StoryError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            StoryError::Unconfigured | StoryError::Upstream(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            StoryError::PersistenceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoryError::NotFound => StatusCode::NOT_FOUND,
            StoryError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            StoryError::AudioUnavailable => StatusCode::BAD_GATEWAY,
        }
    }

    /// Stable outcome label for telemetry lines.
    pub fn kind(&self) -> &'static str {
        match self {
            StoryError::InvalidInput(_) => "invalid_input",
            StoryError::MethodNotAllowed => "method_not_allowed",
            StoryError::RateLimited => "rate_limited",
            StoryError::PolicyRejected(_) => "policy_rejected",
            StoryError::Unconfigured => "unconfigured",
            StoryError::Upstream(_) => "upstream_error",
            StoryError::PersistenceUnavailable(_) => "persistence_unavailable",
            StoryError::NotFound => "not_found",
            StoryError::PayloadTooLarge => "payload_too_large",
            StoryError::AudioUnavailable => "audio_unavailable",
        }
    }

    /// Client-visible message. Upstream and persistence details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            StoryError::Upstream(_) => GENERIC_UPSTREAM_MESSAGE.to_string(),
            StoryError::PersistenceUnavailable(_) => "story storage is unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for StoryError {
    fn into_response(self) -> Response {
        match &self {
            StoryError::Upstream(detail) => {
                tracing::error!(error = %detail, "story generation failed upstream");
            }
            StoryError::PersistenceUnavailable(detail) => {
                tracing::warn!(error = %detail, "story store unavailable");
            }
            _ => {}
        }
        let body = ErrorResponse {
            error: self.public_message(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<GenAiError> for StoryError {
    fn from(err: GenAiError) -> Self {
        StoryError::Upstream(err.to_string())
    }
}

impl From<StoreError> for StoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => StoryError::NotFound,
            other => StoryError::PersistenceUnavailable(other.to_string()),
        }
    }
}
