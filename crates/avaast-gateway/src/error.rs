//! The client-visible error taxonomy.
//!
//! Every internal failure is normalised to one of these kinds before a
//! response leaves the gateway; stack traces never reach clients. The
//! JSON shape is `{error: <kind>, message}` with the HTTP status
//! mirroring the kind.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XrpcError {
    /// No endpoint registered under this name (404).
    #[error("{0}")]
    MethodNotFound(String),

    /// Malformed body or admin payload (400).
    #[error("{0}")]
    InvalidRequest(String),

    /// Wrong HTTP method for the endpoint kind (405).
    #[error("{0}")]
    MethodMismatch(String),

    /// WebSocket upgrade on a subscription endpoint (501).
    #[error("{0}")]
    NotImplemented(String),

    /// No deploy selectable for this request (503).
    #[error("{0}")]
    ServiceUnavailable(String),

    /// A downstream component returned non-2xx (502).
    #[error("{0}")]
    UpstreamFailure(String),

    /// A downstream component exceeded its budget (502).
    #[error("{0}")]
    UpstreamTimeout(String),

    /// Expression not evaluable on this engine path (400).
    #[error("{0}")]
    UnsupportedExpression(String),

    /// Manifest validation failed (400).
    #[error("{0}")]
    DeployValidation(String),

    /// Embedded database I/O failure (500).
    #[error("{0}")]
    Storage(String),

    /// Anything else (500).
    #[error("{0}")]
    Internal(String),
}

impl XrpcError {
    pub fn status(&self) -> StatusCode {
        match self {
            XrpcError::MethodNotFound(_) => StatusCode::NOT_FOUND,
            XrpcError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            XrpcError::MethodMismatch(_) => StatusCode::METHOD_NOT_ALLOWED,
            XrpcError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            XrpcError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            XrpcError::UpstreamFailure(_) | XrpcError::UpstreamTimeout(_) => {
                StatusCode::BAD_GATEWAY
            }
            XrpcError::UnsupportedExpression(_) | XrpcError::DeployValidation(_) => {
                StatusCode::BAD_REQUEST
            }
            XrpcError::Storage(_) | XrpcError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The wire name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            XrpcError::MethodNotFound(_) => "MethodNotFound",
            XrpcError::InvalidRequest(_) | XrpcError::MethodMismatch(_) => "InvalidRequest",
            XrpcError::NotImplemented(_) => "NotImplemented",
            XrpcError::ServiceUnavailable(_) => "ServiceUnavailable",
            XrpcError::UpstreamFailure(_) => "UpstreamFailure",
            XrpcError::UpstreamTimeout(_) => "UpstreamTimeout",
            XrpcError::UnsupportedExpression(_) => "UnsupportedExpression",
            XrpcError::DeployValidation(_) => "DeployValidationError",
            XrpcError::Storage(_) => "StorageError",
            XrpcError::Internal(_) => "InternalServerError",
        }
    }
}

impl IntoResponse for XrpcError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<avaast_query::QueryError> for XrpcError {
    fn from(e: avaast_query::QueryError) -> Self {
        match e {
            avaast_query::QueryError::UnsupportedExpression(msg) => {
                XrpcError::UnsupportedExpression(msg)
            }
            avaast_query::QueryError::Source(msg) => XrpcError::UpstreamFailure(msg),
            avaast_query::QueryError::Storage(msg) => XrpcError::Storage(msg),
            avaast_query::QueryError::Eval(msg) => XrpcError::Internal(msg),
        }
    }
}

impl From<avaast_deploy::DeployError> for XrpcError {
    fn from(e: avaast_deploy::DeployError) -> Self {
        match e {
            avaast_deploy::DeployError::Validation(msg) => XrpcError::DeployValidation(msg),
            other => XrpcError::Internal(other.to_string()),
        }
    }
}
