//! Error types for forgefed
//!
//! Every failure inside the federation core is a `FederationError`.
//! Inbound processing wraps errors in a [`Rejection`], the
//! `(status, label, error)` triple the HTTP boundary renders verbatim.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::metrics::ERRORS_TOTAL;

/// Federation-wide error type
#[derive(Debug, Error)]
pub enum FederationError {
    /// Malformed or ambiguous actor/repository URI (406)
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Structurally invalid activity (406)
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Signature could not be verified, or the signer key could not be fetched (400)
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Discovery or profile fetch failed (500)
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Stale Like activity (406)
    #[error("Activity out of order: {0}")]
    OutOfOrder(String),

    /// Like object does not match the destination repository (406)
    #[error("Object mismatch: {0}")]
    ObjectMismatch(String),

    /// Transport or HTTP error during an outbound send (502)
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// Local entity not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FederationError {
    /// HTTP status used when the error surfaces at the inbound boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            FederationError::InvalidIdentity(_)
            | FederationError::ValidationFailed(_)
            | FederationError::OutOfOrder(_)
            | FederationError::ObjectMismatch(_) => StatusCode::NOT_ACCEPTABLE,
            FederationError::AuthenticationFailed(_) => StatusCode::BAD_REQUEST,
            FederationError::NotFound => StatusCode::NOT_FOUND,
            FederationError::DeliveryFailed(_) => StatusCode::BAD_GATEWAY,
            FederationError::RemoteUnavailable(_)
            | FederationError::Database(_)
            | FederationError::Config(_)
            | FederationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable kind, used as a metric label.
    pub fn error_type(&self) -> &'static str {
        match self {
            FederationError::InvalidIdentity(_) => "invalid_identity",
            FederationError::ValidationFailed(_) => "validation_failed",
            FederationError::AuthenticationFailed(_) => "authentication_failed",
            FederationError::RemoteUnavailable(_) => "remote_unavailable",
            FederationError::OutOfOrder(_) => "out_of_order",
            FederationError::ObjectMismatch(_) => "object_mismatch",
            FederationError::DeliveryFailed(_) => "delivery_failed",
            FederationError::NotFound => "not_found",
            FederationError::Database(_) => "database",
            FederationError::Config(_) => "config",
            FederationError::Internal(_) => "internal",
        }
    }

    /// Message safe to show to a remote caller.
    fn public_message(&self) -> String {
        match self {
            FederationError::Database(_) => "Database error".to_string(),
            FederationError::Internal(_) => "Internal server error".to_string(),
            FederationError::RemoteUnavailable(_) => "Remote server unavailable".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<config::ConfigError> for FederationError {
    fn from(err: config::ConfigError) -> Self {
        FederationError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for FederationError {
    fn from(err: serde_json::Error) -> Self {
        FederationError::Internal(anyhow::Error::new(err))
    }
}

impl IntoResponse for FederationError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        ERRORS_TOTAL.with_label_values(&[self.error_type()]).inc();

        let body = Json(serde_json::json!({
            "error": self.public_message(),
        }));

        (status, body).into_response()
    }
}

/// A failed inbound activity: status, short label and cause.
///
/// The processor never writes responses itself; the HTTP layer turns a
/// rejection into one without reinterpreting it.
#[derive(Debug)]
pub struct Rejection {
    pub status: StatusCode,
    pub label: &'static str,
    pub error: FederationError,
}

impl Rejection {
    pub fn new(status: StatusCode, label: &'static str, error: FederationError) -> Self {
        Self {
            status,
            label,
            error,
        }
    }

    /// Build a rejection whose status follows the error kind.
    pub fn from_error(label: &'static str, error: FederationError) -> Self {
        Self::new(error.status_code(), label, error)
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.label, self.status, self.error)
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        ERRORS_TOTAL
            .with_label_values(&[self.error.error_type()])
            .inc();

        let mut body = serde_json::json!({ "error": self.label });
        if self.status.is_client_error() {
            body["detail"] = serde_json::Value::String(self.error.public_message());
        }

        (self.status, Json(body)).into_response()
    }
}

/// Result type alias using FederationError
pub type Result<T> = std::result::Result<T, FederationError>;
