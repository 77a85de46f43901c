use axum::{
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;

// Server failed to start up due to bad config
#[derive(Debug, thiserror::Error)]
#[error("Configuration error: {0}")]
pub struct ConfigurationError(pub String);

/// Errors surfaced while dispatching a single inference request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("no endpoint: {0}")]
    NoEndpoint(String),
    #[error("timed out waiting for an endpoint")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("upstream: {0}")]
    Upstream(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::NoEndpoint(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::Upstream(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the caller. Server-side failures only expose the
    /// canonical status text.
    pub fn public_message(&self) -> String {
        public_message(self.status_code(), &self.to_string())
    }

    pub fn to_body(&self) -> Bytes {
        error_body(self.status_code(), &self.to_string())
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        error_response(self.status_code(), &self.to_string())
    }
}

pub(crate) fn public_message(status: StatusCode, message: &str) -> String {
    if status.is_server_error() {
        status
            .canonical_reason()
            .unwrap_or("Internal Server Error")
            .to_string()
    } else {
        message.to_string()
    }
}

/// JSON error body `{"error": "<message>"}`.
pub fn error_body(status: StatusCode, message: &str) -> Bytes {
    let body = serde_json::json!({ "error": public_message(status, message) });
    Bytes::from(body.to_string())
}

pub fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        [(CONTENT_TYPE, "application/json")],
        error_body(status, message),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            DispatchError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DispatchError::ModelNotFound("m".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            DispatchError::NoEndpoint("m".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(DispatchError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            DispatchError::Cancelled.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_server_errors_hide_details() {
        let err = DispatchError::Internal("connection refused to 10.0.0.3".into());
        assert_eq!(err.public_message(), "Internal Server Error");

        let body: serde_json::Value = serde_json::from_slice(&err.to_body()).unwrap();
        assert_eq!(body, serde_json::json!({"error": "Internal Server Error"}));
    }

    #[test]
    fn test_client_errors_are_descriptive() {
        let err = DispatchError::BadRequest("missing model".into());
        assert_eq!(err.public_message(), "bad request: missing model");
    }
}
