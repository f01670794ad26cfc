use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the rotor proxy server
#[derive(Error, Debug)]
pub enum RotorError {
    // Configuration errors, fatal at startup
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Proxy list errors
    #[error("Invalid proxy entry: {0}")]
    InvalidProxyEntry(String),

    #[error("Unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Proxy list contains no valid entries")]
    EmptyPool,

    // Rotation errors
    #[error("No alive upstream proxies")]
    NoAliveUpstreams,

    #[error("No active upstream proxy")]
    NoActiveUpstream,

    // Upstream dial errors
    #[error("Upstream dial failed: {0}")]
    Dial(String),

    #[error("Upstream proxy refused CONNECT: {0}")]
    UpstreamRefused(String),

    // Client-side errors
    #[error("Proxy authentication failed")]
    AuthenticationFailed,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for rotor operations
pub type Result<T> = std::result::Result<T, RotorError>;

impl RotorError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            RotorError::InvalidRequest(_)
            | RotorError::InvalidProxyEntry(_)
            | RotorError::UnsupportedScheme(_)
            | RotorError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 407 Proxy Authentication Required
            RotorError::AuthenticationFailed => StatusCode::PROXY_AUTHENTICATION_REQUIRED,

            // 502 Bad Gateway
            RotorError::Dial(_) | RotorError::UpstreamRefused(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            RotorError::NoAliveUpstreams | RotorError::NoActiveUpstream | RotorError::EmptyPool => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 500 Internal Server Error
            RotorError::Io(_) | RotorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Implement IntoResponse for API error responses
impl IntoResponse for RotorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RotorError {
    fn from(err: url::ParseError) -> Self {
        RotorError::InvalidProxyEntry(err.to_string())
    }
}

// The rotator counts every dial failure uniformly, so the SOCKS detail is
// folded into the dial error message.
impl From<tokio_socks::Error> for RotorError {
    fn from(err: tokio_socks::Error) -> Self {
        RotorError::Dial(format!("socks5: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            RotorError::InvalidRequest("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RotorError::AuthenticationFailed.status_code(),
            StatusCode::PROXY_AUTHENTICATION_REQUIRED
        );
        assert_eq!(
            RotorError::Dial("refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RotorError::UpstreamRefused("403 Forbidden".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RotorError::NoActiveUpstream.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RotorError::NoAliveUpstreams.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_client_server_helpers() {
        assert!(RotorError::InvalidRequest("bad".to_string()).is_client_error());
        assert!(!RotorError::InvalidRequest("bad".to_string()).is_server_error());

        assert!(RotorError::NoAliveUpstreams.is_server_error());
        assert!(!RotorError::NoAliveUpstreams.is_client_error());
    }
}
