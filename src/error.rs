//! Error types and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Setup-time configuration error. A router that fails with this never accepts traffic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure of a single boot round trip against the control plane
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BootError {
    #[error("failed to create {0} request")]
    RequestConstructionFailed(&'static str),

    #[error("{call} request failed: {reason}")]
    TransportFailed { call: &'static str, reason: String },

    #[error("{call} error: {message}")]
    RemoteRejected { call: &'static str, message: String },

    #[error("failed to decode {call} response: {reason}")]
    DecodeFailed { call: &'static str, reason: String },

    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl BootError {
    /// Short, stable name of the error kind for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            BootError::RequestConstructionFailed(_) => "request_construction_failed",
            BootError::TransportFailed { .. } => "transport_failed",
            BootError::RemoteRejected { .. } => "remote_rejected",
            BootError::DecodeFailed { .. } => "decode_failed",
            BootError::Timeout(_) => "timeout",
        }
    }
}

/// Failure to parse or apply a destination to a dispatch table
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("address is not a valid backend URL: {0}")]
    AddressUnparsable(String),

    #[error("dispatch table update failed: {0}")]
    UpdateFailed(String),
}

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Webspace could not be booted or resolved
    WebspaceBootFailed,
    /// Resolved address could not be turned into a backend URL
    BackendUrlInvalid,
    /// Dispatch table could not be updated
    DispatchUpdateFailed,
    /// Dispatch table has no servers
    NoServers,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::WebspaceBootFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::BackendUrlInvalid => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::DispatchUpdateFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::NoServers => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::WebspaceBootFailed => "WEBSPACE_BOOT_FAILED",
            ProxyErrorCode::BackendUrlInvalid => "BACKEND_URL_INVALID",
            ProxyErrorCode::DispatchUpdateFailed => "DISPATCH_UPDATE_FAILED",
            ProxyErrorCode::NoServers => "NO_SERVERS",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_failures_are_server_errors() {
        for code in [
            ProxyErrorCode::WebspaceBootFailed,
            ProxyErrorCode::BackendUrlInvalid,
            ProxyErrorCode::DispatchUpdateFailed,
        ] {
            assert_eq!(code.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        }
        assert_eq!(
            ProxyErrorCode::NoServers.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(
            ProxyErrorCode::WebspaceBootFailed,
            "Webspace Boot Error: ensure-started error: quota exceeded",
        );
        let json = error.to_json();

        assert!(json.contains("\"code\":\"WEBSPACE_BOOT_FAILED\""));
        assert!(json.contains("quota exceeded"));
        assert!(json.contains("\"status\":500"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }

    #[test]
    fn test_boot_error_display() {
        let err = BootError::RemoteRejected {
            call: "ensure-started",
            message: "booting".to_string(),
        };
        assert_eq!(err.to_string(), "ensure-started error: booting");
        assert_eq!(err.kind(), "remote_rejected");

        let err = BootError::Timeout("webspace boot");
        assert_eq!(err.to_string(), "webspace boot timed out");
    }
}
