//! Proxy error kinds and the JSON error responses sent to clients.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::fmt;
use std::io;

/// Response body type used across the HTTP data plane.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// A dial-phase failure. No request bytes have been sent when this is
/// returned, so the HTTP pipeline may safely retry another backend.
#[derive(Debug)]
pub enum DialError {
    /// No backend with this address is registered on the service.
    NoBackend(String),
    /// TCP connect failed.
    Connect(io::Error),
    /// TCP connect exceeded the dial timeout.
    Timeout(String),
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialError::NoBackend(addr) => write!(f, "no backend matching {}", addr),
            DialError::Connect(e) => write!(f, "connect failed: {}", e),
            DialError::Timeout(addr) => write!(f, "connect to {} timed out", addr),
        }
    }
}

impl std::error::Error for DialError {}

/// Terminal pipeline failure for one proxied HTTP request.
#[derive(Debug)]
pub enum ProxyError {
    /// Every candidate address failed at the dial phase, or none were given.
    NoBackends(Option<DialError>),
    /// The upstream connection failed after the request started flowing.
    Upstream(hyper::Error),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::NoBackends(Some(last)) => write!(f, "no backend available: {}", last),
            ProxyError::NoBackends(None) => write!(f, "no backend available"),
            ProxyError::Upstream(e) => write!(f, "upstream error: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {}

/// Error codes surfaced to clients on proxy failures.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No backend could be dialed for this request.
    NoBackendAvailable,
    /// A backend accepted the connection but the exchange failed.
    BackendFailed,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NoBackendAvailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BackendFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Code string for the X-Proxy-Error header.
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NoBackendAvailable => "NO_BACKEND_AVAILABLE",
            ProxyErrorCode::BackendFailed => "BACKEND_FAILED",
        }
    }
}

impl From<&ProxyError> for ProxyErrorCode {
    fn from(err: &ProxyError) -> Self {
        match err {
            ProxyError::NoBackends(_) => ProxyErrorCode::NoBackendAvailable,
            ProxyError::Upstream(_) => ProxyErrorCode::BackendFailed,
        }
    }
}

/// JSON error body paired with the X-Proxy-Error header.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: ProxyErrorCode,
    message: String,
    status: u16,
}

/// Build the JSON error response returned when proxying fails.
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let status = code.status_code();
    let error = ErrorResponse {
        code,
        message: message.into(),
        status: status.as_u16(),
    };
    let body = serde_json::to_string(&error).unwrap_or_else(|_| {
        format!(
            r#"{{"code":"{}","message":"proxy error","status":{}}}"#,
            code.as_header_value(),
            status.as_u16()
        )
    });

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_errors_display_their_address() {
        let err = DialError::NoBackend("10.0.0.1:9000".to_string());
        assert!(err.to_string().contains("10.0.0.1:9000"));
    }

    #[test]
    fn json_error_response_shape() {
        let resp = json_error_response(ProxyErrorCode::NoBackendAvailable, "all dials failed");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            resp.headers().get("X-Proxy-Error").unwrap(),
            "NO_BACKEND_AVAILABLE"
        );
        assert_eq!(
            resp.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }
}
