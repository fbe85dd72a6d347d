//! Error handling and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Client exceeded the rate limit
    RateLimited,
    /// Request body exceeded the configured limit
    PayloadTooLarge,
    /// No rule matched, or a worker reported a routing failure
    RouteNotFound,
    /// A static rule pointed at a missing or escaping file
    StaticFileNotFound,
    /// The worker pool is empty
    NoWorkerAvailable,
    /// The worker reported an upstream or configuration failure
    UpstreamError,
    /// No reply from the worker within the reply timeout
    WorkerTimeout,
    /// The worker exited before replying
    WorkerLost,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::StaticFileNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::NoWorkerAvailable => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::UpstreamError => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::WorkerTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::WorkerLost => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Classify a status relayed from a worker reply
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::NOT_FOUND => GatewayErrorCode::RouteNotFound,
            StatusCode::GATEWAY_TIMEOUT => GatewayErrorCode::WorkerTimeout,
            _ => GatewayErrorCode::UpstreamError,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::RateLimited => "RATE_LIMITED",
            GatewayErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            GatewayErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            GatewayErrorCode::StaticFileNotFound => "STATIC_FILE_NOT_FOUND",
            GatewayErrorCode::NoWorkerAvailable => "NO_WORKER_AVAILABLE",
            GatewayErrorCode::UpstreamError => "UPSTREAM_ERROR",
            GatewayErrorCode::WorkerTimeout => "WORKER_TIMEOUT",
            GatewayErrorCode::WorkerLost => "WORKER_LOST",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
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

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_error_response_with_status(code, code.status_code(), message)
}

/// Create a JSON error response with an explicit status (for relayed worker errors)
pub fn json_error_response_with_status(
    code: GatewayErrorCode,
    status: StatusCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, status, message).to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode and static headers")
}
