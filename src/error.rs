//! Error handling and JSON error responses for the router

use crate::ProxyBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error};

/// Message shown when a project has been configured incorrectly
pub const SETUP_BROKEN_MESSAGE: &str = "Uh oh! Something about this project has been setup incorrectly.";
/// Message shown for every other failure
pub const UNEXPECTED_MESSAGE: &str = "Uh oh! Something unexpected happened.";

/// Errors produced while routing or activating microservices
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown source/environment kind, broken dependency graph, missing port...
    #[error("configuration error: {0}")]
    Config(String),

    /// The request carried no usable Host header
    #[error("missing or invalid Host header")]
    MissingHost,

    /// No project is registered under the host's project label
    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    /// The project exists but no match pattern accepts the query
    #[error("service '{query}' not found in project '{project}'")]
    ServiceNotFound { project: String, query: String },

    /// Fetching, installing, spawning or waiting for the backend failed
    #[error("activation of '{service}' failed: {reason}")]
    Activation { service: String, reason: String },

    /// The microservice was deactivated between launch and dispatch
    #[error("service '{0}' is not active")]
    Unavailable(String),

    /// The environment cannot take over raw connections
    #[error("environment of '{0}' does not accept connection upgrades")]
    UpgradeUnsupported(String),

    /// Forwarding to the backend failed
    #[error("proxy error: {0}")]
    Proxy(String),

    /// The backend did not answer in time
    #[error("backend did not respond within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type using the router [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub fn activation(service: &str, reason: impl std::fmt::Display) -> Self {
        Error::Activation {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Routing misses are normal outcomes rather than failures
    pub fn is_routing_miss(&self) -> bool {
        matches!(self, Error::ProjectNotFound(_) | Error::ServiceNotFound { .. })
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Config(_) => ErrorCode::ConfigError,
            Error::MissingHost => ErrorCode::MissingHostHeader,
            Error::ProjectNotFound(_) => ErrorCode::ProjectNotFound,
            Error::ServiceNotFound { .. } => ErrorCode::ServiceNotFound,
            Error::Activation { .. } => ErrorCode::ActivationFailed,
            Error::Unavailable(_) => ErrorCode::ServiceUnavailable,
            Error::UpgradeUnsupported(_) => ErrorCode::UpgradeUnsupported,
            Error::Proxy(_) => ErrorCode::ConnectionFailed,
            Error::Timeout(_) => ErrorCode::RequestTimeout,
            Error::Io(_) | Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// The message shown to clients. Internal detail never leaves the process.
    pub fn public_message(&self) -> String {
        match self {
            Error::ProjectNotFound(project) => format!("Project '{}' not found", project),
            Error::ServiceNotFound { query, .. } => format!("Service '{}' not found", query),
            Error::Config(_) => SETUP_BROKEN_MESSAGE.to_string(),
            Error::MissingHost => "Missing or invalid Host header".to_string(),
            _ => UNEXPECTED_MESSAGE.to_string(),
        }
    }

    /// Render this error as a JSON error response
    pub fn into_response(self) -> Response<ProxyBody> {
        json_error_response(self.code(), self.public_message())
    }
}

/// Error codes reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No project for the host
    ProjectNotFound,
    /// No microservice for the sub-path
    ServiceNotFound,
    /// The project is set up incorrectly
    ConfigError,
    /// The microservice failed to start
    ActivationFailed,
    /// The microservice went away mid-request
    ServiceUnavailable,
    /// The environment does not handle upgrades
    UpgradeUnsupported,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Internal router error
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ErrorCode::ProjectNotFound => StatusCode::NOT_FOUND,
            ErrorCode::ServiceNotFound => StatusCode::NOT_FOUND,
            ErrorCode::ConfigError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ActivationFailed => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::UpgradeUnsupported => StatusCode::NOT_IMPLEMENTED,
            ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Router-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ErrorCode::ProjectNotFound => "PROJECT_NOT_FOUND",
            ErrorCode::ServiceNotFound => "SERVICE_NOT_FOUND",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::ActivationFailed => "ACTIVATION_FAILED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::UpgradeUnsupported => "UPGRADE_UNSUPPORTED",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Router-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response.headers_mut().insert(
        "x-router-error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

/// How the failed work reached the router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Plain request: failures become error responses
    Request,
    /// Connection upgrade: failures tear the connection down
    Upgrade,
}

/// Settle the outcome of a request or upgrade handler.
///
/// The error is logged in full first. Requests get a rendered error response;
/// upgrades get the error back so the caller drops the connection.
pub fn settle(dispatch: Dispatch, result: Result<Response<ProxyBody>>) -> Result<Response<ProxyBody>> {
    let err = match result {
        Ok(response) => return Ok(response),
        Err(err) => err,
    };

    if err.is_routing_miss() {
        debug!(?dispatch, error = %err, "Routing miss");
    } else {
        error!(?dispatch, error = ?err, "Dispatch failed");
    }

    match dispatch {
        Dispatch::Request => Ok(err.into_response()),
        Dispatch::Upgrade => Err(err),
    }
}
