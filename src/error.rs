//! Startup configuration errors and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Fatal problems detected before any port is bound or process spawned
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "server list not found at {}. Create one with the format:\n{{\n  \"mcpServers\": {{\n    \"server-name\": {{\n      \"command\": \"npx\",\n      \"args\": [\"-y\", \"mcp-server\"],\n      \"env\": {{ \"API_KEY\": \"value\" }}\n    }}\n  }}\n}}",
        .path.display()
    )]
    NotFound { path: PathBuf },

    #[error("failed to read {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {}: {message}", .path.display())]
    InvalidJson { path: PathBuf, message: String },

    #[error("invalid TOML in {}: {message}", .path.display())]
    InvalidToml { path: PathBuf, message: String },

    #[error("{} contains no servers under `mcpServers`", .path.display())]
    NoServers { path: PathBuf },

    #[error("server '{name}': `command` must be a non-empty string")]
    EmptyCommand { name: String },

    #[error(
        "server '{name}': names may only contain ASCII letters, digits, '-', '_' and '.' because they are used as URL path segments"
    )]
    InvalidName { name: String },

    #[error("servers '{first}' and '{second}' both normalize to the route name '{normalized}'")]
    DuplicateName {
        first: String,
        second: String,
        normalized: String,
    },

    #[error("server '{name}': the name '{normalized}' is reserved for the local tools routes")]
    ReservedName { name: String, normalized: String },

    #[error("{count} servers starting at base port {base} exceed the highest port 65535")]
    PortRangeExhausted { base: u16, count: usize },

    #[error("environment variable {var}={value:?} is invalid: expected {expected}")]
    InvalidSetting {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No route matches the request path
    RouteNotFound,
    /// Upgrade requested on a route that does not relay upgrades
    UpgradeNotSupported,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Backend refused or botched the upgrade handshake
    UpgradeFailed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::UpgradeNotSupported => StatusCode::BAD_REQUEST,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpgradeFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ProxyErrorCode::UpgradeNotSupported => "UPGRADE_NOT_SUPPORTED",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::UpgradeFailed => "UPGRADE_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
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
