//! Error types and HTTP error responses for the router

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Errors loading the procfile or the persisted project config
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No procfile found at {}", .0.display())]
    MissingProcfile(PathBuf),

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config at {}: {source}", path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from free-port probing
#[derive(Debug, Error)]
pub enum PortError {
    #[error("Could not find an available port after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors decoding a control-channel message
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid router action {raw}: {source}")]
    Malformed {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown router action {0}")]
    UnknownType(String),

    #[error("Invalid route for {host}: port must be between 1 and 65535")]
    InvalidPort { host: String },
}

/// Error codes for router responses
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No route registered for the host
    UnknownHost,
    /// Failed to connect to the backend process
    ConnectionFailed,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Value for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

/// Body format picked from the client's Accept header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Html,
    Json,
    Text,
}

impl BodyFormat {
    /// Browsers name text/html explicitly, API clients name application/json.
    /// Anything else (including `*/*` or no Accept header) gets plain text.
    pub fn negotiate(headers: &HeaderMap) -> Self {
        let accept = headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(",")
            .to_ascii_lowercase();

        if accept.contains("text/html") {
            BodyFormat::Html
        } else if accept.contains("application/json") {
            BodyFormat::Json
        } else {
            BodyFormat::Text
        }
    }
}

#[derive(Debug, Serialize)]
struct MessageBody<'a> {
    message: &'a str,
}

/// Wrap a message in a small standalone HTML page
pub fn html_message(message: &str) -> String {
    let escaped = message
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");

    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8">
    <title>{escaped}</title>
    <style>
      body {{ font-family: monospace; background: #222; color: #eee; text-align: center; padding-top: 10em; }}
      h1 {{ font-size: 2em; font-weight: normal; }}
    </style>
  </head>
  <body>
    <h1>{escaped}</h1>
  </body>
</html>
"#
    )
}

/// Build an error response whose body format follows the request's Accept header
pub fn negotiated_error_response(
    code: ProxyErrorCode,
    message: &str,
    format: BodyFormat,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (content_type, body) = match format {
        BodyFormat::Html => ("text/html; charset=utf-8", html_message(message)),
        BodyFormat::Json => (
            "application/json",
            serde_json::to_string(&MessageBody { message })
                .unwrap_or_else(|_| format!(r#"{{"message":"{}"}}"#, message.replace('"', "\\\""))),
        ),
        BodyFormat::Text => ("text/plain; charset=utf-8", message.to_string()),
    };

    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, content_type)
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// The 404 returned when no route matches the request's host
pub fn unknown_host_response(
    hostname: &str,
    format: BodyFormat,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    negotiated_error_response(
        ProxyErrorCode::UnknownHost,
        &format!("Unknown host {}", hostname),
        format,
    )
}
