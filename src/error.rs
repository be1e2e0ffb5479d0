//! # Error Handling
//!
//! Two families of errors live here:
//!
//! 1. **Pipeline errors** (`AnalysisError`, `ReferenceLoadError`, `SinkError`,
//!    `PublishError`): typed failures of the correlation pipeline. They are derived
//!    with `thiserror` so every variant carries its own `Display` text.
//! 2. **HTTP errors** (`AppError`): what the operational endpoints return to API
//!    clients, converted into JSON responses by actix.
//!
//! ## Propagation Policy:
//! - Per-chunk errors (`AnalysisError`, `PublishError`) are caught at the chunk
//!   boundary by the session controller and only ever reach the logs.
//! - `ReferenceLoadError` is the only pipeline error allowed to abort startup.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Failure to turn one inbound chunk into an analysis event.
///
/// ## Scope:
/// Always local to a single chunk. The session logs it and moves on to the next
/// chunk, including chunks from other sensors on the same connection.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The chunk's PCM bytes cannot be read as 16-bit little-endian audio
    #[error("decode error: {0}")]
    Decode(String),

    /// The decoded chunk rate disagrees with the reference rate
    #[error("sample rate mismatch: chunk is {chunk} Hz, reference is {reference} Hz")]
    RateMismatch { chunk: u32, reference: u32 },

    /// The original PCM could not be re-encoded into a WAV container
    #[error("wav encode error: {0}")]
    Encode(#[from] hound::Error),
}

impl AnalysisError {
    /// Short machine-readable label used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::Decode(_) => "decode_error",
            AnalysisError::RateMismatch { .. } => "rate_mismatch_error",
            AnalysisError::Encode(_) => "encode_error",
        }
    }
}

/// Failure to load the reference signal at process start. Always fatal.
#[derive(Debug, Error)]
pub enum ReferenceLoadError {
    /// File missing, unreadable, or not a valid WAV container
    #[error("cannot read reference wav: {0}")]
    Wav(#[from] hound::Error),

    /// The file's rate differs from the pipeline rate (no resampling is done)
    #[error("reference sample rate is {found} Hz, pipeline requires {expected} Hz")]
    RateMismatch { found: u32, expected: u32 },

    /// Sample layout the loader does not understand
    #[error("unsupported reference format: {0}")]
    UnsupportedFormat(String),

    /// The reference holds no samples at all
    #[error("reference signal is empty")]
    Empty,
}

/// Errors raised by a durable sink client.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink cannot be reached (connection lost, closed, timed out)
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// The sink refused the message (e.g. undeclared destination)
    #[error("sink rejected message: {0}")]
    Rejected(String),

    /// Local I/O failure while handing the message over
    #[error("sink i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a publish attempt did not deliver its event.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("cannot serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Custom error types for the HTTP endpoints.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ConfigError**: Configuration problems (500 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts an `AppError` into a JSON HTTP response.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "bad_request",
///     "message": "Invalid JSON",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, hence 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
