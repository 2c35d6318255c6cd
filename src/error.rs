//! # Error Handling
//!
//! Two layers of errors live here:
//! - **AppError**: what the signaling endpoint returns to HTTP clients
//! - **PipelineError**: what goes wrong inside a session (worker links, media, negotiation)
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Enums for Error Types
//! - **Variants**: Each enum variant represents a different kind of failure
//! - **Data**: Each variant carries a message with the context needed in the logs
//! - **Pattern matching**: Callers decide what is fatal with a `match`
//!
//! ### Traits for Error Conversion
//! - **From trait**: Lets `?` convert library errors into our own types
//! - **ResponseError trait**: Turns an AppError into an HTTP response
//! - **Display trait**: Human-readable text for logs and chat error messages
//!
//! ## Failure taxonomy inside a session:
//! - **ConnectionFailure**: a worker is unreachable or closed mid-session (fatal to that session)
//! - **ProtocolViolation**: unexpected data channel, unexpected track, malformed record (fatal)
//! - **Timeout on receive**: never an error value, the loops simply try again
//! - Anything else is treated as fatal as well; the session fails closed

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **TooManyRequests**: Admission control rejected a new session (429 errors)
/// - **ServiceUnavailable**: A session could not be negotiated right now (503 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Session limit reached
    TooManyRequests(String),

    /// Negotiation failed (ICE server resolution, SDP errors, ...)
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::TooManyRequests(msg) => write!(f, "Too many requests: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts AppError into the JSON error body every endpoint shares:
///
/// ```json
/// {
///   "error": {
///     "type": "too_many_requests",
///     "message": "Too many requests.",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, "too_many_requests", msg),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg),
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

/// JSON parsing errors are the client's fault, so they become a 400.
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

/// Negotiation and worker connectivity problems are reported as 503 so clients can
/// retry the offer later; everything else is a plain 500.
impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Negotiation(_)
            | PipelineError::ConnectionFailure(_)
            | PipelineError::Timeout(_) => AppError::ServiceUnavailable(err.to_string()),
            PipelineError::SessionLimit(_) => AppError::TooManyRequests("Too many requests.".into()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Everything that can go wrong inside one session.
///
/// ## Rust Concepts:
/// - **Clone**: the same error is logged and also copied into a chat message
/// - **std::error::Error**: lets the type travel through `anyhow` and `Box<dyn Error>`
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Worker unreachable, socket closed, or a send failed
    ConnectionFailure(String),

    /// Peer or worker broke the protocol (unknown channel, second track, bad record)
    ProtocolViolation(String),

    /// Record could not be decoded (msgpack, audio container, opus packet)
    Decode(String),

    /// A bounded wait ran out (connect, answer handoff, join)
    Timeout(String),

    /// No address for a worker type (no directory entry and no fallback)
    WorkerNotFound(String),

    /// The session's liveness flag is already cleared
    NotLive,

    /// WebRTC offer/answer handling failed
    Negotiation(String),

    /// Admission control: this many sessions are already running
    SessionLimit(usize),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::ConnectionFailure(msg) => write!(f, "Connection failure: {}", msg),
            PipelineError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            PipelineError::Decode(msg) => write!(f, "Decode error: {}", msg),
            PipelineError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            PipelineError::WorkerNotFound(kind) => write!(f, "{} worker is not found", kind),
            PipelineError::NotLive => write!(f, "Audio broker is not running"),
            PipelineError::Negotiation(msg) => write!(f, "Negotiation failed: {}", msg),
            PipelineError::SessionLimit(running) => write!(f, "Session limit reached ({} running)", running),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<tokio_tungstenite::tungstenite::Error> for PipelineError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        PipelineError::ConnectionFailure(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for PipelineError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        PipelineError::Decode(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for PipelineError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        PipelineError::ProtocolViolation(format!("cannot encode record: {}", err))
    }
}

impl From<webrtc::Error> for PipelineError {
    fn from(err: webrtc::Error) -> Self {
        PipelineError::Negotiation(err.to_string())
    }
}

impl From<audiopus::Error> for PipelineError {
    fn from(err: audiopus::Error) -> Self {
        PipelineError::Decode(format!("opus: {}", err))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Decode(err.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_too_many_requests_maps_to_429() {
        let response = AppError::TooManyRequests("Too many requests.".into()).error_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_pipeline_error_conversion() {
        let err: AppError = PipelineError::Negotiation("dns".into()).into();
        assert!(matches!(err, AppError::ServiceUnavailable(_)));

        let err: AppError = PipelineError::ProtocolViolation("third channel".into()).into();
        assert!(matches!(err, AppError::Internal(_)));

        let err: AppError = PipelineError::SessionLimit(11).into();
        assert_eq!(err.error_response().status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_worker_not_found_message() {
        let err = PipelineError::WorkerNotFound("SpeechRecognizer".into());
        assert_eq!(err.to_string(), "SpeechRecognizer worker is not found");
    }
}
