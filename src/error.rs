//! # Error Handling
//!
//! This module defines the two error families of the agent and how they reach
//! the outside world.
//!
//! ## Two Layers:
//! - **VoiceError**: failures inside the voice core (microphone, transport,
//!   transcoding, sending). Only some of them are ever shown to a user.
//! - **AppError**: failures of the local control API, converted into JSON
//!   HTTP responses.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **Purpose**: Forces you to handle both success and failure cases
//! - **No exceptions**: Rust doesn't have try/catch, it uses Result instead
//!
//! ### Enums for Error Types
//! - **Variants**: Each enum variant represents a different kind of error
//! - **Pattern matching**: Use `match` to handle different error types
//!
//! ### Traits for Error Conversion
//! - **From trait**: Automatically converts between error types
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **thiserror**: Derives `Display` and `std::error::Error` from attributes

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Errors produced by the voice session core.
///
/// ## Propagation policy:
/// - `PermissionDenied`, `ConnectionFailed` and `Device` are surfaced to the
///   caller of `connect()` as actionable messages.
/// - `Transcode`, `Send` and `Protocol` are absorbed where they happen: the
///   offending chunk or frame is dropped and logged, and the stream continues.
///
/// ## Rust Concepts:
/// - **#[derive(thiserror::Error)]**: Generates the `Display` and `Error`
///   implementations from the `#[error(...)]` attributes
/// - **Clone + PartialEq**: Lets tests compare errors directly
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoiceError {
    /// Microphone access was denied or no capture device is available
    #[error("microphone unavailable: {0}")]
    PermissionDenied(String),

    /// The live endpoint could not be opened, or failed after opening
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The playback device could not be opened or refused an operation
    #[error("audio device error: {0}")]
    Device(String),

    /// An inbound audio chunk could not be decoded
    #[error("could not decode audio chunk: {0}")]
    Transcode(String),

    /// An outbound audio frame could not be delivered
    #[error("could not send audio frame: {0}")]
    Send(String),

    /// The server sent a frame we could not understand
    #[error("malformed server message: {0}")]
    Protocol(String),
}

impl VoiceError {
    /// Machine-readable error code used in API and event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            VoiceError::PermissionDenied(_) => "permission_denied",
            VoiceError::ConnectionFailed(_) => "connection_failed",
            VoiceError::Device(_) => "device_error",
            VoiceError::Transcode(_) => "transcode_error",
            VoiceError::Send(_) => "send_error",
            VoiceError::Protocol(_) => "protocol_error",
        }
    }

    /// Whether this failure should be shown to the user.
    ///
    /// Per-chunk failures are recovered locally to keep the audio stream alive,
    /// so only session-level failures qualify.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            VoiceError::PermissionDenied(_) | VoiceError::ConnectionFailed(_) | VoiceError::Device(_)
        )
    }

    /// Re-tag any failure raised while acquiring the microphone as a permission error.
    pub fn into_permission(self) -> Self {
        match self {
            VoiceError::PermissionDenied(msg) => VoiceError::PermissionDenied(msg),
            other => VoiceError::PermissionDenied(other.to_string()),
        }
    }

    /// Re-tag any failure raised while opening the transport as a connection error.
    pub fn into_connection(self) -> Self {
        match self {
            VoiceError::ConnectionFailed(msg) => VoiceError::ConnectionFailed(msg),
            other => VoiceError::ConnectionFailed(other.to_string()),
        }
    }
}

/// Custom error types for the control API.
///
/// ## Rust Concepts:
/// - **enum**: A type that can be one of several variants
/// - **String**: Each variant holds an error message
/// - **#[derive(Debug)]**: Automatically implements debug printing
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **PermissionDenied**: Microphone access refused (403 errors)
/// - **Upstream**: The live endpoint could not be reached (502 errors)
/// - **DeviceUnavailable**: No usable audio output device (503 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Microphone access was denied
    PermissionDenied(String),

    /// The remote voice service could not be reached
    Upstream(String),

    /// The audio device could not be opened
    DeviceUnavailable(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),
}

/// Implementation of the Display trait for AppError.
///
/// ## Purpose:
/// This trait defines how errors are formatted as human-readable strings.
/// It's used when you print an error or convert it to a string.
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            AppError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            AppError::DeviceUnavailable(msg) => write!(f, "Device unavailable: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl AppError {
    /// HTTP status code and machine-readable type for this error.
    fn status_and_type(&self) -> (actix_web::http::StatusCode, &'static str) {
        use actix_web::http::StatusCode;

        match self {
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::PermissionDenied(_) => (StatusCode::FORBIDDEN, "permission_denied"),
            AppError::Upstream(_) => (StatusCode::BAD_GATEWAY, "connection_failed"),
            AppError::DeviceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "device_error"),
            AppError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::ValidationError(_) => (StatusCode::BAD_REQUEST, "validation_error"),
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::PermissionDenied(msg)
            | AppError::Upstream(msg)
            | AppError::DeviceUnavailable(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg) => msg,
        }
    }
}

/// Implementation of the ResponseError trait for AppError.
///
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "permission_denied",
///     "message": "microphone unavailable: no input device",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        self.status_and_type().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type) = self.status_and_type();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Voice failures reaching the API are mapped onto user-facing categories.
impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::PermissionDenied(msg) => AppError::PermissionDenied(msg),
            VoiceError::ConnectionFailed(msg) => AppError::Upstream(msg),
            VoiceError::Device(msg) => AppError::DeviceUnavailable(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Automatic conversion from anyhow::Error to AppError.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Automatic conversion from JSON parsing errors to AppError.
///
/// ## Why BadRequest:
/// JSON parsing errors are almost always due to the client sending malformed data,
/// so they should result in a 400 (Bad Request) response, not a 500.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Automatic conversion from configuration errors to AppError.
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Type alias for Results that use the API error type.
pub type AppResult<T> = Result<T, AppError>;
