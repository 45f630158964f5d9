//! Error types for matting, generation and fusion operations

use thiserror::Error;

/// Result type alias for fusion service operations
pub type Result<T> = std::result::Result<T, FuseError>;

/// Comprehensive error types for the fusion service
#[derive(Error, Debug)]
pub enum FuseError {
    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding or encoding errors
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Transport-level failures talking to a remote host
    #[error("Network error: {0}")]
    Network(String),

    /// A third-party API answered with a non-success status
    #[error("{service} returned HTTP {status}: {body}")]
    Upstream {
        service: String,
        status: u16,
        body: String,
    },

    /// Missing or malformed request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Object store failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// Compositing and pixel pipeline errors
    #[error("Processing error: {0}")]
    Processing(String),

    /// An asynchronous upstream job did not finish in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FuseError {
    /// Create a new invalid request error
    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an upstream error from a service name, status code and response text
    pub fn upstream<S: Into<String>, B: Into<String>>(service: S, status: u16, body: B) -> Self {
        Self::Upstream {
            service: service.into(),
            status,
            body: body.into(),
        }
    }

    /// Create a network error with operation context
    pub fn network_error<S: AsRef<str>, E: std::fmt::Display>(context: S, error: E) -> Self {
        Self::Network(format!("{}: {}", context.as_ref(), error))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
        recommended: Option<T>,
    ) -> Self {
        let recommendation = match recommended {
            Some(rec) => format!(" Recommended: {}", rec),
            None => String::new(),
        };

        Self::Config(format!(
            "Invalid {}: {} (valid range: {}).{}",
            parameter, value, valid_range, recommendation
        ))
    }

    /// Create processing error with stage context
    pub fn processing_stage_error(stage: &str, details: &str, input_info: Option<&str>) -> Self {
        let input_context = match input_info {
            Some(info) => format!(" (input: {})", info),
            None => String::new(),
        };

        Self::Processing(format!(
            "Processing failed at stage '{}'{}: {}",
            stage, input_context, details
        ))
    }

    /// Whether the error was caused by the caller rather than the service
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }
}
