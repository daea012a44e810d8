//! Error types for object store operations

#[cfg(feature = "s3-native")]
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use std::io;
use thiserror::Error;

/// Result type alias for object store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to an object store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The store answered with an error response
    #[error("Store service error ({code}, HTTP {status}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    /// Object not found in bucket
    #[error("Object not found: {0}")]
    NotFound(String),

    /// The multipart upload no longer exists
    #[error("No such upload: {0}")]
    NoSuchUpload(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The response body ended early or had the wrong length
    #[error("Incomplete body: {0}")]
    Incomplete(String),

    /// AWS SDK error that fits no other category
    #[error("AWS SDK error: {0}")]
    Sdk(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

impl StoreError {
    /// Shorthand for a service error
    pub fn service(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Service {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Network(_) => true,
            StoreError::Timeout(_) => true,
            StoreError::Incomplete(_) => true,
            StoreError::Io(_) => true,
            StoreError::Service { status, code, .. } => {
                *status >= 500 || *status == 429 || is_retryable_code(code)
            }
            // SDK errors: check for network-related strings
            StoreError::Sdk(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("connection reset")
                    || lower.contains("connection timed out")
                    || lower.contains("broken pipe")
                    || lower.contains("connection refused")
                    || lower.contains("temporarily unavailable")
            }
            StoreError::NotFound(_) | StoreError::NoSuchUpload(_) | StoreError::InvalidConfig(_) => {
                false
            }
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Check if an S3 error code is retryable
pub(crate) fn is_retryable_code(code: &str) -> bool {
    matches!(
        code,
        "RequestTimeout"
            | "ServiceUnavailable"
            | "InternalError"
            | "SlowDown"
            | "RequestTimeTooSkewed"
    )
}

/// Convert AWS SDK errors to StoreError
#[cfg(feature = "s3-native")]
impl<E> From<SdkError<E>> for StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    fn from(error: SdkError<E>) -> Self {
        match &error {
            SdkError::TimeoutError(_) => StoreError::Timeout(format!("{:?}", error)),
            SdkError::DispatchFailure(e) => {
                if e.is_timeout() {
                    StoreError::Timeout(format!("Dispatch timed out: {:?}", e))
                } else {
                    StoreError::Network(format!("Network dispatch failure: {:?}", e))
                }
            }
            SdkError::ResponseError(e) => StoreError::Network(format!("Response error: {:?}", e)),
            SdkError::ServiceError(e) => {
                let status = e.raw().status().as_u16();
                let code = error.code().unwrap_or("Unknown").to_string();
                let message = error.message().unwrap_or_default().to_string();

                match code.as_str() {
                    "NoSuchUpload" => StoreError::NoSuchUpload(message),
                    "NoSuchKey" | "NotFound" => StoreError::NotFound(message),
                    _ if status == 404 => StoreError::NotFound(message),
                    _ => StoreError::Service {
                        status,
                        code,
                        message,
                    },
                }
            }
            _ => StoreError::Sdk(format!("{:?}", error)),
        }
    }
}
