//! Error types for the Keel client

use keel_core::retry::RetryableError;
use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when using the Keel client
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

impl ClientError {
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ApiError { status: 404, .. })
    }

    /// Check if this error is a client error (4xx status)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::ApiError { status, .. } if (400..500).contains(status))
    }

    /// Connection dropped by the peer before a response; safe to resend at once
    pub fn is_connection_reset(&self) -> bool {
        let Self::RequestFailed(err) = self else {
            return false;
        };

        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                return matches!(
                    io.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
                );
            }
            source = cause.source();
        }
        false
    }

    /// Whether resending the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed(e) => e.is_connect() || e.is_timeout(),
            Self::ApiError { status, .. } => *status >= 500 || *status == 429,
            Self::ParseError(_) => false,
        }
    }

    /// Classifies this error for [`keel_core::retry::retry`]
    pub fn into_retryable(self) -> RetryableError<ClientError> {
        if self.is_connection_reset() {
            RetryableError::retry_now(self)
        } else if self.is_transient() {
            RetryableError::retry(self)
        } else {
            RetryableError::fatal(self)
        }
    }
}
