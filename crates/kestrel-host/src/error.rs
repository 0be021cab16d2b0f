//! Error types for hosting-service calls.

use thiserror::Error;

/// Why a host could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFailure {
    ConnectionRefused,
    Dns,
    Timeout,
    Other,
}

impl std::fmt::Display for NetworkFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            NetworkFailure::ConnectionRefused => "connection refused",
            NetworkFailure::Dns => "DNS resolution failed",
            NetworkFailure::Timeout => "timed out",
            NetworkFailure::Other => "network error",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Host unreachable at {endpoint}: {failure} ({detail})")]
    Unreachable {
        endpoint: String,
        failure: NetworkFailure,
        detail: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Service unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("Unexpected response shape: {0}")]
    Decode(String),

    #[error("Core error: {0}")]
    Core(#[from] kestrel_core::Error),
}

impl HostError {
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        HostError::Rejected {
            status,
            message: message.into(),
        }
    }

    /// HTTP status a server should answer with for this error.
    pub fn status(&self) -> u16 {
        match self {
            HostError::Unreachable { .. } => 502,
            HostError::NotFound(_) => 404,
            HostError::Unauthorized(_) => 401,
            HostError::Rejected { status, .. } => *status,
            HostError::Unavailable { status, .. } => *status,
            HostError::Decode(_) | HostError::Core(_) => 400,
        }
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
