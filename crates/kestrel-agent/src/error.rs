//! Error taxonomy for agent flows.

use crate::keystate::QueryAttempt;
use kestrel_host::{HostError, NetworkFailure};
use std::time::Duration;
use thiserror::Error;

/// How a failure should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    /// Transient; worth trying again later.
    Retryable,
    /// Will never succeed as asked.
    Fatal,
    /// Partial success that ends the flow without failing it.
    Terminal,
}

/// Why a key state could not be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailability {
    /// No attempt reached the hosting service.
    ServiceUnreachable,
    /// The service answered but the target had no receipted events yet.
    NoReceipts,
}

impl std::fmt::Display for Unavailability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unavailability::ServiceUnreachable => f.write_str("hosting service unreachable"),
            Unavailability::NoReceipts => f.write_str("no observable receipts yet"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Transient network failure ({failure}): {detail}")]
    TransientNetwork {
        failure: NetworkFailure,
        detail: String,
    },

    #[error("Not yet visible: {0}")]
    PropagationNotYetVisible(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Delegation of {delegate} by {delegator} rejected: {reason}")]
    DelegationRejected {
        delegate: String,
        delegator: String,
        reason: String,
    },

    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Grant {grant} sent but admit unconfirmed: {reason}")]
    ExchangeUnconfirmed { grant: String, reason: String },

    #[error("Key state of {prefix} unavailable after {attempts} attempts: {cause}")]
    KeyStateUnavailable {
        prefix: String,
        attempts: u32,
        cause: Unavailability,
        trail: Vec<QueryAttempt>,
    },

    #[error(
        "Identifier {alias} ({expected}) not registered after {attempts} attempts; \
         the delegation handshake may not have completed (has the delegator approved it?)"
    )]
    IdentifierNotRegistered {
        alias: String,
        expected: String,
        attempts: u32,
    },

    #[error("Prefix mismatch for {subject}: expected {expected}, got {actual}")]
    PrefixMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("Operation {operation} failed ({code}): {message}")]
    OperationFailed {
        operation: String,
        code: u16,
        message: String,
    },

    #[error("Operation {operation} not done after {waited:?} (done={done})")]
    OperationTimeout {
        operation: String,
        done: bool,
        waited: Duration,
    },

    #[error("Registry {name} already exists: {detail}")]
    RegistryConflict { name: String, detail: String },

    #[error("Rejected by host (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Core error: {0}")]
    Core(kestrel_core::Error),
}

impl AgentError {
    pub fn retryability(&self) -> Retryability {
        match self {
            AgentError::TransientNetwork { .. }
            | AgentError::PropagationNotYetVisible(_)
            | AgentError::OperationTimeout { .. }
            | AgentError::KeyStateUnavailable { .. }
            | AgentError::IdentifierNotRegistered { .. } => Retryability::Retryable,
            AgentError::ExchangeUnconfirmed { .. } => Retryability::Terminal,
            _ => Retryability::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryability() == Retryability::Retryable
    }

    pub fn is_fatal(&self) -> bool {
        self.retryability() == Retryability::Fatal
    }
}

impl From<HostError> for AgentError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Unreachable {
                endpoint,
                failure,
                detail,
            } => AgentError::TransientNetwork {
                failure,
                detail: format!("{endpoint}: {detail}"),
            },
            HostError::Unavailable { status, message } => AgentError::TransientNetwork {
                failure: NetworkFailure::Other,
                detail: format!("status {status}: {message}"),
            },
            HostError::NotFound(what) => AgentError::PropagationNotYetVisible(what),
            HostError::Unauthorized(message) => AgentError::Authentication(message),
            HostError::Rejected { status, message } => AgentError::Rejected { status, message },
            HostError::Decode(message) => AgentError::SchemaMismatch(message),
            HostError::Core(err) => err.into(),
        }
    }
}

impl From<kestrel_core::Error> for AgentError {
    fn from(err: kestrel_core::Error) -> Self {
        use kestrel_core::Error as Core;
        match err {
            Core::InvalidPasscode(message) => AgentError::Authentication(message),
            Core::InvalidSignature | Core::SignatureMismatch { .. } => {
                AgentError::SignatureInvalid(err.to_string())
            }
            Core::SchemaMismatch(message) => AgentError::SchemaMismatch(message),
            Core::IssueeMismatch { .. } => AgentError::InvalidArgument(err.to_string()),
            other => AgentError::Core(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
