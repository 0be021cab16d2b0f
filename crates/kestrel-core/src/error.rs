//! Error types for kestrel-core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid prefix: {0}")]
    InvalidPrefix(String),

    #[error("Invalid passcode: {0}")]
    InvalidPasscode(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Signature verification failed for {prefix} at sn {sn}")]
    SignatureMismatch { prefix: String, sn: u64 },

    #[error("SAID mismatch: expected {expected}, computed {computed}")]
    SaidMismatch { expected: String, computed: String },

    #[error("Invalid key event: {0}")]
    InvalidEvent(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Self-attested credential requires issuer == issuee (issuer {issuer}, issuee {issuee})")]
    IssueeMismatch { issuer: String, issuee: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
