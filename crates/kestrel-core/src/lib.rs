//! # kestrel-core
//!
//! Core primitives for delegated trading agents.
//!
//! This crate provides:
//! - Self-certifying prefixes and digests
//! - Passcode-derived Ed25519 signing keys
//! - JCS canonicalization and self-addressing identifiers (SAIDs)
//! - Key events and key-event-log (KEL) replay
//! - Self-attested credentials and schema validation
//! - Grant/Admit exchange messages

pub mod credential;
pub mod error;
pub mod event;
pub mod exchange;
pub mod kel;
pub mod keys;
pub mod prefix;
pub mod said;
pub mod signing;

pub use credential::{Credential, Schema};
pub use error::Error;
pub use event::{Ilk, KeyEvent, Seal, SignedEvent};
pub use exchange::{ExchangeMessage, Route, SignedExchange};
pub use kel::{Kel, KeyState};
pub use keys::{KeyChain, Passcode, Signer};
pub use prefix::Prefix;

/// Result type for kestrel-core operations.
pub type Result<T> = std::result::Result<T, Error>;
