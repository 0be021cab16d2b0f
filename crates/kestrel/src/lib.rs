//! # Kestrel
//!
//! Delegated identifiers and self-attested credential exchange for
//! autonomous trading agents.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kestrel::{AgentConfig, MemoryHost, Passcode, Session, create_identifier};
//! use std::sync::Arc;
//!
//! # async fn run() -> kestrel::agent::Result<()> {
//! let host = Arc::new(MemoryHost::default());
//! let session = Session::connect(host, &Passcode::generate(), AgentConfig::default()).await?;
//! let trader = create_identifier(&session, "trader").await?;
//! println!("AID: {}", trader.prefix);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`core`] - Prefixes, key events, SAIDs, credentials and exchange messages
//! - [`host`] - The hosting-service boundary and its in-memory and HTTP hosts
//! - [`agent`] - Sessions, introductions, key-state queries, delegation
//!   verification, issuance and the Grant/Admit exchange
//!
//! ## Re-exports
//!
//! Common types are re-exported at the crate root for convenience.

pub use kestrel_agent as agent;
pub use kestrel_core as core;
pub use kestrel_host as host;

// Re-export common types at root
pub use kestrel_agent::{
    AgentConfig, AgentError, DelegationReport, DelegationStatus, Environment, ExchangeReport,
    ExchangeState, GrantRecord, Session, SessionManager, create_identifier, create_registry,
    exchange_credential, issue_self_attested, query_key_state, resolve_introduction,
    saidify_schema, verify_delegation, verify_grant,
};
pub use kestrel_core::{Credential, Passcode, Prefix};
pub use kestrel_host::{HostingService, HttpHost, MemoryHost, Network};
