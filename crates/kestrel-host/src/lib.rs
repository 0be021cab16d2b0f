//! Hosting-service boundary for kestrel agents.
//!
//! Every agent talks to an identifier-hosting service through the
//! [`HostingService`] trait. Long-running calls return an [`Operation`]
//! handle that must be polled until it is done.
//!
//! Two implementations are provided:
//! - [`MemoryHost`] keeps everything in process and can simulate witness
//!   receipt lag, unreachable endpoints and missing notification channels.
//! - [`HttpHost`] talks to a remote host over HTTP.

pub mod error;
pub mod http;
pub mod memory;
pub mod service;
pub mod types;

pub use error::{HostError, NetworkFailure, Result};
pub use http::HttpHost;
pub use memory::{MemoryHost, Network};
pub use service::HostingService;
pub use types::{
    AgentInfo, ControllerBootstrap, INVALID_KEL, IdentifierRecord, Notification, Operation,
    OperationError, RegistryRecord, credential_seal,
};
