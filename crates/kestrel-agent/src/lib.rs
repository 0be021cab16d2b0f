//! # kestrel-agent
//!
//! Agent-side flows on top of a [`HostingService`](kestrel_host::HostingService):
//!
//! - [`retry`]: backoff wrapper shared by every network call
//! - [`session`]: passcode-keyed sessions against a hosting service
//! - [`oobi`]: out-of-band introductions
//! - [`keystate`]: key-state queries tolerant of witness-receipt lag
//! - [`delegation`]: delegated-inception verification
//! - [`registry`]: credential registries and self-attested issuance
//! - [`exchange`]: the Grant/Admit credential exchange
//!
//! Errors are classified once, by [`AgentError::retryability`], so callers can
//! tell "never going to work" from "try again later".

pub mod config;
pub mod delegation;
pub mod error;
pub mod exchange;
pub mod identifiers;
pub mod keystate;
pub mod oobi;
pub mod operation;
pub mod registry;
pub mod retry;
pub mod session;

pub use config::{AgentConfig, Environment, EnvironmentKind};
pub use delegation::{DelegationReport, DelegationStatus, verify_delegation};
pub use error::{AgentError, Result, Retryability, Unavailability};
pub use exchange::{
    Counterparty, ExchangeReport, ExchangeState, GrantRecord, NotificationPolling,
    admit_grant, admit_recorded_grant, exchange_credential, observe_grant, send_grant,
    verify_grant,
};
pub use identifiers::{
    DelegationRequest, approve_delegation, await_delegation, create_identifier, interact,
    request_delegated_identifier,
};
pub use keystate::{
    KeyStateQuery, QueryAttempt, RegistrationPolling, fetch_key_event_log, query_key_state,
    verify_identifier_registered,
};
pub use oobi::resolve_introduction;
pub use operation::wait_for_operation;
pub use registry::{create_registry, issue_into, issue_self_attested, saidify_schema};
pub use retry::{RetryPolicy, retry, with_retry};
pub use session::{Session, SessionManager};
