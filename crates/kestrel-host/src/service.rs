//! The hosting-service trait.

use crate::Result;
use crate::types::{AgentInfo, ControllerBootstrap, IdentifierRecord, Notification, Operation, RegistryRecord};
use async_trait::async_trait;
use kestrel_core::Credential;
use kestrel_core::event::SignedEvent;
use kestrel_core::exchange::SignedExchange;
use serde_json::Value;

/// An identifier-hosting service.
///
/// Every call after [`connect`](HostingService::connect) is made on behalf of
/// one controller, named by its controller prefix. Calls returning an
/// [`Operation`] may complete asynchronously; poll them with
/// [`operation`](HostingService::operation).
#[async_trait]
pub trait HostingService: Send + Sync {
    /// Authenticate a controller and boot (or reuse) its agent.
    async fn connect(&self, bootstrap: &ControllerBootstrap) -> Result<AgentInfo>;

    /// Current state of an operation.
    async fn operation(&self, controller: &str, name: &str) -> Result<Operation>;

    /// Start resolving an out-of-band introduction.
    async fn resolve_oobi(&self, controller: &str, url: &str, alias: &str) -> Result<Operation>;

    /// Start a key-state query for a remote identifier.
    async fn query_key_state(&self, controller: &str, prefix: &str) -> Result<Operation>;

    /// KEL of an identifier the agent knows (own or introduced).
    async fn key_event_log(&self, controller: &str, prefix: &str) -> Result<Vec<SignedEvent>>;

    /// A local identifier by alias.
    async fn identifier(&self, controller: &str, alias: &str) -> Result<IdentifierRecord>;

    /// Submit an inception (`icp`) or delegated inception (`dip`).
    async fn incept(&self, controller: &str, alias: &str, event: SignedEvent) -> Result<Operation>;

    /// Submit an interaction event for a local identifier.
    async fn interact(&self, controller: &str, alias: &str, event: SignedEvent) -> Result<Operation>;

    /// Registries owned by a local identifier.
    async fn registries(&self, controller: &str, alias: &str) -> Result<Vec<RegistryRecord>>;

    /// Create a registry anchored by `anchor`.
    async fn create_registry(
        &self,
        controller: &str,
        alias: &str,
        registry: RegistryRecord,
        anchor: SignedEvent,
    ) -> Result<Operation>;

    /// Resolve a schema document by SAID.
    async fn schema(&self, controller: &str, said: &str) -> Result<Value>;

    /// Issue a credential anchored by `anchor`.
    async fn issue_credential(
        &self,
        controller: &str,
        alias: &str,
        credential: Credential,
        anchor: SignedEvent,
    ) -> Result<Operation>;

    /// Send a signed exchange message.
    async fn submit_exchange(
        &self,
        controller: &str,
        alias: &str,
        exchange: SignedExchange,
    ) -> Result<Operation>;

    /// Fetch an exchange message by SAID.
    async fn exchange(&self, controller: &str, said: &str) -> Result<SignedExchange>;

    /// The controller's notification queue.
    async fn notifications(&self, controller: &str) -> Result<Vec<Notification>>;

    /// Mark a notification as read.
    async fn mark_notification(&self, controller: &str, id: &str) -> Result<()>;
}
