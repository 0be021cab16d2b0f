//! In-process hosting service.
//!
//! A [`Network`] stands in for the witnesses, OOBI endpoints, schema caches and
//! mailboxes shared by every host. A [`MemoryHost`] runs one agent per
//! connected controller on top of a network. Several hosts may share a network.
//!
//! The host stores what it is given and reports what it sees. It checks
//! signatures on submissions, but KELs served for introduced identifiers are
//! passed through as published, so callers must verify them.

use crate::error::{HostError, NetworkFailure, Result};
use crate::service::HostingService;
use crate::types::{
    AgentInfo, ControllerBootstrap, IdentifierRecord, Notification, Operation, RegistryRecord,
    INVALID_KEL, credential_seal, oobi_prefix, oobi_url,
};
use async_trait::async_trait;
use kestrel_core::event::{Ilk, KeyEvent, Seal, SignedEvent, SourceSeal};
use kestrel_core::exchange::{Route, SignedExchange};
use kestrel_core::kel::Kel;
use kestrel_core::{Credential, Schema, signing};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

const ENDPOINT: &str = "memory://host";

/// Shared world state seen by every [`MemoryHost`] attached to it.
#[derive(Clone)]
pub struct Network {
    inner: Arc<Mutex<NetworkState>>,
}

struct NetworkState {
    oobi_base: String,
    kels: HashMap<String, Witnessed>,
    receipt_lag: u32,
    schemas: HashMap<String, Value>,
    schema_lag: u32,
    exchanges: HashMap<String, SignedExchange>,
    mailbox: Vec<MailboxEntry>,
    mailbox_enabled: bool,
}

/// A published KEL and how much of it witnesses have receipted.
#[derive(Default)]
struct Witnessed {
    events: Vec<SignedEvent>,
    visible: usize,
    lag: u32,
}

impl Witnessed {
    fn view(&self) -> Option<Vec<SignedEvent>> {
        (self.visible > 0).then(|| self.events[..self.visible].to_vec())
    }

    fn poll(&mut self) -> Option<Vec<SignedEvent>> {
        if self.lag > 0 {
            self.lag -= 1;
        } else {
            self.visible = self.events.len();
        }
        self.view()
    }
}

#[derive(Debug, Clone)]
struct MailboxEntry {
    said: String,
    sender: String,
    recipient: String,
    route: Route,
    timestamp: String,
}

impl Network {
    pub fn new(oobi_base: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkState {
                oobi_base: oobi_base.into(),
                kels: HashMap::new(),
                receipt_lag: 0,
                schemas: HashMap::new(),
                schema_lag: 0,
                exchanges: HashMap::new(),
                mailbox: Vec::new(),
                mailbox_enabled: true,
            })),
        }
    }

    pub fn oobi_base(&self) -> String {
        self.inner.lock().unwrap().oobi_base.clone()
    }

    /// OOBI URL introducing `prefix` on this network.
    pub fn oobi_url(&self, prefix: &str) -> String {
        oobi_url(&self.oobi_base(), prefix)
    }

    /// Make a schema resolvable by SAID.
    pub fn publish_schema(&self, document: Value) -> kestrel_core::Result<String> {
        let schema = Schema::from_document(document)?;
        let said = schema.said.clone();
        self.inner
            .lock()
            .unwrap()
            .schemas
            .insert(said.clone(), schema.document().clone());
        Ok(said)
    }

    /// Number of polls newly published events stay unreceipted.
    pub fn set_receipt_lag(&self, polls: u32) {
        self.inner.lock().unwrap().receipt_lag = polls;
    }

    /// Number of upcoming schema lookups that miss.
    pub fn set_schema_lag(&self, lookups: u32) {
        self.inner.lock().unwrap().schema_lag = lookups;
    }

    /// When disabled, exchange messages are stored but never queued for
    /// delivery to their recipients.
    pub fn set_mailbox_enabled(&self, enabled: bool) {
        self.inner.lock().unwrap().mailbox_enabled = enabled;
    }

    /// Every published event of `prefix`, receipted or not.
    pub fn kel(&self, prefix: &str) -> Option<Vec<SignedEvent>> {
        let state = self.inner.lock().unwrap();
        state.kels.get(prefix).map(|w| w.events.clone())
    }

    /// Rewrite a published event in place without re-signing it.
    ///
    /// Returns false if no such event was published.
    pub fn tamper_event(&self, prefix: &str, sn: u64, edit: impl FnOnce(&mut KeyEvent)) -> bool {
        let mut state = self.inner.lock().unwrap();
        let event = state
            .kels
            .get_mut(prefix)
            .and_then(|w| w.events.iter_mut().find(|e| e.event.sn == sn));
        match event {
            Some(signed) => {
                edit(&mut signed.event);
                true
            }
            None => false,
        }
    }

    /// Publish `events` as the KEL of `prefix` without going through an agent.
    ///
    /// Stands in for a controller hosted elsewhere; nothing is verified.
    pub fn publish_kel(&self, prefix: &str, events: Vec<SignedEvent>) {
        self.publish(prefix, events);
    }

    fn publish(&self, prefix: &str, events: Vec<SignedEvent>) {
        let mut state = self.inner.lock().unwrap();
        let lag = state.receipt_lag;
        let entry = state.kels.entry(prefix.to_string()).or_default();
        entry.events = events;
        entry.lag = lag;
        if lag == 0 {
            entry.visible = entry.events.len();
        }
    }

    fn has_kel(&self, prefix: &str) -> bool {
        self.inner.lock().unwrap().kels.contains_key(prefix)
    }

    fn poll_kel(&self, prefix: &str) -> Option<Vec<SignedEvent>> {
        let mut state = self.inner.lock().unwrap();
        state.kels.get_mut(prefix).and_then(Witnessed::poll)
    }

    fn view_kel(&self, prefix: &str) -> Option<Vec<SignedEvent>> {
        let state = self.inner.lock().unwrap();
        state.kels.get(prefix).and_then(Witnessed::view)
    }

    fn lookup_schema(&self, said: &str) -> Option<Value> {
        let mut state = self.inner.lock().unwrap();
        if state.schema_lag > 0 {
            state.schema_lag -= 1;
            return None;
        }
        state.schemas.get(said).cloned()
    }

    fn schema_document(&self, said: &str) -> Option<Value> {
        self.inner.lock().unwrap().schemas.get(said).cloned()
    }

    /// Store an exchange; returns whether it was queued for delivery.
    fn store_exchange(&self, exchange: SignedExchange) -> bool {
        let mut state = self.inner.lock().unwrap();
        let exn = &exchange.exn;
        let queued = state.mailbox_enabled;
        if queued {
            let entry = MailboxEntry {
                said: exn.said.clone(),
                sender: exn.sender.clone(),
                recipient: exn.recipient.clone(),
                route: exn.route,
                timestamp: exn.timestamp.clone(),
            };
            state.mailbox.push(entry);
        }
        state.exchanges.insert(exn.said.clone(), exchange);
        queued
    }

    fn exchange(&self, said: &str) -> Option<SignedExchange> {
        self.inner.lock().unwrap().exchanges.get(said).cloned()
    }

    fn mailbox_for(&self, recipients: &HashSet<String>) -> Vec<MailboxEntry> {
        let state = self.inner.lock().unwrap();
        state
            .mailbox
            .iter()
            .filter(|entry| recipients.contains(&entry.recipient))
            .cloned()
            .collect()
    }
}

/// OOBI base of the default network; matches a local hosting service.
pub const DEFAULT_OOBI_BASE: &str = "http://127.0.0.1:3901";

impl Default for Network {
    fn default() -> Self {
        Self::new(DEFAULT_OOBI_BASE)
    }
}

/// Per-controller agent state.
struct AgentState {
    agent: String,
    identifiers: HashMap<String, Kel>,
    /// Delegated inceptions awaiting approval, alias to prefix.
    pending: HashMap<String, String>,
    /// Introduced remote identifiers, prefix to alias.
    introduced: HashMap<String, String>,
    registries: Vec<RegistryRecord>,
    credentials: HashMap<String, Credential>,
    operations: HashMap<String, Job>,
    notifications: Vec<Notification>,
    delivered: HashSet<String>,
}

/// What an operation is waiting for.
enum Job {
    Done(Operation),
    Witness {
        prefix: String,
        sn: u64,
        response: Value,
    },
    Oobi {
        prefix: String,
        alias: String,
    },
    /// Waits until witnesses have receipted up to `sn`.
    Query {
        prefix: String,
        sn: u64,
    },
    Delegation {
        alias: String,
        event: SignedEvent,
    },
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Job::Done(_) => "done",
            Job::Witness { .. } => "witness",
            Job::Oobi { .. } => "oobi",
            Job::Query { .. } => "query",
            Job::Delegation { .. } => "delegation",
        }
    }
}

impl AgentState {
    fn new(agent: String) -> Self {
        Self {
            agent,
            identifiers: HashMap::new(),
            pending: HashMap::new(),
            introduced: HashMap::new(),
            registries: Vec::new(),
            credentials: HashMap::new(),
            operations: HashMap::new(),
            notifications: Vec::new(),
            delivered: HashSet::new(),
        }
    }

    fn kel(&self, alias: &str) -> Result<&Kel> {
        self.identifiers
            .get(alias)
            .ok_or_else(|| HostError::NotFound(format!("identifier {alias}")))
    }

    fn kel_mut(&mut self, alias: &str) -> Result<&mut Kel> {
        self.identifiers
            .get_mut(alias)
            .ok_or_else(|| HostError::NotFound(format!("identifier {alias}")))
    }

    fn prefix_of(&self, alias: &str) -> Result<String> {
        let kel = self.kel(alias)?;
        Ok(kel.prefix().unwrap_or_default().to_string())
    }

    fn own(&self, prefix: &str) -> Option<&Kel> {
        self.identifiers
            .values()
            .find(|kel| kel.prefix() == Some(prefix))
    }

    fn own_prefixes(&self) -> HashSet<String> {
        self.identifiers
            .values()
            .filter_map(|kel| kel.prefix().map(str::to_string))
            .collect()
    }

    fn knows(&self, prefix: &str) -> bool {
        self.own(prefix).is_some() || self.introduced.contains_key(prefix)
    }

    fn start(&mut self, network: &Network, job: Job) -> Operation {
        let name = format!("{}.{}", job.kind(), Uuid::now_v7());
        let (job, operation) = self.advance(network, &name, job);
        self.operations.insert(name, job);
        operation
    }

    fn evaluate(&mut self, network: &Network, name: &str) -> Result<Operation> {
        let job = self
            .operations
            .remove(name)
            .ok_or_else(|| HostError::NotFound(format!("operation {name}")))?;
        let (job, operation) = self.advance(network, name, job);
        self.operations.insert(name.to_string(), job);
        Ok(operation)
    }

    /// Move `job` forward; a step that errors finishes the operation as failed.
    fn advance(&mut self, network: &Network, name: &str, job: Job) -> (Job, Operation) {
        self.step(network, name, job).unwrap_or_else(|e| {
            warn!(operation = name, error = %e, "Operation failed");
            let code = if matches!(e, HostError::Core(_)) {
                INVALID_KEL
            } else {
                e.status()
            };
            done(Operation::failed(name, code, e.to_string()))
        })
    }

    fn step(&mut self, network: &Network, name: &str, job: Job) -> Result<(Job, Operation)> {
        Ok(match job {
            Job::Done(op) => (Job::Done(op.clone()), op),
            Job::Witness {
                prefix,
                sn,
                response,
            } => match network.poll_kel(&prefix) {
                Some(events) if events.len() as u64 > sn => {
                    done(Operation::completed(name, response))
                }
                _ => (
                    Job::Witness {
                        prefix,
                        sn,
                        response,
                    },
                    Operation::pending(name),
                ),
            },
            Job::Oobi { prefix, alias } => {
                if !network.has_kel(&prefix) {
                    done(Operation::failed(
                        name,
                        404,
                        format!("no key event log published for {prefix}"),
                    ))
                } else if network.poll_kel(&prefix).is_some() {
                    let response = json!({"alias": alias, "prefix": prefix});
                    self.introduced.insert(prefix, alias);
                    done(Operation::completed(name, response))
                } else {
                    (Job::Oobi { prefix, alias }, Operation::pending(name))
                }
            }
            Job::Query { prefix, sn } => match network.poll_kel(&prefix) {
                Some(events) if events.len() as u64 > sn => {
                    let (_, state) = Kel::verified(events)?;
                    done(Operation::completed(name, encode(&state)?))
                }
                _ => (Job::Query { prefix, sn }, Operation::pending(name)),
            },
            Job::Delegation { alias, event } => {
                let delegator = event.event.delegator.clone().unwrap_or_default();
                let seal = event.event.seal();
                match find_source_seal(network, &delegator, &seal) {
                    Some(source) => {
                        done(self.complete_delegation(network, name, &alias, event, source)?)
                    }
                    None => (Job::Delegation { alias, event }, Operation::pending(name)),
                }
            }
        })
    }

    fn complete_delegation(
        &mut self,
        network: &Network,
        name: &str,
        alias: &str,
        mut event: SignedEvent,
        source: SourceSeal,
    ) -> Result<Operation> {
        event.source_seal = Some(source);
        let prefix = event.event.prefix.clone();
        let (kel, state) = Kel::verified(vec![event])?;

        network.publish(&prefix, kel.to_vec());
        self.pending.remove(alias);
        self.identifiers.insert(alias.to_string(), kel);
        info!(alias, prefix = %prefix, "Delegated identifier approved");

        let record = IdentifierRecord {
            name: alias.to_string(),
            prefix,
            state,
        };
        Ok(Operation::completed(name, encode(&record)?))
    }

    /// Append an interaction that must anchor `seal`.
    fn anchor(
        &mut self,
        network: &Network,
        alias: &str,
        anchor: SignedEvent,
        seal: &Seal,
    ) -> Result<(String, u64)> {
        if !anchor.event.is_interaction() || !anchor.event.anchors.contains(seal) {
            return Err(HostError::rejected(
                400,
                format!("anchor must be an interaction sealing {}", seal.prefix),
            ));
        }
        let kel = self.kel_mut(alias)?;
        let state = kel.append(anchor)?;
        network.publish(&state.prefix, kel.to_vec());
        Ok((state.prefix, state.sn))
    }

    fn deliver(&mut self, network: &Network) {
        for entry in network.mailbox_for(&self.own_prefixes()) {
            if self.delivered.contains(&entry.said) {
                continue;
            }
            if !self.knows(&entry.sender) {
                debug!(
                    sender = %entry.sender,
                    said = %entry.said,
                    "Escrowing message from unintroduced sender"
                );
                continue;
            }
            self.delivered.insert(entry.said.clone());
            self.notifications.push(Notification {
                id: Uuid::now_v7().to_string(),
                timestamp: entry.timestamp,
                read: false,
                route: entry.route.as_str().to_string(),
                exchange: entry.said,
                sender: entry.sender,
                recipient: entry.recipient,
            });
        }
    }
}

fn done(operation: Operation) -> (Job, Operation) {
    (Job::Done(operation.clone()), operation)
}

fn encode<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value).map_err(kestrel_core::Error::from)?)
}

fn find_source_seal(network: &Network, delegator: &str, seal: &Seal) -> Option<SourceSeal> {
    let kel = Kel::from_events(network.view_kel(delegator)?);
    kel.find_anchor(seal).map(|anchor| SourceSeal {
        sn: anchor.event.sn,
        said: anchor.event.said.clone(),
    })
}

/// A hosting service that keeps all state in process.
pub struct MemoryHost {
    network: Network,
    agents: Mutex<HashMap<String, AgentState>>,
    reachable: AtomicBool,
    calls: AtomicUsize,
}

impl MemoryHost {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            agents: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// While unreachable every call fails as a refused connection.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of calls attempted against this host, reachable or not.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(HostError::Unreachable {
                endpoint: ENDPOINT.to_string(),
                failure: NetworkFailure::ConnectionRefused,
                detail: "host is offline".to_string(),
            });
        }
        Ok(())
    }

    /// Run `f` against the connected agent of `controller`.
    ///
    /// Lock order is agents, then network.
    fn with_agent<T>(
        &self,
        controller: &str,
        f: impl FnOnce(&mut AgentState, &Network) -> Result<T>,
    ) -> Result<T> {
        self.gate()?;
        let mut agents = self.agents.lock().unwrap();
        let agent = agents.get_mut(controller).ok_or_else(|| {
            HostError::Unauthorized(format!("controller {controller} is not connected"))
        })?;
        f(agent, &self.network)
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new(Network::default())
    }
}

#[async_trait]
impl HostingService for MemoryHost {
    async fn connect(&self, bootstrap: &ControllerBootstrap) -> Result<AgentInfo> {
        self.gate()?;
        bootstrap.verify().map_err(|_| {
            HostError::Unauthorized("controller signature does not verify".to_string())
        })?;

        let controller = bootstrap.controller.clone();
        let mut agents = self.agents.lock().unwrap();
        let agent = agents.entry(controller.clone()).or_insert_with(|| {
            let agent = signing::digest(format!("agent:{controller}").as_bytes()).to_string();
            info!(controller = %controller, agent = %agent, "Booted agent");
            AgentState::new(agent)
        });

        Ok(AgentInfo {
            controller,
            agent: agent.agent.clone(),
        })
    }

    async fn operation(&self, controller: &str, name: &str) -> Result<Operation> {
        self.with_agent(controller, |agent, network| agent.evaluate(network, name))
    }

    async fn resolve_oobi(&self, controller: &str, url: &str, alias: &str) -> Result<Operation> {
        self.with_agent(controller, |agent, network| {
            let prefix = oobi_prefix(url)
                .ok_or_else(|| HostError::rejected(400, format!("not an OOBI URL: {url}")))?;

            if !url.starts_with(&network.oobi_base()) {
                let op = Operation::failed(
                    format!("oobi.{}", Uuid::now_v7()),
                    404,
                    format!("no OOBI endpoint at {url}"),
                );
                return Ok(agent.start(network, Job::Done(op)));
            }

            let job = if agent.knows(&prefix) {
                Job::Done(Operation::completed(
                    format!("oobi.{}", Uuid::now_v7()),
                    json!({"alias": alias, "prefix": prefix}),
                ))
            } else {
                Job::Oobi {
                    prefix,
                    alias: alias.to_string(),
                }
            };
            Ok(agent.start(network, job))
        })
    }

    async fn query_key_state(&self, controller: &str, prefix: &str) -> Result<Operation> {
        self.with_agent(controller, |agent, network| {
            if !agent.knows(prefix) {
                return Err(HostError::NotFound(format!(
                    "{prefix} has not been introduced"
                )));
            }
            let published = network.kel(prefix).map_or(0, |events| events.len());
            Ok(agent.start(
                network,
                Job::Query {
                    prefix: prefix.to_string(),
                    sn: published.saturating_sub(1) as u64,
                },
            ))
        })
    }

    async fn key_event_log(&self, controller: &str, prefix: &str) -> Result<Vec<SignedEvent>> {
        self.with_agent(controller, |agent, network| {
            if let Some(kel) = agent.own(prefix) {
                return Ok(kel.to_vec());
            }
            if agent.introduced.contains_key(prefix) {
                return network
                    .view_kel(prefix)
                    .ok_or_else(|| HostError::NotFound(format!("key event log of {prefix}")));
            }
            Err(HostError::NotFound(format!("key event log of {prefix}")))
        })
    }

    async fn identifier(&self, controller: &str, alias: &str) -> Result<IdentifierRecord> {
        self.with_agent(controller, |agent, _| {
            let kel = agent.kel(alias)?;
            let state = kel.verify()?;
            Ok(IdentifierRecord {
                name: alias.to_string(),
                prefix: state.prefix.clone(),
                state,
            })
        })
    }

    async fn incept(&self, controller: &str, alias: &str, event: SignedEvent) -> Result<Operation> {
        self.with_agent(controller, |agent, network| {
            if agent.identifiers.contains_key(alias) || agent.pending.contains_key(alias) {
                return Err(HostError::rejected(409, format!("alias {alias} already in use")));
            }

            let ilk = event.event.ilk;
            let prefix = event.event.prefix.clone();
            let (kel, state) = Kel::verified(vec![event.clone()])?;

            match ilk {
                Ilk::Icp => {
                    network.publish(&prefix, kel.to_vec());
                    agent.identifiers.insert(alias.to_string(), kel);
                    info!(alias, prefix = %prefix, "Incepted identifier");
                    let record = IdentifierRecord {
                        name: alias.to_string(),
                        prefix: prefix.clone(),
                        state,
                    };
                    let response = encode(&record)?;
                    Ok(agent.start(
                        network,
                        Job::Witness {
                            prefix,
                            sn: 0,
                            response,
                        },
                    ))
                }
                Ilk::Dip => {
                    agent.pending.insert(alias.to_string(), prefix.clone());
                    info!(alias, prefix = %prefix, "Delegated inception awaiting approval");
                    Ok(agent.start(
                        network,
                        Job::Delegation {
                            alias: alias.to_string(),
                            event,
                        },
                    ))
                }
                other => Err(HostError::rejected(
                    400,
                    format!("expected an inception event, got {other:?}"),
                )),
            }
        })
    }

    async fn interact(&self, controller: &str, alias: &str, event: SignedEvent) -> Result<Operation> {
        self.with_agent(controller, |agent, network| {
            if !event.event.is_interaction() {
                return Err(HostError::rejected(400, "expected an interaction event"));
            }
            let kel = agent.kel_mut(alias)?;
            let state = kel.append(event)?;
            network.publish(&state.prefix, kel.to_vec());
            debug!(alias, sn = state.sn, "Appended interaction");

            let response = encode(&state)?;
            Ok(agent.start(
                network,
                Job::Witness {
                    prefix: state.prefix,
                    sn: state.sn,
                    response,
                },
            ))
        })
    }

    async fn registries(&self, controller: &str, alias: &str) -> Result<Vec<RegistryRecord>> {
        self.with_agent(controller, |agent, _| {
            let prefix = agent.prefix_of(alias)?;
            Ok(agent
                .registries
                .iter()
                .filter(|r| r.issuer == prefix)
                .cloned()
                .collect())
        })
    }

    async fn create_registry(
        &self,
        controller: &str,
        alias: &str,
        registry: RegistryRecord,
        anchor: SignedEvent,
    ) -> Result<Operation> {
        self.with_agent(controller, |agent, network| {
            let prefix = agent.prefix_of(alias)?;
            if registry.issuer != prefix {
                return Err(HostError::rejected(
                    400,
                    format!("registry issuer {} is not {alias}", registry.issuer),
                ));
            }
            registry.verify()?;

            if let Some(existing) = agent.registries.iter().find(|r| r.name == registry.name) {
                if existing.issuer == registry.issuer {
                    let op = Operation::completed(
                        format!("registry.{}", Uuid::now_v7()),
                        encode(existing)?,
                    );
                    return Ok(agent.start(network, Job::Done(op)));
                }
                return Err(HostError::rejected(
                    409,
                    format!(
                        "registry {} is owned by {}",
                        registry.name, existing.issuer
                    ),
                ));
            }

            let (prefix, sn) = agent.anchor(network, alias, anchor, &registry.seal())?;
            let response = encode(&registry)?;
            info!(alias, registry = %registry.name, regk = %registry.regk, "Created registry");
            agent.registries.push(registry);
            Ok(agent.start(network, Job::Witness { prefix, sn, response }))
        })
    }

    async fn schema(&self, controller: &str, said: &str) -> Result<Value> {
        self.with_agent(controller, |_, network| {
            network
                .lookup_schema(said)
                .ok_or_else(|| HostError::NotFound(format!("schema {said}")))
        })
    }

    async fn issue_credential(
        &self,
        controller: &str,
        alias: &str,
        credential: Credential,
        anchor: SignedEvent,
    ) -> Result<Operation> {
        self.with_agent(controller, |agent, network| {
            let prefix = agent.prefix_of(alias)?;
            credential.verify_said()?;
            if credential.issuer != prefix {
                return Err(HostError::rejected(
                    400,
                    format!("credential issuer {} is not {alias}", credential.issuer),
                ));
            }
            if !credential.is_self_attested() {
                return Err(HostError::rejected(400, "issuee must equal issuer"));
            }
            if !agent
                .registries
                .iter()
                .any(|r| r.regk == credential.registry && r.issuer == prefix)
            {
                return Err(HostError::NotFound(format!(
                    "registry {}",
                    credential.registry
                )));
            }

            let document = network
                .schema_document(&credential.schema)
                .ok_or_else(|| HostError::NotFound(format!("schema {}", credential.schema)))?;
            Schema::from_document(document)?.validate(&credential.attributes.fields)?;

            let (prefix, sn) = agent.anchor(network, alias, anchor, &credential_seal(&credential))?;
            let response = encode(&credential)?;
            info!(alias, said = %credential.said, "Issued credential");
            agent.credentials.insert(credential.said.clone(), credential);
            Ok(agent.start(network, Job::Witness { prefix, sn, response }))
        })
    }

    async fn submit_exchange(
        &self,
        controller: &str,
        alias: &str,
        exchange: SignedExchange,
    ) -> Result<Operation> {
        self.with_agent(controller, |agent, network| {
            let state = agent.kel(alias)?.verify()?;
            let exn = &exchange.exn;
            if exn.sender != state.prefix {
                return Err(HostError::rejected(
                    400,
                    format!("exchange sender {} is not {alias}", exn.sender),
                ));
            }
            exchange.verify(&state)?;

            match exn.route {
                Route::Grant => {
                    let credential = exn.credential().ok_or_else(|| {
                        HostError::rejected(400, "grant does not embed a credential")
                    })?;
                    credential.verify_said()?;
                }
                Route::Admit => {
                    let grant = network
                        .exchange(&exn.prior)
                        .ok_or_else(|| HostError::NotFound(format!("grant {}", exn.prior)))?;
                    if grant.exn.route != Route::Grant || grant.exn.recipient != exn.sender {
                        return Err(HostError::rejected(
                            400,
                            format!("{} cannot admit {}", exn.sender, exn.prior),
                        ));
                    }
                }
            }

            let said = exn.said.clone();
            let route = exn.route;
            let queued = network.store_exchange(exchange);
            debug!(said = %said, route = route.as_str(), queued, "Stored exchange");

            let op = Operation::completed(
                format!("exchange.{}", Uuid::now_v7()),
                json!({"said": said, "queued": queued}),
            );
            Ok(agent.start(network, Job::Done(op)))
        })
    }

    async fn exchange(&self, controller: &str, said: &str) -> Result<SignedExchange> {
        self.with_agent(controller, |agent, network| {
            let own = agent.own_prefixes();
            network
                .exchange(said)
                .filter(|e| own.contains(&e.exn.sender) || own.contains(&e.exn.recipient))
                .ok_or_else(|| HostError::NotFound(format!("exchange {said}")))
        })
    }

    async fn notifications(&self, controller: &str) -> Result<Vec<Notification>> {
        self.with_agent(controller, |agent, network| {
            agent.deliver(network);
            Ok(agent.notifications.clone())
        })
    }

    async fn mark_notification(&self, controller: &str, id: &str) -> Result<()> {
        self.with_agent(controller, |agent, _| {
            let note = agent
                .notifications
                .iter_mut()
                .find(|n| n.id == id)
                .ok_or_else(|| HostError::NotFound(format!("notification {id}")))?;
            note.read = true;
            Ok(())
        })
    }
}
