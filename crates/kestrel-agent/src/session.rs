//! Sessions against a hosting service.
//!
//! A session is bound to one controller key, derived from one passcode. Two
//! sessions with different passcodes are different parties even when they
//! share a hosting service.

use crate::config::{AgentConfig, Environment};
use crate::{AgentError, Result};
use kestrel_core::{KeyChain, Passcode, Signer};
use kestrel_host::types::oobi_url;
use kestrel_host::{AgentInfo, ControllerBootstrap, HostingService};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::info;

/// An authenticated connection between one controller and its agent.
pub struct Session {
    keychain: KeyChain,
    controller: String,
    agent: AgentInfo,
    config: AgentConfig,
    host: Arc<dyn HostingService>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Session {
    /// Authenticate `passcode` against `host` and boot (or reuse) its agent.
    pub async fn connect(
        host: Arc<dyn HostingService>,
        passcode: &Passcode,
        config: AgentConfig,
    ) -> Result<Self> {
        let keychain = KeyChain::from_passcode(passcode);
        let bootstrap = ControllerBootstrap::new(&keychain.controller());
        let agent = host.connect(&bootstrap).await?;
        if agent.controller != bootstrap.controller {
            return Err(AgentError::Authentication(format!(
                "host connected controller {} instead of {}",
                agent.controller, bootstrap.controller
            )));
        }

        info!(
            controller = %agent.controller,
            agent = %agent.agent,
            environment = ?config.environment.kind,
            "Session established"
        );
        Ok(Self {
            keychain,
            controller: bootstrap.controller,
            agent,
            config,
            host,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }

    pub fn agent(&self) -> &AgentInfo {
        &self.agent
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn environment(&self) -> &Environment {
        &self.config.environment
    }

    pub fn host(&self) -> &dyn HostingService {
        self.host.as_ref()
    }

    /// Current and next signers of a local identifier.
    pub fn signers(&self, alias: &str) -> (Signer, Signer) {
        self.keychain.identifier_signers(alias, 0)
    }

    /// OOBI URL of `prefix` in this session's environment.
    pub fn oobi_url(&self, prefix: &str) -> String {
        oobi_url(&self.config.environment.oobi_url, prefix)
    }

    /// Serialize state-changing calls on one identifier.
    pub async fn lock_identifier(&self, alias: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks.entry(alias.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Whether both sessions act for the same controller.
    pub fn same_party(&self, other: &Session) -> bool {
        self.controller == other.controller
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("controller", &self.controller)
            .field("agent", &self.agent.agent)
            .field("environment", &self.config.environment.kind)
            .finish()
    }
}

/// Reuses one session per (controller, agent URL) within a run.
pub struct SessionManager {
    host: Arc<dyn HostingService>,
    config: AgentConfig,
    sessions: Mutex<HashMap<(String, String), Arc<Session>>>,
}

impl SessionManager {
    pub fn new(host: Arc<dyn HostingService>, config: AgentConfig) -> Self {
        Self {
            host,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Return the session for `passcode` in `environment`, connecting on first use.
    ///
    /// A missing or malformed passcode is an authentication error; there is
    /// no fallback secret.
    pub async fn get_or_create(
        &self,
        passcode: Option<&str>,
        environment: &Environment,
    ) -> Result<Arc<Session>> {
        let passcode = passcode
            .ok_or_else(|| AgentError::Authentication("no passcode supplied".to_string()))?;
        let passcode = Passcode::parse(passcode)?;
        let controller = KeyChain::from_passcode(&passcode).controller().public_key();
        let key = (controller, environment.agent_url.clone());

        if let Some(session) = self.sessions.lock().unwrap().get(&key) {
            return Ok(session.clone());
        }

        let config = self.config.clone().with_environment(environment.clone());
        let session = Arc::new(Session::connect(self.host.clone(), &passcode, config).await?);

        let mut sessions = self.sessions.lock().unwrap();
        Ok(sessions.entry(key).or_insert(session).clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_host::MemoryHost;

    fn manager() -> (Arc<MemoryHost>, SessionManager) {
        let host = Arc::new(MemoryHost::default());
        let manager = SessionManager::new(host.clone(), AgentConfig::default());
        (host, manager)
    }

    #[tokio::test]
    async fn test_session_reused_for_same_passcode() {
        let (_, manager) = manager();
        let passcode = Passcode::generate();
        let env = Environment::local();

        let first = manager.get_or_create(Some(passcode.as_str()), &env).await.unwrap();
        let second = manager.get_or_create(Some(passcode.as_str()), &env).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_different_passcodes_are_different_parties() {
        let (_, manager) = manager();
        let env = Environment::local();
        let a = manager
            .get_or_create(Some(Passcode::generate().as_str()), &env)
            .await
            .unwrap();
        let b = manager
            .get_or_create(Some(Passcode::generate().as_str()), &env)
            .await
            .unwrap();
        assert!(!a.same_party(&b));
        assert!(a.same_party(&a));
    }

    #[tokio::test]
    async fn test_missing_or_malformed_passcode() {
        let (host, manager) = manager();
        let env = Environment::local();
        assert!(matches!(
            manager.get_or_create(None, &env).await,
            Err(AgentError::Authentication(_))
        ));
        assert!(matches!(
            manager.get_or_create(Some("short"), &env).await,
            Err(AgentError::Authentication(_))
        ));
        assert_eq!(host.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_retryable() {
        let (host, manager) = manager();
        host.set_reachable(false);
        let err = manager
            .get_or_create(Some(Passcode::generate().as_str()), &Environment::local())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::TransientNetwork { .. }));
        assert!(err.is_retryable());
    }
}
