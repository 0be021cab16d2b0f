//! Agent configuration.
//!
//! Everything a flow needs is passed in explicitly through [`AgentConfig`]
//! and [`Environment`]. Durations are milliseconds in JSON.

use crate::exchange::NotificationPolling;
use crate::keystate::{KeyStateQuery, RegistrationPolling};
use crate::retry::RetryPolicy;
use crate::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    Local,
    Testnet,
    Custom,
}

/// Where a session's hosting service lives and how long to wait on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub kind: EnvironmentKind,
    pub agent_url: String,
    /// Base URL under which OOBIs are published.
    pub oobi_url: String,
    #[serde(with = "millis")]
    pub operation_timeout: Duration,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
}

impl Environment {
    pub fn local() -> Self {
        Self {
            kind: EnvironmentKind::Local,
            agent_url: "http://127.0.0.1:3901".to_string(),
            oobi_url: "http://127.0.0.1:3901".to_string(),
            operation_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn testnet() -> Self {
        Self {
            kind: EnvironmentKind::Testnet,
            agent_url: "http://127.0.0.1:3911".to_string(),
            oobi_url: "http://127.0.0.1:3911".to_string(),
            operation_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// An environment backed by an in-process network.
    pub fn custom(agent_url: &str, oobi_url: &str) -> Self {
        Self {
            kind: EnvironmentKind::Custom,
            agent_url: agent_url.to_string(),
            oobi_url: oobi_url.to_string(),
            ..Self::local()
        }
    }

    pub fn from_kind(kind: EnvironmentKind) -> Self {
        match kind {
            EnvironmentKind::Testnet => Self::testnet(),
            EnvironmentKind::Local | EnvironmentKind::Custom => Self::local(),
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::local()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub environment: Environment,
    pub retry: RetryPolicy,
    pub key_state: KeyStateQuery,
    pub registration: RegistrationPolling,
    pub notifications: NotificationPolling,
}

impl AgentConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| AgentError::InvalidArgument(format!("invalid agent config: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AgentError::InvalidArgument(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }
}

/// Serialize a [`Duration`] as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
