//! Out-of-band introductions.

use crate::operation::{response, wait_for_operation};
use crate::retry::with_retry;
use crate::session::Session;
use crate::{AgentError, Result};
use kestrel_host::HostError;
use kestrel_host::types::oobi_prefix;
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Deserialize)]
struct Introduced {
    prefix: String,
}

/// Resolve `oobi_url` under `alias` and return the introduced prefix.
///
/// Resolving an introduction that is already known succeeds. When `expected`
/// is given, a different resulting prefix is fatal.
pub async fn resolve_introduction(
    session: &Session,
    oobi_url: &str,
    alias: &str,
    expected: Option<&str>,
) -> Result<String> {
    let advertised = oobi_prefix(oobi_url)
        .ok_or_else(|| AgentError::InvalidArgument(format!("not an OOBI URL: {oobi_url}")))?;
    check_expected(oobi_url, expected, &advertised)?;

    let policy = &session.config().retry;
    let advertised = advertised.as_str();
    let prefix = with_retry("resolve_oobi", policy, |attempt| async move {
        debug!(url = oobi_url, alias, attempt, "Resolving introduction");
        resolve_once(session, oobi_url, alias, advertised).await
    })
    .await?;

    check_expected(oobi_url, expected, &prefix)?;
    Ok(prefix)
}

async fn resolve_once(
    session: &Session,
    oobi_url: &str,
    alias: &str,
    advertised: &str,
) -> Result<String> {
    let host = session.host();
    let operation = match host
        .resolve_oobi(session.controller(), oobi_url, alias)
        .await
    {
        Ok(operation) => operation,
        Err(HostError::Rejected { status: 409, .. }) => {
            info!(url = oobi_url, alias, "Introduction already resolved");
            return Ok(advertised.to_string());
        }
        Err(err) => return Err(err.into()),
    };

    let timeout = session.environment().operation_timeout;
    let operation = wait_for_operation(session, operation, timeout).await?;
    let introduced: Introduced = response(&operation)?;
    info!(url = oobi_url, alias, prefix = %introduced.prefix, "Introduction resolved");
    Ok(introduced.prefix)
}

fn check_expected(url: &str, expected: Option<&str>, actual: &str) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => Err(AgentError::PrefixMismatch {
            subject: url.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, Environment};
    use crate::identifiers::create_identifier;
    use kestrel_core::Passcode;
    use kestrel_host::{MemoryHost, Network};
    use std::sync::Arc;

    async fn session(host: &Arc<MemoryHost>) -> Session {
        let env = Environment::custom("memory://host", &host.network().oobi_base());
        let config = AgentConfig::default().with_environment(env);
        Session::connect(host.clone(), &Passcode::generate(), config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let host = Arc::new(MemoryHost::new(Network::new("http://witness.local")));
        let alice = session(&host).await;
        let bob = session(&host).await;
        let record = create_identifier(&alice, "alice").await.unwrap();

        let url = bob.oobi_url(&record.prefix);
        let first = resolve_introduction(&bob, &url, "alice", Some(&record.prefix))
            .await
            .unwrap();
        let second = resolve_introduction(&bob, &url, "alice", None).await.unwrap();
        assert_eq!(first, record.prefix);
        assert_eq!(second, record.prefix);
    }

    #[tokio::test]
    async fn test_expected_prefix_mismatch_is_fatal() {
        let host = Arc::new(MemoryHost::default());
        let alice = session(&host).await;
        let record = create_identifier(&alice, "alice").await.unwrap();
        let other = kestrel_core::signing::digest(b"someone else").to_string();

        let calls = host.call_count();
        let err = resolve_introduction(&alice, &alice.oobi_url(&record.prefix), "x", Some(&other))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::PrefixMismatch { .. }));
        assert!(err.is_fatal());
        assert_eq!(host.call_count(), calls);
    }

    #[tokio::test]
    async fn test_rejects_non_oobi_url() {
        let host = Arc::new(MemoryHost::default());
        let alice = session(&host).await;
        assert!(matches!(
            resolve_introduction(&alice, "http://example.invalid/nothing", "x", None).await,
            Err(AgentError::InvalidArgument(_))
        ));
    }
}
