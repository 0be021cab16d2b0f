//! Key-state queries and registration polling.
//!
//! Witness receipts propagate asynchronously, so a freshly published key state
//! is often invisible to one party for a while. The loops here keep their own
//! per-attempt diagnostics instead of hiding inside [`crate::retry`], because
//! that trail is what tells receipt lag apart from a dead service.

use crate::config::millis;
use crate::error::Unavailability;
use crate::operation::{response, wait_for_operation};
use crate::session::Session;
use crate::{AgentError, Result};
use kestrel_core::{Kel, KeyState};
use kestrel_host::{HostError, INVALID_KEL, IdentifierRecord};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Bounds for [`query_key_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStateQuery {
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub delay: Duration,
    /// How long each attempt waits on its operation.
    #[serde(with = "millis")]
    pub attempt_timeout: Duration,
}

impl Default for KeyStateQuery {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

/// Bounds for [`verify_identifier_registered`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationPolling {
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub delay: Duration,
}

impl Default for RegistrationPolling {
    fn default() -> Self {
        Self {
            max_retries: 10,
            delay: Duration::from_secs(1),
        }
    }
}

/// What one key-state attempt observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryAttempt {
    pub attempt: u32,
    /// Operation name, if the host accepted the query.
    pub operation: Option<String>,
    pub done: bool,
    pub outcome: String,
}

/// Query the current key state of `prefix`.
///
/// `prefix` must already be introduced to the session. On exhaustion the
/// error carries every attempt and whether the host was reachable at all.
pub async fn query_key_state(
    session: &Session,
    prefix: &str,
    query: &KeyStateQuery,
) -> Result<KeyState> {
    let max_retries = query.max_retries.max(1);
    let mut trail = Vec::new();
    let mut reached = false;

    for attempt in 1..=max_retries {
        let failure = match query_once(session, prefix, query).await {
            Ok(state) => {
                debug!(prefix, attempt, sn = state.sn, "Key state observed");
                return Ok(state);
            }
            Err(failure) => failure,
        };
        if failure.error.is_fatal() {
            return Err(failure.error);
        }

        let Failure { operation, error } = failure;
        reached |= operation.is_some() || !matches!(error, AgentError::TransientNetwork { .. });
        let done = matches!(error, AgentError::OperationTimeout { done: true, .. });
        warn!(
            prefix,
            attempt,
            max_retries,
            operation = operation.as_deref().unwrap_or("-"),
            done,
            error = %error,
            "Key state not available"
        );
        trail.push(QueryAttempt {
            attempt,
            operation,
            done,
            outcome: error.to_string(),
        });

        if attempt < max_retries {
            tokio::time::sleep(query.delay).await;
        }
    }

    Err(AgentError::KeyStateUnavailable {
        prefix: prefix.to_string(),
        attempts: trail.len() as u32,
        cause: if reached {
            Unavailability::NoReceipts
        } else {
            Unavailability::ServiceUnreachable
        },
        trail,
    })
}

struct Failure {
    operation: Option<String>,
    error: AgentError,
}

async fn query_once(
    session: &Session,
    prefix: &str,
    query: &KeyStateQuery,
) -> std::result::Result<KeyState, Failure> {
    let operation = session
        .host()
        .query_key_state(session.controller(), prefix)
        .await
        .map_err(|e| Failure {
            operation: None,
            error: e.into(),
        })?;

    let name = operation.name.clone();
    let failure = |error: AgentError| Failure {
        operation: Some(name.clone()),
        error,
    };
    let operation = wait_for_operation(session, operation, query.attempt_timeout)
        .await
        .map_err(|error| match error {
            AgentError::OperationFailed {
                code: INVALID_KEL,
                message,
                ..
            } => AgentError::SignatureInvalid(format!("key event log of {prefix}: {message}")),
            error => error,
        })
        .map_err(failure)?;
    let state: KeyState = response(&operation).map_err(failure)?;

    if state.prefix != prefix {
        return Err(failure(AgentError::PrefixMismatch {
            subject: format!("key state query {name}"),
            expected: prefix.to_string(),
            actual: state.prefix,
        }));
    }
    Ok(state)
}

/// Fetch the key event log of `prefix` as the host serves it, unverified.
pub async fn fetch_key_event_log(session: &Session, prefix: &str) -> Result<Kel> {
    let events = session
        .host()
        .key_event_log(session.controller(), prefix)
        .await?;
    Ok(Kel::from_events(events))
}

/// Poll until local identifier `alias` exists with prefix `expected`.
pub async fn verify_identifier_registered(
    session: &Session,
    alias: &str,
    expected: &str,
    polling: &RegistrationPolling,
) -> Result<IdentifierRecord> {
    let max_retries = polling.max_retries.max(1);

    for attempt in 1..=max_retries {
        match session.host().identifier(session.controller(), alias).await {
            Ok(record) if record.prefix == expected => return Ok(record),
            Ok(record) => {
                return Err(AgentError::PrefixMismatch {
                    subject: format!("identifier {alias}"),
                    expected: expected.to_string(),
                    actual: record.prefix,
                });
            }
            Err(HostError::NotFound(_)) => {
                debug!(alias, attempt, max_retries, "Identifier not registered yet");
            }
            Err(err) => {
                let err = AgentError::from(err);
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(alias, attempt, max_retries, error = %err, "Registration check failed");
            }
        }

        if attempt < max_retries {
            tokio::time::sleep(polling.delay).await;
        }
    }

    Err(AgentError::IdentifierNotRegistered {
        alias: alias.to_string(),
        expected: expected.to_string(),
        attempts: max_retries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::identifiers::{create_identifier, request_delegated_identifier};
    use crate::oobi::resolve_introduction;
    use kestrel_core::Passcode;
    use kestrel_host::{HostingService, MemoryHost};
    use std::sync::Arc;

    async fn session(host: &Arc<MemoryHost>) -> Session {
        Session::connect(host.clone(), &Passcode::generate(), AgentConfig::default())
            .await
            .unwrap()
    }

    fn quick() -> KeyStateQuery {
        KeyStateQuery {
            max_retries: 5,
            delay: Duration::from_millis(100),
            attempt_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_host_exhausts_all_attempts() {
        let host = Arc::new(MemoryHost::default());
        let session = session(&host).await;
        host.set_reachable(false);

        let err = query_key_state(&session, "Iunreachable", &quick())
            .await
            .unwrap_err();
        match err {
            AgentError::KeyStateUnavailable {
                attempts,
                cause,
                trail,
                ..
            } => {
                assert_eq!(attempts, 5);
                assert_eq!(cause, Unavailability::ServiceUnreachable);
                assert_eq!(trail.len(), 5);
                assert!(trail.iter().all(|a| a.operation.is_none()));
            }
            other => panic!("expected key state unavailable, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreceipted_event_blocks_query() {
        let host = Arc::new(MemoryHost::default());
        let alice = session(&host).await;
        let bob = session(&host).await;
        let record = create_identifier(&alice, "alice").await.unwrap();
        resolve_introduction(&bob, &bob.oobi_url(&record.prefix), "alice", None)
            .await
            .unwrap();
        assert_eq!(query_key_state(&bob, &record.prefix, &quick()).await.unwrap().sn, 0);

        // an interaction nobody receipts times out for alice and for bob's query
        host.network().set_receipt_lag(u32::MAX);
        crate::identifiers::interact(&alice, "alice", Vec::new())
            .await
            .unwrap_err();

        match query_key_state(&bob, &record.prefix, &quick()).await {
            Err(AgentError::KeyStateUnavailable { cause, trail, .. }) => {
                assert_eq!(cause, Unavailability::NoReceipts);
                assert!(trail.iter().all(|a| a.operation.is_some()));
            }
            other => panic!("expected key state unavailable, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpublished_prefix_is_no_receipts() {
        let host = Arc::new(MemoryHost::default());
        host.network().set_receipt_lag(u32::MAX);
        let alice = session(&host).await;
        let bob = session(&host).await;

        let (current, next) = alice.signers("hidden");
        let icp = kestrel_core::KeyEvent::inception(&[&current], &[&next]).unwrap();
        let prefix = icp.prefix.clone();
        let signed = kestrel_core::SignedEvent::sign(icp, &[&current]).unwrap();
        host.incept(alice.controller(), "hidden", signed).await.unwrap();

        // alice knows her own identifier, but nothing is receipted yet
        let err = query_key_state(&alice, &prefix, &quick()).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::KeyStateUnavailable {
                cause: Unavailability::NoReceipts,
                attempts: 5,
                ..
            }
        ));

        // bob has not been introduced; the host answers, so this is not an outage
        let err = query_key_state(&bob, &prefix, &quick()).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::KeyStateUnavailable {
                cause: Unavailability::NoReceipts,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_delegation_not_registered() {
        let host = Arc::new(MemoryHost::default());
        let root = session(&host).await;
        let child = session(&host).await;
        let delegator = create_identifier(&root, "root").await.unwrap();
        let request = request_delegated_identifier(&child, "child", &delegator.prefix)
            .await
            .unwrap();

        let polling = RegistrationPolling {
            max_retries: 3,
            delay: Duration::from_millis(10),
        };
        let err = verify_identifier_registered(&child, "child", &request.prefix, &polling)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::IdentifierNotRegistered { attempts: 3, .. }
        ));
        assert!(err.to_string().contains("delegation handshake"));
    }
}
