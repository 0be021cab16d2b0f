//! Identifier lifecycle: inception, delegated inception and interaction.

use crate::operation::{response, wait_for_operation};
use crate::session::Session;
use crate::{AgentError, Result};
use kestrel_core::{KeyEvent, KeyState, Prefix, Seal, SignedEvent};
use kestrel_host::IdentifierRecord;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// A delegated inception submitted by the delegate and awaiting approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationRequest {
    pub alias: String,
    /// Prefix of the delegate.
    pub prefix: String,
    pub delegator: String,
    /// Seal the delegator must anchor to approve.
    pub seal: Seal,
    /// Host operation that completes once the approval is visible.
    pub operation: String,
}

/// Incept a new identifier under `alias`.
pub async fn create_identifier(session: &Session, alias: &str) -> Result<IdentifierRecord> {
    let _guard = session.lock_identifier(alias).await;
    let (current, next) = session.signers(alias);
    let icp = KeyEvent::inception(&[&current], &[&next])?;
    let signed = SignedEvent::sign(icp, &[&current])?;

    let operation = session
        .host()
        .incept(session.controller(), alias, signed)
        .await?;
    let operation =
        wait_for_operation(session, operation, session.environment().operation_timeout).await?;
    let record: IdentifierRecord = response(&operation)?;
    info!(alias, prefix = %record.prefix, "Identifier created");
    Ok(record)
}

/// Submit a delegated inception naming `delegator`.
///
/// The identifier only becomes usable once the delegator approves it with
/// [`approve_delegation`].
pub async fn request_delegated_identifier(
    session: &Session,
    alias: &str,
    delegator: &str,
) -> Result<DelegationRequest> {
    delegator
        .parse::<Prefix>()
        .map_err(|e| AgentError::InvalidArgument(format!("delegator {delegator}: {e}")))?;

    let _guard = session.lock_identifier(alias).await;
    let (current, next) = session.signers(alias);
    let dip = KeyEvent::delegated_inception(&[&current], &[&next], delegator)?;
    let seal = dip.seal();
    let signed = SignedEvent::sign(dip, &[&current])?;

    let operation = session
        .host()
        .incept(session.controller(), alias, signed)
        .await?;
    info!(alias, prefix = %seal.prefix, delegator, "Delegation requested");

    Ok(DelegationRequest {
        alias: alias.to_string(),
        prefix: seal.prefix.clone(),
        delegator: delegator.to_string(),
        seal,
        operation: operation.name,
    })
}

/// Approve `request` by anchoring its seal in the delegator's KEL.
pub async fn approve_delegation(
    session: &Session,
    delegator_alias: &str,
    request: &DelegationRequest,
) -> Result<KeyState> {
    let record = session
        .host()
        .identifier(session.controller(), delegator_alias)
        .await?;
    if record.prefix != request.delegator {
        return Err(AgentError::InvalidArgument(format!(
            "{} was requested of {}, not {delegator_alias} ({})",
            request.prefix, request.delegator, record.prefix
        )));
    }
    if request.seal.prefix != request.prefix || request.seal.sn != 0 {
        return Err(AgentError::InvalidArgument(format!(
            "seal does not reference the inception of {}",
            request.prefix
        )));
    }

    let state = interact(session, delegator_alias, vec![request.seal.clone()]).await?;
    info!(
        delegator = %record.prefix,
        delegate = %request.prefix,
        sn = state.sn,
        "Delegation approved"
    );
    Ok(state)
}

/// Wait until an approved delegation is usable by the delegate.
pub async fn await_delegation(
    session: &Session,
    request: &DelegationRequest,
    timeout: Duration,
) -> Result<IdentifierRecord> {
    let operation = session
        .host()
        .operation(session.controller(), &request.operation)
        .await?;
    let operation = wait_for_operation(session, operation, timeout).await?;
    let record: IdentifierRecord = response(&operation)?;
    if record.prefix != request.prefix {
        return Err(AgentError::PrefixMismatch {
            subject: format!("delegated identifier {}", request.alias),
            expected: request.prefix.clone(),
            actual: record.prefix,
        });
    }
    Ok(record)
}

/// Anchor `anchors` in a new interaction event of `alias`.
pub async fn interact(session: &Session, alias: &str, anchors: Vec<Seal>) -> Result<KeyState> {
    let _guard = session.lock_identifier(alias).await;
    let event = anchor_event(session, alias, anchors).await?;
    let operation = session
        .host()
        .interact(session.controller(), alias, event)
        .await?;
    let operation =
        wait_for_operation(session, operation, session.environment().operation_timeout).await?;
    response(&operation)
}

/// Build and sign the next interaction event of `alias` without submitting it.
///
/// Callers must hold the identifier lock.
pub(crate) async fn anchor_event(
    session: &Session,
    alias: &str,
    anchors: Vec<Seal>,
) -> Result<SignedEvent> {
    let record = session
        .host()
        .identifier(session.controller(), alias)
        .await?;
    let kel = session
        .host()
        .key_event_log(session.controller(), &record.prefix)
        .await?;
    let last = kel.last().ok_or_else(|| {
        AgentError::PropagationNotYetVisible(format!("key event log of {alias} is empty"))
    })?;

    let (current, _) = session.signers(alias);
    let ixn = KeyEvent::interaction(&last.event, anchors)?;
    Ok(SignedEvent::sign(ixn, &[&current])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use kestrel_core::Passcode;
    use kestrel_host::MemoryHost;
    use std::sync::Arc;

    async fn session(host: &Arc<MemoryHost>) -> Session {
        Session::connect(host.clone(), &Passcode::generate(), AgentConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_is_deterministic_per_passcode() {
        let passcode = Passcode::generate();
        let mut prefixes = Vec::new();
        for _ in 0..2 {
            let host = Arc::new(MemoryHost::default());
            let session = Session::connect(host, &passcode, AgentConfig::default())
                .await
                .unwrap();
            prefixes.push(create_identifier(&session, "trader").await.unwrap().prefix);
        }
        assert_eq!(prefixes[0], prefixes[1]);
    }

    #[tokio::test]
    async fn test_delegation_round_trip() {
        let host = Arc::new(MemoryHost::default());
        let root = session(&host).await;
        let child = session(&host).await;
        let delegator = create_identifier(&root, "root").await.unwrap();

        let request = request_delegated_identifier(&child, "child", &delegator.prefix)
            .await
            .unwrap();
        assert_eq!(request.seal.prefix, request.prefix);

        let state = approve_delegation(&root, "root", &request).await.unwrap();
        assert_eq!(state.sn, 1);

        let record = await_delegation(&child, &request, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(record.state.delegator.as_deref(), Some(delegator.prefix.as_str()));
    }

    #[tokio::test]
    async fn test_approval_by_wrong_delegator_rejected() {
        let host = Arc::new(MemoryHost::default());
        let root = session(&host).await;
        let delegator = create_identifier(&root, "root").await.unwrap();
        create_identifier(&root, "other").await.unwrap();

        let child = session(&host).await;
        let request = request_delegated_identifier(&child, "child", &delegator.prefix)
            .await
            .unwrap();
        assert!(matches!(
            approve_delegation(&root, "other", &request).await,
            Err(AgentError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_delegator_rejected_locally() {
        let host = Arc::new(MemoryHost::default());
        let child = session(&host).await;
        let calls = host.call_count();
        assert!(matches!(
            request_delegated_identifier(&child, "child", "not-a-prefix").await,
            Err(AgentError::InvalidArgument(_))
        ));
        assert_eq!(host.call_count(), calls);
    }
}
