//! Delegated-inception verification.
//!
//! A delegation holds only if the delegate's `dip` names the delegator, the
//! delegator's KEL anchors the `dip` seal in an interaction event, and both
//! logs replay with valid signatures. A mismatch is final. A delegator whose
//! key state cannot be observed yet leaves the outcome undetermined.

use crate::error::Unavailability;
use crate::keystate::{KeyStateQuery, fetch_key_event_log, query_key_state};
use crate::oobi::resolve_introduction;
use crate::session::Session;
use crate::{AgentError, Result};
use kestrel_core::Kel;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DelegationStatus {
    Verified { anchor_sn: u64, anchor_said: String },
    /// The delegator's key state was not observable.
    Undetermined {
        attempts: u32,
        #[serde(skip)]
        cause: Unavailability,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelegationReport {
    pub delegate: String,
    pub delegator: String,
    #[serde(flatten)]
    pub status: DelegationStatus,
    pub reason: String,
}

impl DelegationReport {
    pub fn is_verified(&self) -> bool {
        matches!(self.status, DelegationStatus::Verified { .. })
    }
}

/// Verify that `delegate` was delegated by `delegator`.
///
/// Rejections (`DelegationRejected`, `SignatureInvalid`) are returned as
/// errors; an unobservable delegator is an `Undetermined` report.
pub async fn verify_delegation(
    session: &Session,
    delegate: &str,
    delegator: &str,
    query: &KeyStateQuery,
) -> Result<DelegationReport> {
    let rejected = |reason: String| AgentError::DelegationRejected {
        delegate: delegate.to_string(),
        delegator: delegator.to_string(),
        reason,
    };

    resolve_introduction(session, &session.oobi_url(delegator), delegator, Some(delegator)).await?;

    let delegator_state = match query_key_state(session, delegator, query).await {
        Ok(state) => state,
        Err(AgentError::KeyStateUnavailable {
            attempts, cause, ..
        }) => {
            warn!(delegate, delegator, attempts, %cause, "Delegation undetermined");
            return Ok(DelegationReport {
                delegate: delegate.to_string(),
                delegator: delegator.to_string(),
                status: DelegationStatus::Undetermined { attempts, cause },
                reason: format!("key state of delegator unavailable: {cause}"),
            });
        }
        Err(err) => return Err(err),
    };

    resolve_introduction(session, &session.oobi_url(delegate), delegate, Some(delegate)).await?;
    let delegate_kel = fetch_key_event_log(session, delegate).await?;
    let dip = &delegate_kel
        .inception()
        .ok_or_else(|| rejected("delegate has no inception event".to_string()))?
        .event;

    if !dip.is_delegated_inception() {
        return Err(rejected(format!(
            "inception of {delegate} is {:?}, not a delegated inception",
            dip.ilk
        )));
    }
    if dip.prefix != delegate {
        return Err(rejected(format!(
            "inception belongs to {}, not {delegate}",
            dip.prefix
        )));
    }
    match dip.delegator.as_deref() {
        Some(named) if named == delegator => {}
        named => {
            return Err(rejected(format!(
                "dip names delegator {}, expected {delegator}",
                named.unwrap_or("<none>")
            )));
        }
    }

    let delegator_kel = fetch_key_event_log(session, delegator).await?;
    let seal = dip.seal();
    let anchor = delegator_kel
        .iter()
        .filter(|e| e.event.sn <= delegator_state.sn)
        .find(|e| e.event.is_interaction() && e.event.anchors.contains(&seal))
        .ok_or_else(|| {
            rejected(format!(
                "no interaction event of {delegator} up to sn {} anchors {}",
                delegator_state.sn, seal.said
            ))
        })?;

    if let Some(source) = &delegate_kel[0].source_seal
        && (source.sn != anchor.event.sn || source.said != anchor.event.said)
    {
        return Err(rejected(format!(
            "source seal points at sn {} but the anchor is at sn {}",
            source.sn, anchor.event.sn
        )));
    }

    verify_log(&delegator_kel, delegator)?;
    verify_log(&delegate_kel, delegate)?;

    info!(delegate, delegator, anchor_sn = anchor.event.sn, "Delegation verified");
    Ok(DelegationReport {
        delegate: delegate.to_string(),
        delegator: delegator.to_string(),
        status: DelegationStatus::Verified {
            anchor_sn: anchor.event.sn,
            anchor_said: anchor.event.said.clone(),
        },
        reason: format!("dip anchored by {delegator} at sn {}", anchor.event.sn),
    })
}

fn verify_log(kel: &Kel, prefix: &str) -> Result<()> {
    kel.verify()
        .map(|_| ())
        .map_err(|e| AgentError::SignatureInvalid(format!("key event log of {prefix}: {e}")))
}
