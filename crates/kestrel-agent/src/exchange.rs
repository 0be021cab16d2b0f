//! The Grant/Admit credential exchange.
//!
//! ```text
//! Created -> GrantSent -> NotificationObserved -> Admitted
//!                     \-> Unconfirmed
//! ```
//!
//! Sender and receiver are independent parties, each with its own session.
//! Nothing guarantees the receiver ever hears about a Grant, so once the Grant
//! is sent a missing notification or a failed Admit ends the exchange as
//! `Unconfirmed` instead of failing it. The Grant stays fetchable and
//! verifiable by its SAID.

use crate::config::millis;
use crate::keystate::query_key_state;
use crate::oobi::resolve_introduction;
use crate::operation::{response, wait_for_operation};
use crate::session::Session;
use crate::{AgentError, Result};
use kestrel_core::exchange::{ExchangeMessage, Route, SignedExchange};
use kestrel_core::{Credential, KeyState};
use kestrel_host::Notification;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    Created,
    GrantSent,
    NotificationObserved,
    Admitted,
    /// The Grant was sent; the Admit could not be confirmed.
    Unconfirmed,
}

/// Who a Grant is addressed to and how to introduce them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counterparty {
    pub prefix: String,
    pub oobi: String,
}

/// Durable evidence of a sent Grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantRecord {
    /// SAID of the Grant message.
    pub grant: String,
    /// SAID of the granted credential.
    pub credential: String,
    pub sender: String,
    pub recipient: String,
    pub sent_at: String,
}

/// How long a receiver looks for a Grant notification.
///
/// A liveness check, kept short on purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPolling {
    pub attempts: u32,
    #[serde(with = "millis")]
    pub interval: Duration,
}

impl Default for NotificationPolling {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(1),
        }
    }
}

/// Outcome of [`exchange_credential`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeReport {
    pub state: ExchangeState,
    pub grant: GrantRecord,
    /// SAID of the Admit, once admitted.
    pub admit: Option<String>,
    /// Why the Admit is unconfirmed.
    pub reason: Option<String>,
}

impl ExchangeReport {
    pub fn is_admitted(&self) -> bool {
        self.state == ExchangeState::Admitted
    }

    /// Turn an unconfirmed exchange into a terminal `ExchangeUnconfirmed` error.
    pub fn require_admitted(&self) -> Result<&str> {
        match &self.admit {
            Some(admit) if self.is_admitted() => Ok(admit),
            _ => Err(AgentError::ExchangeUnconfirmed {
                grant: self.grant.grant.clone(),
                reason: self
                    .reason
                    .clone()
                    .unwrap_or_else(|| "admit not observed".to_string()),
            }),
        }
    }
}

#[derive(Deserialize)]
struct Submitted {
    said: String,
    #[serde(default)]
    queued: bool,
}

/// Send `credential` from `alias` to `counterparty` as a Grant.
///
/// The counterparty is introduced and its key state queried first. The Grant
/// is submitted once; it is not retried.
pub async fn send_grant(
    sender: &Session,
    alias: &str,
    credential: &Credential,
    counterparty: &Counterparty,
    message: &str,
) -> Result<GrantRecord> {
    resolve_introduction(
        sender,
        &counterparty.oobi,
        &counterparty.prefix,
        Some(&counterparty.prefix),
    )
    .await?;
    let state = query_key_state(sender, &counterparty.prefix, &sender.config().key_state).await?;
    debug!(recipient = %state.prefix, sn = state.sn, "Counterparty key state observed");

    let _guard = sender.lock_identifier(alias).await;
    let own = sender
        .host()
        .identifier(sender.controller(), alias)
        .await?;
    if credential.issuer != own.prefix {
        return Err(AgentError::InvalidArgument(format!(
            "credential {} was issued by {}, not {alias}",
            credential.said, credential.issuer
        )));
    }

    let exn = ExchangeMessage::grant(&own.prefix, &counterparty.prefix, credential.clone(), message)?;
    let (current, _) = sender.signers(alias);
    let signed = SignedExchange::sign(exn, &[&current])?;
    let record = GrantRecord {
        grant: signed.exn.said.clone(),
        credential: credential.said.clone(),
        sender: own.prefix.clone(),
        recipient: counterparty.prefix.clone(),
        sent_at: signed.exn.timestamp.clone(),
    };

    let operation = sender
        .host()
        .submit_exchange(sender.controller(), alias, signed)
        .await?;
    let operation =
        wait_for_operation(sender, operation, sender.environment().operation_timeout).await?;
    let submitted: Submitted = response(&operation)?;
    if submitted.said != record.grant {
        return Err(AgentError::SchemaMismatch(format!(
            "host stored exchange {} for grant {}",
            submitted.said, record.grant
        )));
    }

    info!(
        grant = %record.grant,
        credential = %record.credential,
        recipient = %record.recipient,
        queued = submitted.queued,
        "Grant sent"
    );
    Ok(record)
}

/// Poll the receiver's notifications for the Grant `grant_said`.
pub async fn observe_grant(
    receiver: &Session,
    grant_said: &str,
    polling: &NotificationPolling,
) -> Result<Option<Notification>> {
    let attempts = polling.attempts.max(1);
    for attempt in 1..=attempts {
        let notifications = receiver.host().notifications(receiver.controller()).await?;
        if let Some(note) = notifications
            .into_iter()
            .find(|n| n.exchange == grant_said && n.route == Route::Grant.as_str())
        {
            debug!(grant = grant_said, attempt, "Grant notification observed");
            return Ok(Some(note));
        }
        debug!(grant = grant_said, attempt, attempts, "No grant notification yet");
        if attempt < attempts {
            tokio::time::sleep(polling.interval).await;
        }
    }
    Ok(None)
}

/// Fetch a Grant, check it against its sender's key state, and return its credential.
async fn verified_grant(
    session: &Session,
    grant_said: &str,
) -> Result<(SignedExchange, KeyState, Credential)> {
    let grant = session
        .host()
        .exchange(session.controller(), grant_said)
        .await?;
    if grant.exn.said != grant_said || grant.exn.route != Route::Grant {
        return Err(AgentError::InvalidArgument(format!(
            "{grant_said} is not a grant"
        )));
    }

    let sender_state =
        query_key_state(session, &grant.exn.sender, &session.config().key_state).await?;
    grant.verify(&sender_state)?;

    let credential = grant
        .exn
        .credential()
        .cloned()
        .ok_or_else(|| AgentError::SchemaMismatch(format!("grant {grant_said} embeds no credential")))?;
    credential.verify_said()?;
    if !credential.is_self_attested() || credential.issuer != grant.exn.sender {
        return Err(AgentError::SignatureInvalid(format!(
            "credential {} is not self-attested by grant sender {}",
            credential.said, grant.exn.sender
        )));
    }
    Ok((grant, sender_state, credential))
}

/// Admit the Grant `grant_said` as `alias`; returns the Admit's SAID.
pub async fn admit_grant(
    receiver: &Session,
    alias: &str,
    grant_said: &str,
    message: &str,
) -> Result<String> {
    let own = receiver
        .host()
        .identifier(receiver.controller(), alias)
        .await?;
    let (grant, _, credential) = verified_grant(receiver, grant_said).await?;
    if grant.exn.recipient != own.prefix {
        return Err(AgentError::InvalidArgument(format!(
            "grant {grant_said} is addressed to {}, not {alias}",
            grant.exn.recipient
        )));
    }

    let admit = ExchangeMessage::admit(&own.prefix, &grant.exn, message)?;
    let (current, _) = receiver.signers(alias);
    let signed = SignedExchange::sign(admit, &[&current])?;
    let admit_said = signed.exn.said.clone();

    let operation = receiver
        .host()
        .submit_exchange(receiver.controller(), alias, signed)
        .await?;
    let operation =
        wait_for_operation(receiver, operation, receiver.environment().operation_timeout).await?;
    let submitted: Submitted = response(&operation)?;
    if submitted.said != admit_said {
        return Err(AgentError::SchemaMismatch(format!(
            "host stored exchange {} for admit {admit_said}",
            submitted.said
        )));
    }

    info!(
        grant = grant_said,
        admit = %admit_said,
        credential = %credential.said,
        "Grant admitted"
    );
    Ok(admit_said)
}

/// Independently verify a recorded Grant and return the granted credential.
///
/// Works from either party's session.
pub async fn verify_grant(session: &Session, record: &GrantRecord) -> Result<Credential> {
    let (grant, sender_state, credential) = verified_grant(session, &record.grant).await?;
    if grant.exn.sender != record.sender
        || grant.exn.recipient != record.recipient
        || credential.said != record.credential
    {
        return Err(AgentError::InvalidArgument(format!(
            "grant {} does not match its record",
            record.grant
        )));
    }
    info!(
        grant = %record.grant,
        credential = %credential.said,
        sender = %record.sender,
        sender_sn = sender_state.sn,
        "Grant verified"
    );
    Ok(credential)
}

/// Admit a Grant recorded in an earlier run.
///
/// The sender is introduced first, through this session's OOBI endpoint.
pub async fn admit_recorded_grant(
    receiver: &Session,
    alias: &str,
    record: &GrantRecord,
) -> Result<String> {
    let oobi = receiver.oobi_url(&record.sender);
    resolve_introduction(receiver, &oobi, &record.sender, Some(&record.sender)).await?;
    admit_grant(receiver, alias, &record.grant, "").await
}

/// Run the full exchange of `credential` from `sender` to `receiver`.
///
/// Failures before the Grant is sent are returned as errors. Afterwards the
/// exchange ends `Admitted` or `Unconfirmed`, and both are `Ok`.
pub async fn exchange_credential(
    sender: &Session,
    sender_alias: &str,
    credential: &Credential,
    receiver: &Session,
    receiver_alias: &str,
) -> Result<ExchangeReport> {
    let mut state = ExchangeState::Created;
    debug!(credential = %credential.said, ?state, "Starting exchange");

    let recipient = receiver
        .host()
        .identifier(receiver.controller(), receiver_alias)
        .await?;
    let counterparty = Counterparty {
        oobi: receiver.oobi_url(&recipient.prefix),
        prefix: recipient.prefix,
    };
    if !sender.same_party(receiver) {
        info!(
            sender = sender.controller(),
            receiver = receiver.controller(),
            "Parties use independent sessions; the admit may stay unconfirmed"
        );
    }

    let grant = send_grant(sender, sender_alias, credential, &counterparty, "").await?;
    state = ExchangeState::GrantSent;
    debug!(grant = %grant.grant, ?state, "Exchange progressed");

    let polling = &receiver.config().notifications;
    let outcome = match observe_grant(receiver, &grant.grant, polling).await {
        Ok(Some(note)) => {
            state = ExchangeState::NotificationObserved;
            debug!(grant = %grant.grant, notification = %note.id, ?state, "Exchange progressed");
            match admit_grant(receiver, receiver_alias, &grant.grant, "").await {
                Ok(admit) => {
                    if let Err(err) = receiver
                        .host()
                        .mark_notification(receiver.controller(), &note.id)
                        .await
                    {
                        warn!(notification = %note.id, error = %err, "Could not mark notification read");
                    }
                    Ok(admit)
                }
                Err(err) => Err(format!("admit failed: {err}")),
            }
        }
        Ok(None) => Err(format!(
            "no notification for grant after {} polls",
            polling.attempts.max(1)
        )),
        Err(err) => Err(format!("notifications unavailable: {err}")),
    };

    let report = match outcome {
        Ok(admit) => ExchangeReport {
            state: ExchangeState::Admitted,
            grant,
            admit: Some(admit),
            reason: None,
        },
        Err(reason) => {
            warn!(
                grant = %grant.grant,
                reason = %reason,
                "Grant sent, admit unconfirmed"
            );
            ExchangeReport {
                state: ExchangeState::Unconfirmed,
                grant,
                admit: None,
                reason: Some(reason),
            }
        }
    };
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::error::Retryability;
    use crate::identifiers::create_identifier;
    use crate::registry::{create_registry, issue_self_attested, saidify_schema};
    use crate::retry::RetryPolicy;
    use kestrel_core::Passcode;
    use kestrel_host::MemoryHost;
    use serde_json::json;
    use std::sync::Arc;

    fn config() -> AgentConfig {
        AgentConfig {
            retry: RetryPolicy::new(3, Duration::from_millis(10)),
            notifications: NotificationPolling {
                attempts: 3,
                interval: Duration::from_millis(10),
            },
            ..AgentConfig::default()
        }
    }

    async fn party(host: &Arc<MemoryHost>, alias: &str) -> Session {
        let session = Session::connect(host.clone(), &Passcode::generate(), config())
            .await
            .unwrap();
        create_identifier(&session, alias).await.unwrap();
        session
    }

    async fn invoice(host: &Arc<MemoryHost>, sender: &Session) -> Credential {
        let (said, document) = saidify_schema(json!({
            "title": "Invoice",
            "properties": {
                "a": {
                    "properties": {
                        "invoiceNumber": {"type": "string"},
                        "amount": {"type": "number"},
                        "currency": {"type": "string"}
                    },
                    "required": ["invoiceNumber", "amount", "currency"]
                }
            }
        }))
        .unwrap();
        host.network().publish_schema(document).unwrap();
        create_registry(sender, "seller", "invoices").await.unwrap();
        let fields = json!({"invoiceNumber": "INV-1", "amount": 500, "currency": "USD"});
        issue_self_attested(sender, "seller", &said, fields.as_object().cloned().unwrap())
            .await
            .unwrap()
    }

    async fn prefix(session: &Session, alias: &str) -> String {
        session
            .host()
            .identifier(session.controller(), alias)
            .await
            .unwrap()
            .prefix
    }

    #[tokio::test(start_paused = true)]
    async fn test_introduced_receiver_admits() {
        let host = Arc::new(MemoryHost::default());
        let seller = party(&host, "seller").await;
        let buyer = party(&host, "buyer").await;
        let credential = invoice(&host, &seller).await;

        let seller_prefix = prefix(&seller, "seller").await;
        resolve_introduction(&buyer, &buyer.oobi_url(&seller_prefix), "seller", None)
            .await
            .unwrap();

        let report = exchange_credential(&seller, "seller", &credential, &buyer, "buyer")
            .await
            .unwrap();
        assert_eq!(report.state, ExchangeState::Admitted);
        assert_eq!(report.grant.credential, credential.said);
        assert!(report.require_admitted().is_ok());

        let notes = buyer.host().notifications(buyer.controller()).await.unwrap();
        assert!(notes.iter().all(|n| n.read));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unintroduced_receiver_is_unconfirmed() {
        let host = Arc::new(MemoryHost::default());
        let seller = party(&host, "seller").await;
        let buyer = party(&host, "buyer").await;
        let credential = invoice(&host, &seller).await;

        let report = exchange_credential(&seller, "seller", &credential, &buyer, "buyer")
            .await
            .unwrap();
        assert_eq!(report.state, ExchangeState::Unconfirmed);
        assert!(report.admit.is_none());
        assert!(report.reason.as_deref().unwrap().contains("no notification"));

        let err = report.require_admitted().unwrap_err();
        assert_eq!(err.retryability(), Retryability::Terminal);

        // The grant stays verifiable by either party.
        let granted = verify_grant(&seller, &report.grant).await.unwrap();
        assert_eq!(granted, credential);

        let admit = admit_recorded_grant(&buyer, "buyer", &report.grant)
            .await
            .unwrap();
        assert!(!admit.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_mailbox_is_unconfirmed() {
        let host = Arc::new(MemoryHost::default());
        let seller = party(&host, "seller").await;
        let buyer = party(&host, "buyer").await;
        let credential = invoice(&host, &seller).await;
        let seller_prefix = prefix(&seller, "seller").await;
        resolve_introduction(&buyer, &buyer.oobi_url(&seller_prefix), "seller", None)
            .await
            .unwrap();
        host.network().set_mailbox_enabled(false);

        let report = exchange_credential(&seller, "seller", &credential, &buyer, "buyer")
            .await
            .unwrap();
        assert_eq!(report.state, ExchangeState::Unconfirmed);
    }

    #[tokio::test]
    async fn test_grant_of_foreign_credential_rejected() {
        let host = Arc::new(MemoryHost::default());
        let seller = party(&host, "seller").await;
        let other = party(&host, "other").await;
        let buyer = party(&host, "buyer").await;
        let credential = invoice(&host, &seller).await;

        let buyer_prefix = prefix(&buyer, "buyer").await;
        let counterparty = Counterparty {
            oobi: other.oobi_url(&buyer_prefix),
            prefix: buyer_prefix,
        };
        let err = send_grant(&other, "other", &credential, &counterparty, "")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidArgument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_record_rejected() {
        let host = Arc::new(MemoryHost::default());
        let seller = party(&host, "seller").await;
        let buyer = party(&host, "buyer").await;
        let credential = invoice(&host, &seller).await;

        let report = exchange_credential(&seller, "seller", &credential, &buyer, "buyer")
            .await
            .unwrap();
        let mut record = report.grant.clone();
        record.credential = "Inotthecredential".into();
        assert!(matches!(
            verify_grant(&seller, &record).await,
            Err(AgentError::InvalidArgument(_))
        ));
    }
}
