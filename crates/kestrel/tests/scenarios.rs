//! End-to-end scenarios against in-memory hosting services.

use kestrel::agent::{
    KeyStateQuery, NotificationPolling, RegistrationPolling, RetryPolicy, Retryability,
    Unavailability, approve_delegation, await_delegation, request_delegated_identifier,
    verify_identifier_registered,
};
use kestrel::host::IdentifierRecord;
use kestrel::{
    AgentConfig, AgentError, Credential, DelegationStatus, ExchangeState, GrantRecord, MemoryHost,
    Network, Passcode, Session, create_identifier, create_registry, exchange_credential,
    issue_self_attested, query_key_state, resolve_introduction, saidify_schema, verify_delegation,
    verify_grant,
};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;

fn config() -> AgentConfig {
    AgentConfig {
        retry: RetryPolicy::new(3, Duration::from_millis(20)),
        key_state: KeyStateQuery {
            max_retries: 3,
            delay: Duration::from_millis(20),
            attempt_timeout: Duration::from_secs(1),
        },
        notifications: NotificationPolling {
            attempts: 3,
            interval: Duration::from_millis(20),
        },
        ..AgentConfig::default()
    }
}

async fn connect(host: &Arc<MemoryHost>) -> Session {
    Session::connect(host.clone(), &Passcode::generate(), config())
        .await
        .unwrap()
}

struct Delegation {
    host: Arc<MemoryHost>,
    delegator: IdentifierRecord,
    delegate: IdentifierRecord,
    verifier: Session,
}

/// A delegator approves a delegate; a third party will verify.
async fn delegation() -> Delegation {
    let host = Arc::new(MemoryHost::default());
    let root = connect(&host).await;
    let child = connect(&host).await;
    let verifier = connect(&host).await;

    let delegator = create_identifier(&root, "treasury").await.unwrap();
    let request = request_delegated_identifier(&child, "trader", &delegator.prefix)
        .await
        .unwrap();
    approve_delegation(&root, "treasury", &request).await.unwrap();
    let delegate = await_delegation(&child, &request, Duration::from_secs(5))
        .await
        .unwrap();
    verify_identifier_registered(
        &child,
        "trader",
        &request.prefix,
        &RegistrationPolling::default(),
    )
    .await
    .unwrap();

    Delegation {
        host,
        delegator,
        delegate,
        verifier,
    }
}

fn invoice_schema() -> Value {
    json!({
        "$id": "",
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "Invoice",
        "type": "object",
        "properties": {
            "v": {"type": "string"},
            "d": {"type": "string"},
            "i": {"type": "string"},
            "s": {"type": "string"},
            "a": {
                "oneOf": [
                    {"type": "string"},
                    {
                        "$id": "",
                        "type": "object",
                        "properties": {
                            "d": {"type": "string"},
                            "i": {"type": "string"},
                            "dt": {"type": "string", "format": "date-time"},
                            "invoiceNumber": {"type": "string"},
                            "amount": {"type": "number"},
                            "currency": {"type": "string"}
                        },
                        "required": ["d", "i", "dt", "invoiceNumber", "amount", "currency"]
                    }
                ]
            }
        }
    })
}

fn invoice() -> Map<String, Value> {
    json!({"invoiceNumber": "INV-1", "amount": 500, "currency": "USD"})
        .as_object()
        .cloned()
        .unwrap()
}

/// Seller and buyer on separate hosts sharing one network.
async fn trading_pair() -> (Arc<MemoryHost>, Session, Session, Credential) {
    let network = Network::default();
    let seller_host = Arc::new(MemoryHost::new(network.clone()));
    let buyer_host = Arc::new(MemoryHost::new(network.clone()));

    let seller = connect(&seller_host).await;
    let buyer = connect(&buyer_host).await;
    assert!(!seller.same_party(&buyer));
    create_identifier(&seller, "seller").await.unwrap();
    create_identifier(&buyer, "buyer").await.unwrap();

    let (schema, document) = saidify_schema(invoice_schema()).unwrap();
    network.publish_schema(document).unwrap();
    create_registry(&seller, "seller", "invoices").await.unwrap();
    let credential = issue_self_attested(&seller, "seller", &schema, invoice())
        .await
        .unwrap();

    (seller_host, seller, buyer, credential)
}

#[tokio::test]
async fn test_scenario_a_anchored_delegation_verifies() {
    let setup = delegation().await;

    let report = verify_delegation(
        &setup.verifier,
        &setup.delegate.prefix,
        &setup.delegator.prefix,
        &KeyStateQuery::default(),
    )
    .await
    .unwrap();

    assert!(report.is_verified());
    match report.status {
        DelegationStatus::Verified { anchor_sn, .. } => assert_eq!(anchor_sn, 1),
        other => panic!("expected verified, got {other:?}"),
    }
    assert_eq!(setup.delegate.state.delegator.as_deref(), Some(setup.delegator.prefix.as_str()));
}

#[tokio::test]
async fn test_mutated_delegator_field_is_rejected() {
    let setup = delegation().await;
    let impostor = create_identifier(&connect(&setup.host).await, "impostor")
        .await
        .unwrap();

    let tampered = setup
        .host
        .network()
        .tamper_event(&setup.delegate.prefix, 0, |event| {
            event.delegator = Some(impostor.prefix.clone());
        });
    assert!(tampered);

    let err = verify_delegation(
        &setup.verifier,
        &setup.delegate.prefix,
        &setup.delegator.prefix,
        &KeyStateQuery::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AgentError::DelegationRejected { .. }), "{err}");
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_wrong_delegator_is_rejected() {
    let setup = delegation().await;
    let stranger = create_identifier(&connect(&setup.host).await, "stranger")
        .await
        .unwrap();

    let err = verify_delegation(
        &setup.verifier,
        &setup.delegate.prefix,
        &stranger.prefix,
        &KeyStateQuery::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AgentError::DelegationRejected { .. }), "{err}");
    assert_eq!(err.retryability(), Retryability::Fatal);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_b_independent_receiver_ends_unconfirmed() {
    let (_, seller, buyer, credential) = trading_pair().await;

    let report = exchange_credential(&seller, "seller", &credential, &buyer, "buyer")
        .await
        .unwrap();

    assert_eq!(report.state, ExchangeState::Unconfirmed);
    assert!(report.admit.is_none());
    assert_eq!(report.grant.credential, credential.said);

    // The recorded grant survives a round trip through task data and still verifies.
    let stored = serde_json::to_string(&report.grant).unwrap();
    let record: GrantRecord = serde_json::from_str(&stored).unwrap();
    let granted = verify_grant(&seller, &record).await.unwrap();
    assert_eq!(granted.attributes.fields["invoiceNumber"], json!("INV-1"));
    assert_eq!(granted.attributes.fields["amount"], json!(500));
    assert_eq!(granted.attributes.fields["currency"], json!("USD"));
    assert_eq!(granted.issuer, granted.attributes.issuee);
}

#[tokio::test(start_paused = true)]
async fn test_introduced_receiver_admits_grant() {
    let (_, seller, buyer, credential) = trading_pair().await;
    let seller_prefix = credential.issuer.clone();
    resolve_introduction(&buyer, &buyer.oobi_url(&seller_prefix), "seller", Some(&seller_prefix))
        .await
        .unwrap();

    let report = exchange_credential(&seller, "seller", &credential, &buyer, "buyer")
        .await
        .unwrap();
    assert_eq!(report.state, ExchangeState::Admitted);
    assert!(report.require_admitted().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_scenario_c_unreachable_host_exhausts_key_state_query() {
    let host = Arc::new(MemoryHost::default());
    let session = connect(&host).await;
    let target = create_identifier(&session, "trader").await.unwrap();
    host.set_reachable(false);

    let query = KeyStateQuery {
        max_retries: 5,
        delay: Duration::from_millis(100),
        attempt_timeout: Duration::from_secs(60),
    };
    let err = query_key_state(&session, &target.prefix, &query)
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

#[tokio::test]
async fn test_issuee_mismatch_rejected_before_network() {
    let host = Arc::new(MemoryHost::default());
    let session = connect(&host).await;
    create_identifier(&session, "seller").await.unwrap();
    let calls = host.call_count();

    let mut attributes = invoice();
    attributes.insert("i".into(), json!("IsomeoneElseXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX"));
    let err = issue_self_attested(&session, "seller", "Ischema", attributes)
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::InvalidArgument(_)));
    assert_eq!(host.call_count(), calls);
}

#[test]
fn test_saidify_schema_ignores_prior_ids() {
    let (first, document) = saidify_schema(invoice_schema()).unwrap();

    let mut stale = invoice_schema();
    stale["$id"] = json!("Eold");
    stale["properties"]["a"]["oneOf"][1]["$id"] = json!("Estale");
    let (second, _) = saidify_schema(stale).unwrap();
    assert_eq!(first, second);

    let (again, _) = saidify_schema(document).unwrap();
    assert_eq!(first, again);
}
