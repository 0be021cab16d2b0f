//! Credential registries and self-attested issuance.

use crate::identifiers::anchor_event;
use crate::operation::{response, wait_for_operation};
use crate::retry::with_retry;
use crate::session::Session;
use crate::{AgentError, Result};
use chrono::Utc;
use kestrel_core::credential::RESERVED_ATTRIBUTES;
use kestrel_core::{Credential, Schema};
use kestrel_host::{HostError, RegistryRecord, credential_seal};
use serde_json::{Map, Value};
use tracing::info;

pub use kestrel_core::said::saidify_schema;

/// Create registry `name` for `issuer_alias`, or return it if it already exists.
pub async fn create_registry(
    session: &Session,
    issuer_alias: &str,
    name: &str,
) -> Result<RegistryRecord> {
    with_retry("create_registry", &session.config().retry, |_| async move {
        create_once(session, issuer_alias, name).await
    })
    .await
}

async fn create_once(session: &Session, alias: &str, name: &str) -> Result<RegistryRecord> {
    let host = session.host();
    let controller = session.controller();
    let _guard = session.lock_identifier(alias).await;

    if let Some(existing) = host
        .registries(controller, alias)
        .await?
        .into_iter()
        .find(|r| r.name == name)
    {
        info!(alias, registry = name, regk = %existing.regk, "Registry already exists");
        return Ok(existing);
    }

    let issuer = host.identifier(controller, alias).await?;
    let registry = RegistryRecord::incept(name, &issuer.prefix)?;
    let anchor = anchor_event(session, alias, vec![registry.seal()]).await?;

    let operation = match host
        .create_registry(controller, alias, registry, anchor)
        .await
    {
        Ok(operation) => operation,
        Err(HostError::Rejected {
            status: 409,
            message,
        }) => {
            return Err(AgentError::RegistryConflict {
                name: name.to_string(),
                detail: message,
            });
        }
        Err(err) => return Err(err.into()),
    };
    let operation =
        wait_for_operation(session, operation, session.environment().operation_timeout).await?;
    let record: RegistryRecord = response(&operation)?;
    info!(alias, registry = name, regk = %record.regk, "Registry created");
    Ok(record)
}

/// Resolve a schema by SAID, retrying while it has not propagated.
pub async fn resolve_schema(session: &Session, schema_said: &str) -> Result<Schema> {
    let document = with_retry("resolve_schema", &session.config().retry, |_| async move {
        Ok(session
            .host()
            .schema(session.controller(), schema_said)
            .await?)
    })
    .await?;

    let schema = Schema::from_document(document)?;
    if schema.said != schema_said {
        return Err(AgentError::SchemaMismatch(format!(
            "requested schema {schema_said}, host returned {}",
            schema.said
        )));
    }
    Ok(schema)
}

/// Issue a self-attested credential into the issuer's first registry.
pub async fn issue_self_attested(
    session: &Session,
    issuer_alias: &str,
    schema_said: &str,
    attributes: Map<String, Value>,
) -> Result<Credential> {
    check_attributes(&attributes)?;
    let registry = session
        .host()
        .registries(session.controller(), issuer_alias)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| {
            AgentError::InvalidArgument(format!(
                "{issuer_alias} has no credential registry; create one first"
            ))
        })?;
    issue(session, issuer_alias, &registry, schema_said, attributes).await
}

/// Issue a self-attested credential into the registry called `registry_name`.
pub async fn issue_into(
    session: &Session,
    issuer_alias: &str,
    registry_name: &str,
    schema_said: &str,
    attributes: Map<String, Value>,
) -> Result<Credential> {
    check_attributes(&attributes)?;
    let registry = session
        .host()
        .registries(session.controller(), issuer_alias)
        .await?
        .into_iter()
        .find(|r| r.name == registry_name)
        .ok_or_else(|| {
            AgentError::InvalidArgument(format!(
                "{issuer_alias} has no registry named {registry_name}"
            ))
        })?;
    issue(session, issuer_alias, &registry, schema_said, attributes).await
}

/// Reject attributes the issuer fills in, before any network call.
fn check_attributes(attributes: &Map<String, Value>) -> Result<()> {
    if let Some(issuee) = attributes.get("i") {
        return Err(AgentError::InvalidArgument(format!(
            "self-attested credentials are issued to their issuer; drop issuee {issuee}"
        )));
    }
    if let Some(key) = RESERVED_ATTRIBUTES.iter().find(|k| attributes.contains_key(**k)) {
        return Err(AgentError::InvalidArgument(format!(
            "attribute {key:?} is set by the issuer"
        )));
    }
    Ok(())
}

// Not retried: a second submission would issue a second, distinct credential.
async fn issue(
    session: &Session,
    alias: &str,
    registry: &RegistryRecord,
    schema_said: &str,
    attributes: Map<String, Value>,
) -> Result<Credential> {
    let schema = resolve_schema(session, schema_said).await?;
    schema.validate(&attributes)?;

    let _guard = session.lock_identifier(alias).await;
    let issuer = session
        .host()
        .identifier(session.controller(), alias)
        .await?;
    let credential = Credential::self_attested(
        &issuer.prefix,
        &issuer.prefix,
        &registry.regk,
        &schema,
        attributes,
        Utc::now(),
    )?;
    let anchor = anchor_event(session, alias, vec![credential_seal(&credential)]).await?;

    let operation = session
        .host()
        .issue_credential(session.controller(), alias, credential.clone(), anchor)
        .await?;
    wait_for_operation(session, operation, session.environment().operation_timeout).await?;

    info!(
        alias,
        said = %credential.said,
        schema = schema_said,
        registry = %registry.name,
        "Credential issued"
    );
    Ok(credential)
}
