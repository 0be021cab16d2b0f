//! Records and request bodies exchanged with a hosting service.

use kestrel_core::event::SignedEvent;
use kestrel_core::kel::KeyState;
use kestrel_core::event::Seal;
use kestrel_core::{Credential, keys, said};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// Operation error code for a key event log that fails verification.
pub const INVALID_KEL: u16 = 422;

/// Failure reported by a finished operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub code: u16,
    pub message: String,
}

/// Handle to a long-running job on the hosting service.
///
/// A result is only meaningful once `done` is true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl Operation {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            done: false,
            error: None,
            response: None,
        }
    }

    pub fn completed(name: impl Into<String>, response: Value) -> Self {
        Self {
            name: name.into(),
            done: true,
            error: None,
            response: Some(response),
        }
    }

    pub fn failed(name: impl Into<String>, code: u16, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            done: true,
            error: Some(OperationError {
                code,
                message: message.into(),
            }),
            response: None,
        }
    }
}

/// Proof that the caller holds the controller key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerBootstrap {
    /// Controller public key prefix.
    pub controller: String,
    /// Controller's signature over its own prefix.
    pub signature: String,
}

impl ControllerBootstrap {
    pub fn new(signer: &keys::Signer) -> Self {
        let controller = signer.public_key();
        let signature = keys::encode_signature(&signer.sign(controller.as_bytes()));
        Self {
            controller,
            signature,
        }
    }

    pub fn verify(&self) -> kestrel_core::Result<()> {
        keys::verify(&self.controller, self.controller.as_bytes(), &self.signature)
    }
}

/// Result of connecting a controller to its agent on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub controller: String,
    /// Prefix of the host-side agent serving this controller.
    pub agent: String,
}

/// An identifier managed by the caller's agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierRecord {
    pub name: String,
    pub prefix: String,
    pub state: KeyState,
}

/// A credential registry owned by one issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub name: String,
    /// Registry identifier (SAID of the registry inception).
    pub regk: String,
    pub issuer: String,
    pub nonce: String,
}

impl RegistryRecord {
    /// Incept a new registry for `issuer` with a fresh nonce.
    pub fn incept(name: &str, issuer: &str) -> kestrel_core::Result<Self> {
        let nonce = Uuid::now_v7().simple().to_string();
        let regk = registry_said(issuer, &nonce)?;
        Ok(Self {
            name: name.to_string(),
            regk,
            issuer: issuer.to_string(),
            nonce,
        })
    }

    /// Check that `regk` is the SAID of this registry's inception.
    pub fn verify(&self) -> kestrel_core::Result<()> {
        let computed = registry_said(&self.issuer, &self.nonce)?;
        if computed != self.regk {
            return Err(kestrel_core::Error::SaidMismatch {
                expected: self.regk.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// Seal the issuer anchors in its KEL to establish this registry.
    pub fn seal(&self) -> Seal {
        Seal {
            prefix: self.regk.clone(),
            sn: 0,
            said: self.regk.clone(),
        }
    }
}

fn registry_said(issuer: &str, nonce: &str) -> kestrel_core::Result<String> {
    said::compute(
        &json!({"v": "KERI10JSON", "t": "vcp", "d": "", "ii": issuer, "n": nonce}),
        &["d"],
    )
}

/// Seal the issuer anchors in its KEL when issuing `credential`.
pub fn credential_seal(credential: &Credential) -> Seal {
    Seal {
        prefix: credential.said.clone(),
        sn: 0,
        said: credential.said.clone(),
    }
}

/// A message delivered to the caller's notification queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub timestamp: String,
    pub read: bool,
    pub route: String,
    /// SAID of the exchange message.
    pub exchange: String,
    pub sender: String,
    pub recipient: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OobiRequest {
    pub url: String,
    pub alias: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InceptRequest {
    pub alias: String,
    pub event: SignedEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryRequest {
    pub registry: RegistryRecord,
    pub anchor: SignedEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRequest {
    pub credential: Credential,
    pub anchor: SignedEvent,
}

/// Wire form of a failed HTTP call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Build the OOBI URL of `prefix` under `base`.
pub fn oobi_url(base: &str, prefix: &str) -> String {
    format!("{}/oobi/{}", base.trim_end_matches('/'), prefix)
}

/// Extract the identifier prefix an OOBI URL introduces.
pub fn oobi_prefix(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("/oobi/")?;
    let candidate = rest.split('/').next()?;
    candidate
        .parse::<kestrel_core::Prefix>()
        .ok()
        .map(|p| p.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::Signer;

    #[test]
    fn test_oobi_url_roundtrip() {
        let prefix = kestrel_core::signing::digest(b"agent").to_string();
        let url = oobi_url("http://127.0.0.1:3902/", &prefix);
        assert_eq!(url, format!("http://127.0.0.1:3902/oobi/{prefix}"));
        assert_eq!(oobi_prefix(&url), Some(prefix.clone()));
        assert_eq!(oobi_prefix(&format!("{url}/witness/Babc")), Some(prefix));
    }

    #[test]
    fn test_oobi_prefix_rejects_garbage() {
        assert_eq!(oobi_prefix("http://host/oobi/not-a-prefix"), None);
        assert_eq!(oobi_prefix("http://host/other"), None);
    }

    #[test]
    fn test_registry_said_binds_issuer() {
        let issuer = kestrel_core::signing::digest(b"issuer").to_string();
        let registry = RegistryRecord::incept("invoices", &issuer).unwrap();
        registry.verify().unwrap();
        assert_eq!(registry.seal().prefix, registry.regk);

        let mut stolen = registry.clone();
        stolen.issuer = kestrel_core::signing::digest(b"thief").to_string();
        assert!(stolen.verify().is_err());
    }

    #[test]
    fn test_bootstrap_verifies() {
        let signer = Signer::generate();
        let bootstrap = ControllerBootstrap::new(&signer);
        bootstrap.verify().unwrap();

        let forged = ControllerBootstrap {
            controller: Signer::generate().public_key(),
            signature: bootstrap.signature.clone(),
        };
        assert!(forged.verify().is_err());
    }
}
