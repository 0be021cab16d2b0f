//! Grant/Admit exchange messages.
//!
//! A Grant offers a credential to a recipient; an Admit accepts a specific
//! Grant by referencing its SAID in `p`.

use crate::credential::Credential;
use crate::event::{IndexedSignature, verified_indices};
use crate::kel::KeyState;
use crate::keys::{self, Signer};
use crate::{Error, Result, said, signing};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Version string carried by exchange messages.
pub const EXN_VERSION: &str = "KERI10JSON";

/// Message type tag.
pub const EXN_TYPE: &str = "exn";

/// Exchange route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    #[serde(rename = "/ipex/grant")]
    Grant,
    #[serde(rename = "/ipex/admit")]
    Admit,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Route::Grant => "/ipex/grant",
            Route::Admit => "/ipex/admit",
        }
    }
}

/// Attributes of an exchange message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeAttributes {
    /// Free-form human message.
    #[serde(rename = "m", default)]
    pub message: String,
    /// Recipient prefix.
    #[serde(rename = "i")]
    pub recipient: String,
}

/// Embedded payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Embeds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acdc: Option<Credential>,
}

/// An exchange (`exn`) message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeMessage {
    #[serde(rename = "v")]
    pub version: String,
    #[serde(rename = "t")]
    pub type_: String,
    #[serde(rename = "d")]
    pub said: String,
    /// Sender prefix.
    #[serde(rename = "i")]
    pub sender: String,
    /// Recipient prefix.
    #[serde(rename = "rp")]
    pub recipient: String,
    /// SAID of the message this one responds to (empty for a Grant).
    #[serde(rename = "p", default)]
    pub prior: String,
    #[serde(rename = "dt")]
    pub timestamp: String,
    #[serde(rename = "r")]
    pub route: Route,
    #[serde(rename = "a")]
    pub attributes: ExchangeAttributes,
    #[serde(rename = "e", default)]
    pub embeds: Embeds,
}

impl ExchangeMessage {
    /// Offer `credential` to `recipient`.
    pub fn grant(
        sender: &str,
        recipient: &str,
        credential: Credential,
        message: &str,
    ) -> Result<Self> {
        Self::new(
            Route::Grant,
            sender,
            recipient,
            String::new(),
            message,
            Embeds {
                acdc: Some(credential),
            },
        )
    }

    /// Accept `grant` on behalf of `sender` (the grant's recipient).
    pub fn admit(sender: &str, grant: &ExchangeMessage, message: &str) -> Result<Self> {
        if grant.route != Route::Grant {
            return Err(Error::InvalidEvent(format!(
                "admit must reference a grant, got {}",
                grant.route.as_str()
            )));
        }
        Self::new(
            Route::Admit,
            sender,
            &grant.sender,
            grant.said.clone(),
            message,
            Embeds::default(),
        )
    }

    fn new(
        route: Route,
        sender: &str,
        recipient: &str,
        prior: String,
        message: &str,
        embeds: Embeds,
    ) -> Result<Self> {
        let exn = Self {
            version: EXN_VERSION.to_string(),
            type_: EXN_TYPE.to_string(),
            said: String::new(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            prior,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            route,
            attributes: ExchangeAttributes {
                message: message.to_string(),
                recipient: recipient.to_string(),
            },
            embeds,
        };
        let (_, value) = said::saidify(serde_json::to_value(exn)?, &["d"])?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn verify_said(&self) -> Result<()> {
        said::verify(&serde_json::to_value(self)?, "d", &[])
    }

    /// The embedded credential, if this is a Grant carrying one.
    pub fn credential(&self) -> Option<&Credential> {
        self.embeds.acdc.as_ref()
    }
}

/// An exchange message signed by its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedExchange {
    pub exn: ExchangeMessage,
    pub signatures: Vec<IndexedSignature>,
}

impl SignedExchange {
    pub fn sign(exn: ExchangeMessage, signers: &[&Signer]) -> Result<Self> {
        let bytes = signing::canonicalize(&exn)?;
        let signatures = signers
            .iter()
            .enumerate()
            .map(|(index, signer)| IndexedSignature {
                index: index as u32,
                signature: keys::encode_signature(&signer.sign(&bytes)),
            })
            .collect();
        Ok(Self { exn, signatures })
    }

    /// Verify the SAID and the sender's signatures against its key state.
    pub fn verify(&self, sender_state: &KeyState) -> Result<()> {
        if sender_state.prefix != self.exn.sender {
            return Err(Error::InvalidEvent(format!(
                "key state for {} cannot verify a message from {}",
                sender_state.prefix, self.exn.sender
            )));
        }
        self.exn.verify_said()?;

        let bytes = signing::canonicalize(&self.exn)?;
        let verified = verified_indices(&self.signatures, &sender_state.keys, &bytes)
            .ok_or(Error::InvalidSignature)?;
        if verified < sender_state.threshold.max(1) {
            return Err(Error::InvalidSignature);
        }
        Ok(())
    }
}
