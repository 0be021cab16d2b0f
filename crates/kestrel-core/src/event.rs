//! Key events and their signatures.
//!
//! Field names follow the compact KERI layout (`v`, `t`, `d`, `i`, `s`, ...).
//! Inception events are self-addressing: the identifier prefix `i` is the
//! SAID `d` of the inception event itself.

use crate::keys::{self, Signer};
use crate::{Error, Result, said, signing};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Version string carried by every key event.
pub const KERI_VERSION: &str = "KERI10JSON";

/// Event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ilk {
    /// Inception.
    Icp,
    /// Delegated inception.
    Dip,
    /// Interaction (anchors seals, keys unchanged).
    Ixn,
    /// Rotation.
    Rot,
}

/// A seal anchoring another identifier's event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seal {
    /// Prefix of the anchored identifier.
    #[serde(rename = "i")]
    pub prefix: String,
    /// Sequence number of the anchored event.
    #[serde(rename = "s", with = "hex_sn")]
    pub sn: u64,
    /// Digest of the anchored event.
    #[serde(rename = "d")]
    pub said: String,
}

/// A key event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    #[serde(rename = "v")]
    pub version: String,

    #[serde(rename = "t")]
    pub ilk: Ilk,

    /// SAID of this event.
    #[serde(rename = "d")]
    pub said: String,

    /// Identifier prefix.
    #[serde(rename = "i")]
    pub prefix: String,

    #[serde(rename = "s", with = "hex_sn")]
    pub sn: u64,

    /// SAID of the prior event (absent on inception).
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub prior: Option<String>,

    /// Signing threshold (establishment events only).
    #[serde(rename = "kt", default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u32>,

    /// Current signing keys (establishment events only).
    #[serde(rename = "k", default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,

    #[serde(rename = "nt", default, skip_serializing_if = "Option::is_none")]
    pub next_threshold: Option<u32>,

    /// Digests of the pre-rotated next keys.
    #[serde(rename = "n", default, skip_serializing_if = "Vec::is_empty")]
    pub next_digests: Vec<String>,

    /// Anchored seals.
    #[serde(rename = "a", default)]
    pub anchors: Vec<Seal>,

    /// Delegator prefix (delegated inception only).
    #[serde(rename = "di", default, skip_serializing_if = "Option::is_none")]
    pub delegator: Option<String>,
}

impl KeyEvent {
    /// Create a self-addressing inception event.
    pub fn inception(current: &[&Signer], next: &[&Signer]) -> Result<Self> {
        Self::establish(Ilk::Icp, current, next, None)
    }

    /// Create a delegated inception event naming its delegator.
    pub fn delegated_inception(
        current: &[&Signer],
        next: &[&Signer],
        delegator: &str,
    ) -> Result<Self> {
        Self::establish(Ilk::Dip, current, next, Some(delegator.to_string()))
    }

    fn establish(
        ilk: Ilk,
        current: &[&Signer],
        next: &[&Signer],
        delegator: Option<String>,
    ) -> Result<Self> {
        if current.is_empty() {
            return Err(Error::InvalidEvent("inception requires signing keys".into()));
        }

        let event = Self {
            version: KERI_VERSION.to_string(),
            ilk,
            said: String::new(),
            prefix: String::new(),
            sn: 0,
            prior: None,
            threshold: Some(majority(current.len())),
            keys: current.iter().map(|s| s.public_key()).collect(),
            next_threshold: Some(majority(next.len())),
            next_digests: next.iter().map(|s| s.public_key_digest()).collect(),
            anchors: Vec::new(),
            delegator,
        };
        event.saidify()
    }

    /// Create an interaction event following `prior`.
    pub fn interaction(prior: &KeyEvent, anchors: Vec<Seal>) -> Result<Self> {
        let event = Self {
            version: KERI_VERSION.to_string(),
            ilk: Ilk::Ixn,
            said: String::new(),
            prefix: prior.prefix.clone(),
            sn: prior.sn + 1,
            prior: Some(prior.said.clone()),
            threshold: None,
            keys: Vec::new(),
            next_threshold: None,
            next_digests: Vec::new(),
            anchors,
            delegator: None,
        };
        event.saidify()
    }

    /// Create a rotation event revealing the keys committed to by `prior`.
    pub fn rotation(prior: &KeyEvent, current: &[&Signer], next: &[&Signer]) -> Result<Self> {
        let event = Self {
            version: KERI_VERSION.to_string(),
            ilk: Ilk::Rot,
            said: String::new(),
            prefix: prior.prefix.clone(),
            sn: prior.sn + 1,
            prior: Some(prior.said.clone()),
            threshold: Some(majority(current.len())),
            keys: current.iter().map(|s| s.public_key()).collect(),
            next_threshold: Some(majority(next.len())),
            next_digests: next.iter().map(|s| s.public_key_digest()).collect(),
            anchors: Vec::new(),
            delegator: None,
        };
        event.saidify()
    }

    fn said_fields(&self) -> &'static [&'static str] {
        if self.is_inception() {
            &["d", "i"]
        } else {
            &["d"]
        }
    }

    fn saidify(mut self) -> Result<Self> {
        let value = serde_json::to_value(&self)?;
        let said = said::compute(&value, self.said_fields())?;
        if self.is_inception() {
            self.prefix = said.clone();
        }
        self.said = said;
        Ok(self)
    }

    /// Check the event's SAID (and, for inception, its self-addressing prefix).
    pub fn verify_said(&self) -> Result<()> {
        let value = serde_json::to_value(self)?;
        if self.is_inception() {
            if self.prefix != self.said {
                return Err(Error::InvalidEvent(format!(
                    "inception prefix {} is not its SAID {}",
                    self.prefix, self.said
                )));
            }
            said::verify(&value, "d", &["i"])
        } else {
            said::verify(&value, "d", &[])
        }
    }

    pub fn is_inception(&self) -> bool {
        matches!(self.ilk, Ilk::Icp | Ilk::Dip)
    }

    pub fn is_delegated_inception(&self) -> bool {
        self.ilk == Ilk::Dip
    }

    pub fn is_establishment(&self) -> bool {
        matches!(self.ilk, Ilk::Icp | Ilk::Dip | Ilk::Rot)
    }

    pub fn is_interaction(&self) -> bool {
        self.ilk == Ilk::Ixn
    }

    /// A seal referencing this event.
    pub fn seal(&self) -> Seal {
        Seal {
            prefix: self.prefix.clone(),
            sn: self.sn,
            said: self.said.clone(),
        }
    }

    /// Bytes covered by signatures.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        signing::canonicalize(self)
    }
}

/// A signature tagged with the index of the signing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedSignature {
    pub index: u32,
    pub signature: String,
}

/// Location of the delegator's event that approved a delegated event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSeal {
    #[serde(rename = "s", with = "hex_sn")]
    pub sn: u64,
    #[serde(rename = "d")]
    pub said: String,
}

/// A key event with its attached signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedEvent {
    pub event: KeyEvent,
    pub signatures: Vec<IndexedSignature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_seal: Option<SourceSeal>,
}

impl SignedEvent {
    /// Sign an event; `signers[n]` signs as key index `n`.
    pub fn sign(event: KeyEvent, signers: &[&Signer]) -> Result<Self> {
        let bytes = event.signing_bytes()?;
        let signatures = signers
            .iter()
            .enumerate()
            .map(|(index, signer)| IndexedSignature {
                index: index as u32,
                signature: keys::encode_signature(&signer.sign(&bytes)),
            })
            .collect();

        Ok(Self {
            event,
            signatures,
            source_seal: None,
        })
    }

    /// Verify signatures against `keys` and require at least `threshold` of them.
    ///
    /// Any signature that fails to verify is an error, even if the threshold
    /// would be met without it.
    pub fn verify_signatures(&self, keys: &[String], threshold: u32) -> Result<()> {
        let bytes = self.event.signing_bytes()?;
        let mismatch = || Error::SignatureMismatch {
            prefix: self.event.prefix.clone(),
            sn: self.event.sn,
        };

        let verified = verified_indices(&self.signatures, keys, &bytes).ok_or_else(mismatch)?;
        if verified < threshold.max(1) {
            return Err(mismatch());
        }
        Ok(())
    }
}

/// Number of distinct key indices whose signatures verify over `bytes`.
///
/// `None` if an index is out of range or repeated, or if a signature fails.
pub(crate) fn verified_indices(
    signatures: &[IndexedSignature],
    public_keys: &[String],
    bytes: &[u8],
) -> Option<u32> {
    let mut seen = HashSet::new();
    for sig in signatures {
        let key = public_keys.get(sig.index as usize)?;
        if !seen.insert(sig.index) {
            return None;
        }
        keys::verify(key, bytes, &sig.signature).ok()?;
    }
    Some(seen.len() as u32)
}

/// Simple majority threshold for `n` keys.
fn majority(n: usize) -> u32 {
    (n as u32 / 2) + 1
}

/// Serialize sequence numbers as lowercase hex strings.
mod hex_sn {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(sn: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{sn:x}"))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        u64::from_str_radix(&s, 16).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inception_is_self_addressing() {
        let (current, next) = (Signer::generate(), Signer::generate());
        let icp = KeyEvent::inception(&[&current], &[&next]).unwrap();

        assert_eq!(icp.prefix, icp.said);
        assert_eq!(icp.sn, 0);
        assert_eq!(icp.threshold, Some(1));
        assert_eq!(icp.next_digests, vec![next.public_key_digest()]);
        icp.verify_said().unwrap();
    }

    #[test]
    fn test_delegated_inception_names_delegator() {
        let delegator = KeyEvent::inception(&[&Signer::generate()], &[&Signer::generate()]).unwrap();
        let dip = KeyEvent::delegated_inception(
            &[&Signer::generate()],
            &[&Signer::generate()],
            &delegator.prefix,
        )
        .unwrap();

        assert!(dip.is_delegated_inception());
        assert_eq!(dip.delegator.as_deref(), Some(delegator.prefix.as_str()));
        dip.verify_said().unwrap();
    }

    #[test]
    fn test_tampered_delegator_breaks_said() {
        let mut dip = KeyEvent::delegated_inception(
            &[&Signer::generate()],
            &[&Signer::generate()],
            "Iaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        )
        .unwrap();
        dip.delegator = Some("Ibbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".into());
        assert!(dip.verify_said().is_err());
    }

    #[test]
    fn test_interaction_chains_to_prior() {
        let icp = KeyEvent::inception(&[&Signer::generate()], &[&Signer::generate()]).unwrap();
        let seal = icp.seal();
        let ixn = KeyEvent::interaction(&icp, vec![seal.clone()]).unwrap();

        assert_eq!(ixn.sn, 1);
        assert_eq!(ixn.prior.as_deref(), Some(icp.said.as_str()));
        assert_eq!(ixn.anchors, vec![seal]);
        ixn.verify_said().unwrap();
    }

    #[test]
    fn test_sn_serializes_as_hex() {
        let icp = KeyEvent::inception(&[&Signer::generate()], &[&Signer::generate()]).unwrap();
        let mut event = KeyEvent::interaction(&icp, Vec::new()).unwrap();
        event.sn = 26;
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["s"], "1a");

        let back: KeyEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.sn, 26);
    }

    #[test]
    fn test_signature_verification() {
        let (current, next) = (Signer::generate(), Signer::generate());
        let icp = KeyEvent::inception(&[&current], &[&next]).unwrap();
        let signed = SignedEvent::sign(icp.clone(), &[&current]).unwrap();
        signed.verify_signatures(&icp.keys, 1).unwrap();

        let forged = SignedEvent::sign(icp.clone(), &[&Signer::generate()]).unwrap();
        assert!(matches!(
            forged.verify_signatures(&icp.keys, 1),
            Err(Error::SignatureMismatch { sn: 0, .. })
        ));
    }
}
