//! Self-certifying prefixes.
//!
//! Format: `<code><base64url(32 bytes)>`, 44 characters in total.
//!
//! | Code | Meaning |
//! |------|---------|
//! | `D`  | Ed25519 public key |
//! | `I`  | SHA-256 digest (SAIDs and self-addressing identifiers) |

use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of every encoded prefix.
pub const PREFIX_LEN: usize = 44;

/// Derivation code of a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// Ed25519 public key.
    Ed25519,
    /// SHA-256 digest.
    Sha256,
}

impl Code {
    fn as_char(self) -> char {
        match self {
            Code::Ed25519 => 'D',
            Code::Sha256 => 'I',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            'D' => Some(Code::Ed25519),
            'I' => Some(Code::Sha256),
            _ => None,
        }
    }
}

/// A parsed prefix: an AID, a SAID or an encoded public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Prefix {
    code: Code,
    raw: [u8; 32],
}

impl Prefix {
    /// Prefix for an Ed25519 public key.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self {
            code: Code::Ed25519,
            raw: key.to_bytes(),
        }
    }

    /// Prefix for a SHA-256 digest.
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self {
            code: Code::Sha256,
            raw: digest,
        }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn raw(&self) -> &[u8; 32] {
        &self.raw
    }

    /// Interpret this prefix as an Ed25519 verifying key.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        if self.code != Code::Ed25519 {
            return Err(Error::InvalidPrefix(format!("{self} is not a public key")));
        }
        VerifyingKey::from_bytes(&self.raw).map_err(|e| Error::InvalidPrefix(e.to_string()))
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.code.as_char(), URL_SAFE_NO_PAD.encode(self.raw))
    }
}

impl FromStr for Prefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != PREFIX_LEN {
            return Err(Error::InvalidPrefix(format!(
                "expected {} characters, got {}",
                PREFIX_LEN,
                s.len()
            )));
        }

        let mut chars = s.chars();
        let code = chars
            .next()
            .and_then(Code::from_char)
            .ok_or_else(|| Error::InvalidPrefix(format!("unknown derivation code in {s}")))?;

        let raw = URL_SAFE_NO_PAD
            .decode(chars.as_str())
            .map_err(|e| Error::InvalidPrefix(e.to_string()))?;

        let raw: [u8; 32] = raw
            .try_into()
            .map_err(|_| Error::InvalidPrefix("payload must be 32 bytes".into()))?;

        Ok(Self { code, raw })
    }
}

impl TryFrom<String> for Prefix {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Prefix> for String {
    fn from(value: Prefix) -> Self {
        value.to_string()
    }
}
