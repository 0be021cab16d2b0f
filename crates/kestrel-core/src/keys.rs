//! Key management for agent identities.
//!
//! An agent's keys are never stored: every signing key is re-derived from the
//! agent's passcode and a derivation path, so a passcode is the whole secret.

use crate::{Error, Prefix, Result, signing};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;

/// Minimum passcode length accepted by hosting services.
pub const PASSCODE_MIN_LEN: usize = 21;

/// Derivation path of the controller (session) key.
pub const CONTROLLER_PATH: &str = "controller";

/// Domain separator mixed into every derived seed.
const SALT_DOMAIN: &[u8] = b"kestrel/salty/v1";

/// A high-entropy agent passcode.
#[derive(Clone, PartialEq, Eq)]
pub struct Passcode(String);

impl Passcode {
    /// Validate a passcode.
    ///
    /// Passcodes are base64url text of at least [`PASSCODE_MIN_LEN`] characters.
    pub fn parse(input: &str) -> Result<Self> {
        if input.len() < PASSCODE_MIN_LEN {
            return Err(Error::InvalidPasscode(format!(
                "must be at least {} characters, got {}",
                PASSCODE_MIN_LEN,
                input.len()
            )));
        }
        if let Some(c) = input
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(Error::InvalidPasscode(format!(
                "unexpected character {c:?}"
            )));
        }
        Ok(Self(input.to_string()))
    }

    /// Generate a fresh random passcode.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        let mut text = URL_SAFE_NO_PAD.encode(bytes);
        text.truncate(PASSCODE_MIN_LEN + 1);
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Passcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passcode(<redacted>)")
    }
}

/// Deterministic key derivation from a passcode.
pub struct KeyChain {
    seed: [u8; 32],
}

impl KeyChain {
    pub fn from_passcode(passcode: &Passcode) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(SALT_DOMAIN);
        hasher.update(passcode.as_str().as_bytes());
        Self {
            seed: hasher.finalize().into(),
        }
    }

    /// Derive the signer at a path.
    pub fn signer(&self, path: &str) -> Signer {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(path.as_bytes());
        let derived: [u8; 32] = hasher.finalize().into();
        Signer::from_bytes(&derived)
    }

    /// The controller key that authenticates a session.
    pub fn controller(&self) -> Signer {
        self.signer(CONTROLLER_PATH)
    }

    /// Current (`index`) and next (`index + 1`) signers for an identifier alias.
    pub fn identifier_signers(&self, alias: &str, index: u32) -> (Signer, Signer) {
        (
            self.signer(&format!("{alias}/{index}")),
            self.signer(&format!("{alias}/{}", index + 1)),
        )
    }
}

impl fmt::Debug for KeyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyChain(<redacted>)")
    }
}

/// An Ed25519 signing key.
pub struct Signer {
    signing_key: SigningKey,
}

impl Signer {
    /// Generate a new random signer.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from existing bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Get the public verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The public key as a `D` prefix.
    pub fn public_key(&self) -> String {
        Prefix::from_public_key(&self.verifying_key()).to_string()
    }

    /// Pre-rotation commitment to this signer's public key.
    pub fn public_key_digest(&self) -> String {
        key_digest(&self.public_key())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("public_key", &self.public_key())
            .finish()
    }
}

/// Digest committing to a public key (used for next-key commitments).
pub fn key_digest(public_key: &str) -> String {
    signing::digest(public_key.as_bytes()).to_string()
}

/// Encode a signature as base64url text.
pub fn encode_signature(signature: &Signature) -> String {
    URL_SAFE_NO_PAD.encode(signature.to_bytes())
}

/// Decode a base64url signature.
pub fn decode_signature(text: &str) -> Result<Signature> {
    let bytes = URL_SAFE_NO_PAD
        .decode(text)
        .map_err(|_| Error::InvalidSignature)?;
    let bytes: [u8; 64] = bytes.try_into().map_err(|_| Error::InvalidSignature)?;
    Ok(Signature::from_bytes(&bytes))
}

/// Verify an encoded signature against an encoded public key.
pub fn verify(public_key: &str, message: &[u8], signature: &str) -> Result<()> {
    let key: Prefix = public_key.parse()?;
    let signature = decode_signature(signature)?;
    key.verifying_key()?
        .verify(message, &signature)
        .map_err(|_| Error::InvalidSignature)
}
