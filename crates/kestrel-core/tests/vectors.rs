//! Interoperability vectors for canonical encoding, digests and key derivation.

#![allow(dead_code)]

use kestrel_core::prefix::Code;
use kestrel_core::{KeyChain, Passcode, Prefix, keys, said, signing};
use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize)]
struct Vectors {
    canonical: Vec<CanonicalCase>,
    said: Vec<SaidCase>,
    prefixes: PrefixVectors,
    keys: KeyVectors,
}

#[derive(Deserialize)]
struct CanonicalCase {
    description: String,
    input: Value,
    canonical: String,
    digest: String,
}

#[derive(Deserialize)]
struct SaidCase {
    description: String,
    input: Value,
    field: String,
    said: String,
}

#[derive(Deserialize)]
struct PrefixVectors {
    valid: Vec<ValidPrefixCase>,
    invalid: Vec<InvalidPrefixCase>,
}

#[derive(Deserialize)]
struct ValidPrefixCase {
    description: String,
    input: String,
    code: String,
}

#[derive(Deserialize)]
struct InvalidPrefixCase {
    description: String,
    input: String,
    error_contains: String,
}

#[derive(Deserialize)]
struct KeyVectors {
    passcode: String,
    controller: String,
    identifiers: Vec<IdentifierKeys>,
    signature: SignatureCase,
}

#[derive(Deserialize)]
struct IdentifierKeys {
    alias: String,
    index: u32,
    current: String,
    next: String,
}

#[derive(Deserialize)]
struct SignatureCase {
    message: String,
    signature: String,
}

fn vectors() -> Vectors {
    serde_json::from_str(include_str!("vectors/core.json")).expect("Failed to parse vectors")
}

#[test]
fn test_canonical_encoding() {
    for case in vectors().canonical {
        let canonical = signing::canonicalize_value(&case.input);
        assert_eq!(canonical, case.canonical, "{}", case.description);
        assert_eq!(
            signing::digest(canonical.as_bytes()).to_string(),
            case.digest,
            "{}",
            case.description
        );
    }
}

#[test]
fn test_said_vectors() {
    for case in vectors().said {
        let (computed, document) = said::saidify(case.input, &[case.field.as_str()])
            .unwrap_or_else(|e| panic!("{}: {}", case.description, e));
        assert_eq!(computed, case.said, "{}", case.description);
        assert_eq!(document[&case.field], Value::String(case.said.clone()));
        said::verify(&document, &case.field, &[])
            .unwrap_or_else(|e| panic!("{}: {}", case.description, e));
    }
}

#[test]
fn test_valid_prefixes() {
    for case in vectors().prefixes.valid {
        let prefix: Prefix = case
            .input
            .parse()
            .unwrap_or_else(|e| panic!("{}: failed to parse: {}", case.description, e));

        let expected = match case.code.as_str() {
            "ed25519" => Code::Ed25519,
            "sha256" => Code::Sha256,
            other => panic!("unknown code in vectors: {other}"),
        };
        assert_eq!(prefix.code(), expected, "{}", case.description);
        assert_eq!(prefix.to_string(), case.input, "{}", case.description);
    }
}

#[test]
fn test_invalid_prefixes() {
    for case in vectors().prefixes.invalid {
        let err = case
            .input
            .parse::<Prefix>()
            .expect_err(&format!("{}: should fail", case.description));
        assert!(
            err.to_string().contains(&case.error_contains),
            "{}: error {:?} should mention {:?}",
            case.description,
            err.to_string(),
            case.error_contains
        );
    }
}

#[test]
fn test_key_derivation_vectors() {
    let vectors = vectors().keys;
    let passcode = Passcode::parse(&vectors.passcode).unwrap();
    let chain = KeyChain::from_passcode(&passcode);

    assert_eq!(chain.controller().public_key(), vectors.controller);

    for case in &vectors.identifiers {
        let (current, next) = chain.identifier_signers(&case.alias, case.index);
        assert_eq!(current.public_key(), case.current, "{} current", case.alias);
        assert_eq!(next.public_key(), case.next, "{} next", case.alias);
    }

    // Ed25519 signatures are deterministic, so the encoding is stable too.
    let signature = chain.controller().sign(vectors.signature.message.as_bytes());
    assert_eq!(keys::encode_signature(&signature), vectors.signature.signature);
    keys::verify(
        &vectors.controller,
        vectors.signature.message.as_bytes(),
        &vectors.signature.signature,
    )
    .unwrap();
}
