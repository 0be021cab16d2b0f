//! Fuzz target for exchange message deserialization.
//!
//! Grants and Admits are fetched from a hosting service that may serve
//! anything; decoding and SAID checks must never panic.

#![no_main]

use kestrel_core::exchange::SignedExchange;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(signed) = serde_json::from_slice::<SignedExchange>(data) {
        let _ = signed.exn.verify_said();
        if let Some(credential) = signed.exn.credential() {
            let _ = credential.verify_said();
        }
    }
});
