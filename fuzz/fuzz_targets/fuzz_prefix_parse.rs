//! Fuzz target for prefix parsing.
//!
//! Prefixes and OOBI URLs arrive from counterparties and task-data files, so
//! parsing them must never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(prefix) = input.parse::<kestrel_core::Prefix>() {
            // A parsed prefix must print back to what was parsed
            assert_eq!(prefix.to_string(), input);
        }
        let _ = kestrel_host::types::oobi_prefix(input);
    }
});
