//! Fuzz target for the wire envelope decoder.
//!
//! Run with: cargo +nightly fuzz run fuzz_envelope_parser
//!
//! This exercises `Envelope::decode()` with arbitrary byte sequences to find
//! panics or hangs in JSON decoding and the kind/field coherence checks.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Malformed input must fail cleanly, never panic
    let _ = stevedore_core::Envelope::decode(data);
});
