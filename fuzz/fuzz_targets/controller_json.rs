//! Fuzz target for controller response parsing
//!
//! Tests that the controller models reject arbitrary JSON without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use ziti_controller::{ApiIdentity, NetworkSession, Service};

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<Service>(data);
    let _ = serde_json::from_slice::<Vec<Service>>(data);
    let _ = serde_json::from_slice::<NetworkSession>(data);
    let _ = serde_json::from_slice::<ApiIdentity>(data);
});
