//! Fuzz target for edge message parsing
//!
//! Tests that the message decoder handles arbitrary input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use ziti_core::Message;

fuzz_target!(|data: &[u8]| {
    // The decoder should never panic, only return Ok or Err
    if let Ok(msg) = Message::decode(data) {
        // Whatever decodes must survive a re-encode
        let again = Message::decode(&msg.encode()).expect("re-encoded frame");
        assert_eq!(again, msg);
        let _ = msg.conn_id();
        let _ = msg.reply_for();
    }
});
