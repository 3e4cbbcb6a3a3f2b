//! Fuzz target for secret stream decryption
//!
//! Feeds arbitrary frames to an initialized pull side.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use ziti_crypto::secret_stream::StreamState;
use ziti_crypto::{HBYTES, KEYBYTES, Tag};

#[derive(Debug, Arbitrary)]
struct StreamInput {
    key: [u8; KEYBYTES],
    header: [u8; HBYTES],
    plaintext: Vec<u8>,
    frames: Vec<Vec<u8>>,
}

fuzz_target!(|input: StreamInput| {
    let mut push = StreamState::init_push_with_header(&input.key, &input.header);
    let Ok(mut pull) = StreamState::init_pull(&input.key, &input.header) else {
        return;
    };

    // A genuine frame must decrypt
    let frame = push.push(&input.plaintext, Tag::Message);
    let (plaintext, tag) = pull.pull(&frame).expect("genuine frame");
    assert_eq!(plaintext, input.plaintext);
    assert_eq!(tag, Tag::Message);

    // Arbitrary frames should never panic
    for frame in &input.frames {
        let _ = pull.pull(frame);
    }
});
