#![no_main]

use libfuzzer_sys::fuzz_target;
use signaling_protocol::{decode_envelope, ClientRequest};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Malformed input must surface as an error, never a panic.
    if let Ok(envelope) = decode_envelope(text) {
        let _ = ClientRequest::from_envelope(envelope);
    }
});
