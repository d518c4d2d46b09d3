#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Inbound frames are text; anything else never reaches the decoder.
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = sibyl_client::protocol::decode(s);
    }
});
