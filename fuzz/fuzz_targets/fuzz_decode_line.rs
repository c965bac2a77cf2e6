#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_client::protocol::codec::decode_line;

fuzz_target!(|data: &[u8]| {
    // Any line the relay might send must decode to an event, never panic
    if let Ok(line) = std::str::from_utf8(data) {
        let _ = decode_line(line);
    }
});
