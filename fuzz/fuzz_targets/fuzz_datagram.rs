#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_client::transport::datagram::DatagramCodec;
use relay_client::utils::crypto::SessionCipher;

fuzz_target!(|data: &[u8]| {
    // Length prefix, decryption and the plaintext fallback on hostile input
    let mut codec = DatagramCodec::new(Some(SessionCipher::derive("fuzz", "secret")));
    if let Some(value) = codec.decode(data) {
        let _ = relay_client::protocol::codec::decode_datagram(value);
    }
});
