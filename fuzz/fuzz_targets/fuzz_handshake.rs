#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use machonet::config::ProtocolConfig;
use machonet::core::frame::FrameReader;
use machonet::core::marshal;
use machonet::protocol::handshake::{CredentialTable, HandshakeContext, ServerHandshake};

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary frames through the login state machine until it fails
    let config = ProtocolConfig::default();
    let accounts = CredentialTable::new().with_account("fuzz", "fuzz", 1);
    let ctx = HandshakeContext {
        config: &config,
        user_count: 0,
        peer: "127.0.0.1:26000".parse().expect("valid address"),
        authenticator: &accounts,
    };

    let mut reader = FrameReader::new(64 * 1024);
    let mut buf = BytesMut::from(data);
    let mut handshake = ServerHandshake::new();

    while let Ok(Some(frame)) = reader.try_extract_frame(&mut buf) {
        let Ok(value) = marshal::decode(&frame) else {
            break;
        };
        if handshake.handle(value, &ctx).is_err() {
            break;
        }
    }
});
