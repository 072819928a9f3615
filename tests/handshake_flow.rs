#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end login and dispatch through `ClientConnection` over an in-memory transport.

mod common;

use common::*;
use machonet::core::marshal::{PackedObject, Value};
use machonet::protocol::handshake::{version_record, HandshakeState, CRYPTO_ACCEPTED};
use machonet::protocol::message::{CallResponse, Message, MessageKind};
use machonet::protocol::records::{CryptoHandshakeAck, CryptoServerHandshake, Record, VersionExchange};
use machonet::service::connection::ReadStatus;
use machonet::utils::compression;
use std::sync::Arc;

// ============================================================================
// LOGIN
// ============================================================================

#[test]
fn test_full_login_sequence() {
    let (ctx, log) = context();
    let mut conn = connect(&ctx, 5000);

    let status = conn.on_read(&frames(&login_sequence(&ctx.config.protocol, USER, PASSWORD)));
    assert_eq!(status, ReadStatus::Idle);
    assert!(conn.is_authenticated());
    assert_eq!(conn.handshake_state(), HandshakeState::Done);

    let replies = conn.transport_mut().drain();
    assert_eq!(replies.len(), 4, "version, crypto ok, server handshake, ack");

    let version = VersionExchange::decode(replies[0].clone()).unwrap();
    assert_eq!(version.user_count, 0);
    assert_eq!(version.project_version, ctx.config.protocol.project_version);

    assert_eq!(replies[1], Value::String(CRYPTO_ACCEPTED.to_owned()));

    let shake = CryptoServerHandshake::decode(replies[2].clone()).unwrap();
    assert_eq!(shake.macho_version, ctx.config.protocol.macho_version);
    assert_eq!(shake.boot_codename, ctx.config.protocol.codename);

    let ack = CryptoHandshakeAck::decode(replies[3].clone()).unwrap();
    assert_eq!(ack.user_id, USER_ID);
    assert_eq!(ack.user_client_id, USER_ID);
    assert_eq!(ack.jit, "EN");
    assert_eq!(ack.address, "192.168.1.10");

    assert_eq!(ctx.registry.authorized_count(), 1);
    let session = ctx.registry.lookup(USER_ID).expect("session registered");
    assert_eq!(session.user_name(), USER);
    assert_eq!(session.link().unwrap().connection_id, conn.id());
    assert!(Arc::ptr_eq(conn.session().unwrap(), &session));

    assert_eq!(*log.lock().unwrap(), vec![format!("login:{USER_ID}@192.168.1.10")]);
    assert_eq!(ctx.metrics.snapshot().handshakes_success, 1);
}

#[test]
fn test_login_split_across_reads() {
    let (ctx, _log) = context();
    let mut conn = connect(&ctx, 5001);
    let bytes = frames(&login_sequence(&ctx.config.protocol, USER, PASSWORD));

    // one byte at a time
    for byte in &bytes {
        assert_eq!(conn.on_read(std::slice::from_ref(byte)), ReadStatus::Idle);
    }
    assert!(conn.is_authenticated());
}

#[test]
fn test_queue_check_repeats_version() {
    let (ctx, _log) = context();
    let mut conn = connect(&ctx, 5002);
    conn.transport_mut().drain();
    let version = client_version(&ctx.config.protocol);

    for _ in 0..3 {
        conn.on_read(&frames(&[version.clone(), queue_check()]));
        let replies = conn.transport_mut().drain();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0], Value::Integer(ctx.config.protocol.queue_position));
        assert_eq!(replies[1], version_record(&ctx.config.protocol, 0));
        assert_eq!(conn.handshake_state(), HandshakeState::AwaitingVersion);
    }

    conn.on_read(&frames(&login_sequence(&ctx.config.protocol, USER, PASSWORD)));
    assert!(conn.is_authenticated());
}

#[test]
fn test_hashed_password_requests_plain() {
    let (ctx, _log) = context();
    let mut conn = connect(&ctx, 5003);
    let config = &ctx.config.protocol;

    conn.on_read(&frames(&[client_version(config), vip_key(), placebo()]));
    conn.transport_mut().drain();

    conn.on_read(&frame(&challenge(USER, Value::None)));
    assert_eq!(conn.transport_mut().drain(), vec![Value::Integer(1)]);
    assert_eq!(conn.handshake_state(), HandshakeState::AwaitingCryptoChallenge);

    conn.on_read(&frames(&[challenge(USER, password(PASSWORD)), handshake_result()]));
    assert!(conn.is_authenticated());
}

#[test]
fn test_version_mismatch_closes() {
    let (ctx, _log) = context();
    let mut conn = connect(&ctx, 5004);
    assert_eq!(ctx.registry.connected_count(), 1);

    let mut stale = ctx.config.protocol.clone();
    stale.build_version -= 1;
    let status = conn.on_read(&frame(&client_version(&stale)));

    assert_eq!(status, ReadStatus::Closed);
    assert!(!conn.transport().connected);
    assert_eq!(ctx.registry.connected_count(), 0);
    assert_eq!(ctx.metrics.snapshot().handshakes_failed, 1);
    // nothing after the initial version
    assert_eq!(conn.transport_mut().drain().len(), 1);
}

#[test]
fn test_wrong_password_closes() {
    let (ctx, log) = context();
    let mut conn = connect(&ctx, 5005);

    let status = conn.on_read(&frames(&login_sequence(&ctx.config.protocol, USER, "nope")));
    assert_eq!(status, ReadStatus::Closed);
    assert!(!conn.is_authenticated());
    assert_eq!(ctx.registry.authorized_count(), 0);
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn test_undecodable_frame_before_login_closes() {
    let (ctx, _log) = context();
    let mut conn = connect(&ctx, 5006);

    let mut garbage = vec![3u8, 0, 0, 0];
    garbage.extend_from_slice(&[0x7E, 0, 0]);
    assert_eq!(conn.on_read(&garbage), ReadStatus::Closed);
    assert_eq!(ctx.metrics.snapshot().decode_errors, 1);
}

#[test]
fn test_oversized_frame_closes() {
    let (ctx, _log) = context();
    let mut conn = connect(&ctx, 5007);

    let declared = (ctx.config.transport.max_payload_size + 1) as u32;
    assert_eq!(conn.on_read(&declared.to_le_bytes()), ReadStatus::Closed);
    assert!(conn.is_closed());
}

// ============================================================================
// AFTER LOGIN
// ============================================================================

fn logged_in(
    ctx: &machonet::service::connection::ServerContext,
    port: u16,
) -> machonet::service::connection::ClientConnection<MockTransport> {
    let mut conn = connect(ctx, port);
    conn.on_read(&frames(&login_sequence(&ctx.config.protocol, USER, PASSWORD)));
    assert!(conn.is_authenticated());
    conn.transport_mut().drain();
    conn
}

#[test]
fn test_call_gets_reply() {
    let (ctx, log) = context();
    let mut conn = logged_in(&ctx, 5100);

    assert_eq!(conn.on_read(&frame(&call_message("macho.CallReq", "GetCharacters"))), ReadStatus::Idle);

    let replies = conn.transport_mut().drain();
    assert_eq!(replies.len(), 1);
    let reply = Message::decode(replies[0].clone()).unwrap();
    assert_eq!(reply.header.kind(), Some(MessageKind::CallRsp));
    assert_eq!(reply.header.type_string, "macho.CallRsp");
    let body = CallResponse::decode(reply.payload).unwrap();
    assert_eq!(body.values, vec![Value::from("GetCharacters")]);

    assert!(log.lock().unwrap().contains(&"call:GetCharacters".to_owned()));
}

#[test]
fn test_bad_message_is_dropped_not_fatal() {
    let (ctx, log) = context();
    let mut conn = logged_in(&ctx, 5101);

    // type string disagrees with the tag
    assert_eq!(conn.on_read(&frame(&call_message("macho.Notification", "Nope"))), ReadStatus::Idle);
    // not a message at all
    assert_eq!(conn.on_read(&frame(&Value::Integer(5))), ReadStatus::Idle);
    // undecodable bytes
    assert_eq!(conn.on_read(&[2, 0, 0, 0, 0x7E, 0x01]), ReadStatus::Idle);
    assert!(conn.transport_mut().drain().is_empty());

    conn.on_read(&frame(&call_message("macho.CallReq", "StillAlive")));
    assert_eq!(conn.transport_mut().drain().len(), 1);
    assert!(!conn.is_closed());

    let calls: Vec<String> = log.lock().unwrap().iter().filter(|l| l.starts_with("call:")).cloned().collect();
    assert_eq!(calls, vec!["call:StillAlive".to_owned()]);

    let snapshot = ctx.metrics.snapshot();
    assert_eq!(snapshot.dispatch_errors, 1);
    assert_eq!(snapshot.decode_errors, 2);
}

#[test]
fn test_client_exception_is_discarded() {
    let (ctx, _log) = context();
    let mut conn = logged_in(&ctx, 5102);

    let exception = Value::PackedObject1(PackedObject::new("exceptions.GPSTransportClosed", vec!["bye".into()]));
    assert_eq!(conn.on_read(&frame(&exception)), ReadStatus::Idle);
    assert!(conn.transport_mut().drain().is_empty());
    assert!(!conn.is_closed());
}

#[test]
fn test_compressed_frame_accepted() {
    let (ctx, log) = context();
    let mut conn = logged_in(&ctx, 5103);

    let raw = machonet::core::marshal::encode(&call_message("macho.CallReq", "Zipped"));
    let zipped = compression::compress(&raw, 6).unwrap();
    assert!(compression::is_compressed(&zipped));

    let mut bytes = (zipped.len() as u32).to_le_bytes().to_vec();
    bytes.extend_from_slice(&zipped);
    conn.on_read(&bytes);

    assert_eq!(conn.transport_mut().drain().len(), 1);
    assert!(log.lock().unwrap().contains(&"call:Zipped".to_owned()));
}

#[test]
fn test_stalled_replies_keep_order() {
    let (ctx, _log) = context();
    let mut conn = logged_in(&ctx, 5104);

    conn.transport_mut().capacity = 0;
    let input = frames(&[
        call_message("macho.CallReq", "first"),
        call_message("macho.CallReq", "second"),
    ]);
    assert_eq!(conn.on_read(&input), ReadStatus::Blocked);
    assert_eq!(conn.stalled_frames(), 1, "second call waits until the first reply is out");

    conn.transport_mut().capacity = 1 << 20;
    assert_eq!(conn.resume(), ReadStatus::Idle);
    assert_eq!(conn.stalled_frames(), 0);

    let methods: Vec<Value> = conn
        .transport_mut()
        .drain()
        .into_iter()
        .map(|v| CallResponse::decode(Message::decode(v).unwrap().payload).unwrap().values[0].clone())
        .collect();
    assert_eq!(methods, vec![Value::from("first"), Value::from("second")]);
}

#[test]
fn test_handshake_frame_after_login_is_not_replayed() {
    let (ctx, _log) = context();
    let mut conn = logged_in(&ctx, 5105);

    // a second version record is just a malformed message now
    assert_eq!(conn.on_read(&frame(&client_version(&ctx.config.protocol))), ReadStatus::Idle);
    assert!(conn.transport_mut().drain().is_empty());
    assert_eq!(conn.handshake_state(), HandshakeState::Done);
}

// ============================================================================
// SESSIONS
// ============================================================================

#[test]
fn test_disconnect_unregisters_session() {
    let (ctx, _log) = context();
    let conn = logged_in(&ctx, 5200);
    assert_eq!(ctx.registry.authorized_count(), 1);

    drop(conn);
    assert_eq!(ctx.registry.authorized_count(), 0);
    assert_eq!(ctx.registry.connected_count(), 0);
    let kept = ctx.registry.lookup_any(USER_ID).expect("directory keeps the session");
    assert!(!kept.is_linked());
}

#[test]
fn test_reconnect_reuses_session() {
    let (ctx, _log) = context();
    let first = logged_in(&ctx, 5201);
    let original = first.session().unwrap().clone();
    drop(first);

    let second = logged_in(&ctx, 5202);
    assert!(Arc::ptr_eq(second.session().unwrap(), &original));
    assert_eq!(original.link().unwrap().connection_id, second.id());
}

#[test]
fn test_stale_connection_does_not_evict_newer() {
    let (ctx, _log) = context();
    let old = logged_in(&ctx, 5203);
    let new = logged_in(&ctx, 5204);
    assert_eq!(ctx.registry.authorized_count(), 1);

    drop(old);
    let session = ctx.registry.lookup(USER_ID).expect("still active");
    assert_eq!(session.link().unwrap().connection_id, new.id());

    drop(new);
    assert!(ctx.registry.lookup(USER_ID).is_none());
}

#[test]
fn test_version_reports_authorized_users() {
    let (ctx, _log) = context();
    let _alice = logged_in(&ctx, 5205);

    let mut conn = connect(&ctx, 5206);
    let announced = VersionExchange::decode(conn.transport_mut().drain().remove(0)).unwrap();
    assert_eq!(announced.user_count, 1);
}
