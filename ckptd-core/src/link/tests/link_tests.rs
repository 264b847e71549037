use super::*;
use crate::protocol::{MessageType, WorkerState};
use std::io::Cursor;

fn ok_message() -> Message {
    let mut msg = Message::new(MessageType::Ok);
    msg.state = WorkerState::Suspended;
    msg
}

#[test]
fn test_sync_roundtrip_with_payload() {
    let mut wire = Vec::new();
    send_message(&mut wire, &ok_message(), b"/tmp/ckpt-dir").unwrap();

    let mut reader = Cursor::new(wire);
    let (msg, payload) = recv_message(&mut reader).unwrap();
    assert_eq!(msg.msg_type, MessageType::Ok);
    assert_eq!(msg.extra_bytes, 13);
    assert_eq!(payload, b"/tmp/ckpt-dir");
}

#[test]
fn test_send_overrides_stale_extra_bytes() {
    let mut msg = ok_message();
    msg.extra_bytes = 9999;
    let mut wire = Vec::new();
    send_message(&mut wire, &msg, b"ab").unwrap();

    let (decoded, payload) = recv_message(&mut Cursor::new(wire)).unwrap();
    assert_eq!(decoded.extra_bytes, 2);
    assert_eq!(payload, b"ab");
}

#[test]
fn test_recv_rejects_truncated_header() {
    let mut wire = Vec::new();
    send_message(&mut wire, &ok_message(), &[]).unwrap();
    wire.truncate(40);
    assert!(recv_message(&mut Cursor::new(wire)).is_err());
}

#[test]
fn test_recv_rejects_invalid_message() {
    let mut msg = Message::new(MessageType::Ok);
    msg.state = WorkerState::Unknown;
    let mut wire = Vec::new();
    // Bypass send_message validation by encoding directly.
    wire.extend_from_slice(&msg.encode());
    assert!(recv_message(&mut Cursor::new(wire)).is_err());
}

#[tokio::test]
async fn test_async_roundtrip_with_payload() {
    let (mut a, mut b) = tokio::io::duplex(4096);
    write_message(&mut a, &ok_message(), b"payload").await.unwrap();

    let (msg, payload) = read_message(&mut b).await.unwrap();
    assert_eq!(msg.msg_type, MessageType::Ok);
    assert_eq!(payload, b"payload");
}

#[tokio::test]
async fn test_async_reads_back_to_back_messages() {
    let (mut a, mut b) = tokio::io::duplex(4096);
    write_message(&mut a, &ok_message(), b"one").await.unwrap();
    write_message(&mut a, &ok_message(), b"two").await.unwrap();

    let (_, first) = read_message(&mut b).await.unwrap();
    let (_, second) = read_message(&mut b).await.unwrap();
    assert_eq!(first, b"one");
    assert_eq!(second, b"two");
}
