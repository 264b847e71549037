use super::*;

fn sample_pid() -> UniquePid {
    UniquePid {
        host_id: 0xdead_beef,
        pid: 4242,
        start_ns: 1_700_000_000_123_456_789,
        generation: 3,
    }
}

fn sample_message() -> Message {
    let mut msg = Message::new(MessageType::Ok);
    msg.state = WorkerState::Drained;
    msg.from = sample_pid();
    msg.comp_group = UniquePid::new(7, 1, 99);
    msg.virtual_pid = 4242;
    msg.real_pid = 4243;
    msg.nsid = *b"electns\0";
    msg.key_len = 16;
    msg.val_len = 28;
    msg.num_peers = 5;
    msg.is_running = 1;
    msg.coord_cmd = b'c' as u32;
    msg.coord_cmd_status = cmd_status::ERROR_NOT_RUNNING_STATE;
    msg.coord_timestamp = 0x0123_4567_89ab_cdef;
    msg.checkpoint_interval = 60;
    msg.ip_addr = 0x7f00_0001;
    msg.unique_id_offset = 2;
    msg.log_mask = 0xff;
    msg.extra_bytes = 44;
    msg
}

#[test]
fn test_message_roundtrip_preserves_every_field() {
    let msg = sample_message();
    let decoded = Message::decode(&msg.encode()).unwrap();
    assert_eq!(decoded, msg);
}

#[test]
fn test_header_is_exactly_144_bytes() {
    assert_eq!(HEADER_BYTES, 144);
    assert_eq!(sample_message().encode().len(), 144);
}

#[test]
fn test_decode_rejects_bad_magic() {
    let mut raw = sample_message().encode();
    raw[0] ^= 0xff;
    let err = Message::decode(&raw).unwrap_err();
    assert!(err.to_string().contains("magic"), "unexpected error: {err}");
}

#[test]
fn test_decode_rejects_wrong_header_size() {
    let mut raw = sample_message().encode();
    raw[16..20].copy_from_slice(&96u32.to_le_bytes());
    let err = Message::decode(&raw).unwrap_err();
    assert!(err.to_string().contains("header size"), "unexpected error: {err}");
}

#[test]
fn test_decode_rejects_unknown_type() {
    let mut raw = sample_message().encode();
    raw[24..28].copy_from_slice(&9999u32.to_le_bytes());
    let err = Message::decode(&raw).unwrap_err();
    assert!(
        err.to_string().contains("unknown message type"),
        "unexpected error: {err}"
    );
}

#[test]
fn test_decode_rejects_unknown_state() {
    let mut raw = sample_message().encode();
    raw[28..32].copy_from_slice(&77u32.to_le_bytes());
    let err = Message::decode(&raw).unwrap_err();
    assert!(
        err.to_string().contains("unknown worker state"),
        "unexpected error: {err}"
    );
}

#[test]
fn test_decode_rejects_oversized_payload_claim() {
    let mut raw = sample_message().encode();
    raw[20..24].copy_from_slice(&(MAX_EXTRA_BYTES + 1).to_le_bytes());
    assert!(Message::decode(&raw).is_err());
}

#[test]
fn test_poisoned_message_is_invalid() {
    let mut msg = sample_message();
    assert!(msg.is_valid());
    msg.poison();
    assert!(!msg.is_valid());
}

#[test]
fn test_ok_without_state_is_invalid() {
    let mut msg = Message::new(MessageType::Ok);
    msg.state = WorkerState::Unknown;
    assert!(!msg.is_valid());
    msg.state = WorkerState::Running;
    assert!(msg.is_valid());
}

#[test]
fn test_worker_state_u32_roundtrip() {
    for raw in 0..=10u32 {
        let state = WorkerState::try_from(raw).unwrap();
        assert_eq!(state as u32, raw);
    }
    assert!(WorkerState::try_from(11).is_err());
}

#[test]
fn test_worker_states_order_follows_cycle() {
    assert!(WorkerState::Running < WorkerState::Suspended);
    assert!(WorkerState::Suspended < WorkerState::FdLeaderElection);
    assert!(WorkerState::Drained < WorkerState::Checkpointed);
    assert!(WorkerState::DoneQuerying < WorkerState::Refilled);
}

#[test]
fn test_unique_pid_order_is_lexicographic() {
    let base = UniquePid::new(1, 10, 100);
    assert!(base < UniquePid::new(2, 0, 0));
    assert!(base < UniquePid::new(1, 11, 0));
    assert!(base < UniquePid::new(1, 10, 101));
    assert!(UniquePid::new(1, 10, 100) == base);
}

#[test]
fn test_unique_pid_pack_roundtrip() {
    let pid = sample_pid();
    let mut raw = [0u8; UNIQUE_PID_BYTES];
    pid.pack_into(&mut raw);
    assert_eq!(UniquePid::unpack_from(&raw), pid);

    let ordered = pid.pack_ordered();
    assert_eq!(UniquePid::unpack_ordered(&ordered), pid);
}

#[test]
fn test_unique_pid_ordered_packing_sorts_like_the_type() {
    let a = UniquePid::new(1, 5, 50);
    let b = UniquePid::new(1, 6, 0);
    let c = UniquePid::new(2, 0, 0);
    assert!(a.pack_ordered() < b.pack_ordered());
    assert!(b.pack_ordered() < c.pack_ordered());
}

#[test]
fn test_user_command_codes_roundtrip() {
    for cmd in [
        UserCommand::Status,
        UserCommand::Checkpoint,
        UserCommand::SetInterval,
        UserCommand::ListPeers,
        UserCommand::Kill,
    ] {
        assert_eq!(UserCommand::from_raw(cmd as u32), Some(cmd));
    }
    assert_eq!(UserCommand::from_raw(b'x' as u32), None);
}
