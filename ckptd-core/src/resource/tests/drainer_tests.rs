use super::*;
use crate::protocol::UniquePid;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

fn id(serial: u32) -> ConnectionId {
    ConnectionId::new(UniquePid::new(1, 7, 7), serial)
}

#[test]
fn test_drain_captures_in_flight_bytes() {
    let (mut a, b) = UnixStream::pair().unwrap();
    a.write_all(b"ABC").unwrap();

    // Both endpoints drain concurrently, as two workers would.
    let a_fd = a.as_raw_fd();
    let a_side = std::thread::spawn(move || {
        let mut drainer = KernelBufferDrainer::new();
        let outcome = drainer.drain_socket(id(1), a_fd).unwrap();
        (drainer, outcome, a)
    });

    let mut drainer_b = KernelBufferDrainer::new();
    let outcome_b = drainer_b.drain_socket(id(2), b.as_raw_fd()).unwrap();
    let (drainer_a, outcome_a, _a) = a_side.join().unwrap();

    assert_eq!(outcome_b, DrainOutcome::Drained(3));
    assert_eq!(drainer_b.drained_bytes(&id(2)), Some(b"ABC".as_slice()));
    assert_eq!(outcome_a, DrainOutcome::Drained(0));
    assert_eq!(drainer_a.drained_bytes(&id(1)), Some(b"".as_slice()));
}

#[test]
fn test_drain_then_refill_restores_receive_queue() {
    let (mut a, mut b) = UnixStream::pair().unwrap();
    a.write_all(b"ABC").unwrap();

    let a_fd = a.as_raw_fd();
    let b_fd = b.as_raw_fd();

    // Refill only starts once every worker passed the drain barrier; the
    // barrier here stands in for the coordinator's.
    let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
    let a_barrier = std::sync::Arc::clone(&barrier);
    let a_side = std::thread::spawn(move || {
        let mut drainer = KernelBufferDrainer::new();
        drainer.drain_socket(id(1), a_fd).unwrap();
        a_barrier.wait();
        drainer.refill_socket(id(1), a_fd).unwrap();
        a
    });

    let mut drainer = KernelBufferDrainer::new();
    drainer.drain_socket(id(2), b_fd).unwrap();
    barrier.wait();
    drainer.refill_socket(id(2), b_fd).unwrap();
    let mut a = a_side.join().unwrap();

    // The bytes A sent before the checkpoint are waiting in B's receive
    // queue again, and the link still works in both directions.
    let mut buf = [0u8; 3];
    b.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ABC");

    b.write_all(b"reply").unwrap();
    let mut buf = [0u8; 5];
    a.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"reply");
}

#[test]
fn test_split_phase_drain_and_refill_for_a_pair_in_one_process() {
    // One worker can own both endpoints of a pair; the split phases keep
    // that from deadlocking on unsent sentinels.
    let (mut a, mut b) = UnixStream::pair().unwrap();
    a.write_all(b"XY").unwrap();
    let a_fd = a.as_raw_fd();
    let b_fd = b.as_raw_fd();

    let mut drainer = KernelBufferDrainer::new();
    drainer.begin_drain(id(1), a_fd).unwrap();
    drainer.begin_drain(id(2), b_fd).unwrap();
    drainer.finish_drain(id(1), a_fd).unwrap();
    drainer.finish_drain(id(2), b_fd).unwrap();
    assert_eq!(drainer.drained_bytes(&id(2)), Some(b"XY".as_slice()));

    drainer.send_refill(id(1), a_fd).unwrap();
    drainer.send_refill(id(2), b_fd).unwrap();
    drainer.finish_refill(a_fd).unwrap();
    drainer.finish_refill(b_fd).unwrap();

    let mut buf = [0u8; 2];
    b.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"XY");
}

#[test]
fn test_refill_with_nothing_drained_is_harmless() {
    let (a, b) = UnixStream::pair().unwrap();
    let a_fd = a.as_raw_fd();
    let b_fd = b.as_raw_fd();

    let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
    let a_barrier = std::sync::Arc::clone(&barrier);
    let a_side = std::thread::spawn(move || {
        let mut drainer = KernelBufferDrainer::new();
        drainer.drain_socket(id(1), a_fd).unwrap();
        a_barrier.wait();
        drainer.refill_socket(id(1), a_fd).unwrap();
        a
    });

    let mut drainer = KernelBufferDrainer::new();
    drainer.drain_socket(id(2), b_fd).unwrap();
    barrier.wait();
    drainer.refill_socket(id(2), b_fd).unwrap();
    a_side.join().unwrap();
}

#[test]
fn test_dead_peer_reports_disconnected() {
    let (a, b) = UnixStream::pair().unwrap();
    drop(a);

    let mut drainer = KernelBufferDrainer::new();
    let outcome = drainer.drain_socket(id(3), b.as_raw_fd()).unwrap();
    assert_eq!(outcome, DrainOutcome::Disconnected);
    assert_eq!(drainer.disconnected(), &[id(3)]);
    assert!(drainer.drained_bytes(&id(3)).is_none());
}

#[test]
fn test_take_disconnected_clears_the_list() {
    let (a, b) = UnixStream::pair().unwrap();
    drop(a);
    let mut drainer = KernelBufferDrainer::new();
    drainer.drain_socket(id(4), b.as_raw_fd()).unwrap();
    assert_eq!(drainer.take_disconnected(), vec![id(4)]);
    assert!(drainer.disconnected().is_empty());
}
