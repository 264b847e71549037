use super::*;
use crate::coordinator::NameService;
use crate::protocol::UniquePid;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::os::unix::net::UnixStream;

fn conn_id(pid: i32, serial: u32) -> ConnectionId {
    ConnectionId::new(UniquePid::new(1, pid, 1000), serial)
}

#[test]
fn test_listener_side_is_the_smaller_id() {
    let low = conn_id(1, 1);
    let high = conn_id(2, 1);
    let listener = RewireEndpoint {
        id: low,
        peer: high,
        fds: vec![3],
        domain: RestoreDomain::Inet,
    };
    let connector = RewireEndpoint {
        id: high,
        peer: low,
        fds: vec![4],
        domain: RestoreDomain::Inet,
    };
    assert!(listener.is_listener());
    assert!(!connector.is_listener());
}

#[test]
fn test_restore_domain_from_raw() {
    assert_eq!(RestoreDomain::from_raw(libc::AF_INET), Some(RestoreDomain::Inet));
    assert_eq!(RestoreDomain::from_raw(libc::AF_INET6), Some(RestoreDomain::Inet6));
    assert_eq!(RestoreDomain::from_raw(libc::AF_UNIX), Some(RestoreDomain::Unix));
    assert_eq!(RestoreDomain::from_raw(libc::AF_PACKET), None);
}

/// Full localhost rendezvous: both sides of a former TCP pair find each
/// other through the name service and splice the restored socket over the
/// original fd numbers.
#[test]
fn test_rewire_reconnects_a_tcp_pair_over_original_fds() {
    // Stand-ins for the fds the restored processes would have inherited
    // from their images.
    let (old_a, old_b) = UnixStream::pair().unwrap();
    let a_fd = old_a.as_raw_fd();
    let b_fd = old_b.as_raw_fd();

    let a_id = conn_id(1, 1);
    let b_id = conn_id(2, 1);
    let scratch = std::env::temp_dir();
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);

    let side_a = ConnectionRewirer::open(
        vec![RewireEndpoint {
            id: a_id,
            peer: b_id,
            fds: vec![a_fd],
            domain: RestoreDomain::Inet,
        }],
        loopback,
        &scratch,
    )
    .unwrap();
    let side_b = ConnectionRewirer::open(
        vec![RewireEndpoint {
            id: b_id,
            peer: a_id,
            fds: vec![b_fd],
            domain: RestoreDomain::Inet,
        }],
        loopback,
        &scratch,
    )
    .unwrap();

    let mut ns = NameService::new();
    side_a.register(&mut ns).unwrap();
    side_b.register(&mut ns).unwrap();
    assert_eq!(ns.entry_count(&REWIRE_NS), 1);

    // The connector runs first: the listener was bound at register time,
    // so its backlog absorbs the connection until the accept below.
    side_b.rewire(&mut ns).unwrap();
    side_a.rewire(&mut ns).unwrap();

    // The original fd numbers now name a live TCP connection.
    let mut new_a = unsafe { TcpStream::from_raw_fd(a_fd) };
    let mut new_b = unsafe { TcpStream::from_raw_fd(b_fd) };
    std::mem::forget(old_a);
    std::mem::forget(old_b);

    new_a.write_all(b"PONG\n").unwrap();
    let mut buf = [0u8; 5];
    new_b.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"PONG\n");

    new_b.write_all(b"PING\n").unwrap();
    new_a.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"PING\n");
}
