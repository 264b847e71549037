use super::*;
use crate::coordinator::NameService;
use crate::protocol::UniquePid;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("ckptd-{prefix}-{}-{nanos}", std::process::id()))
}

fn registry_for(pid: i32) -> ResourceRegistry {
    ResourceRegistry::new(UniquePid::new(1, pid, 1000), std::env::temp_dir())
}

fn file_kind(path: &str, dev: u64, ino: u64) -> ConnectionKind {
    ConnectionKind::File {
        path: PathBuf::from(path),
        dev,
        ino,
        kind: FileKind::Regular,
        unlinked: false,
    }
}

#[test]
fn test_scan_adopts_an_open_file() {
    let dir = unique_temp_dir("scan");
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("held-open.txt");
    let file = fs::File::create(&path).unwrap();
    let fd = std::os::unix::io::AsRawFd::as_raw_fd(&file);

    let mut registry = registry_for(1);
    registry.scan(&ScanContext::default()).unwrap();

    let conn = registry.fd_connection(fd).expect("open file not adopted");
    match &conn.kind {
        ConnectionKind::File { path: seen, .. } => {
            assert_eq!(seen, &path);
        }
        other => panic!("expected file connection, got {:?}", other),
    }

    drop(file);
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_duplicate_fds_share_one_connection() {
    let mut registry = registry_for(1);
    let id = registry.insert_connection(file_kind("/tmp/shared", 8, 77), vec![10]);
    registry.note_dup(10, 11);

    let conn = registry.connection(&id).unwrap();
    assert_eq!(conn.fds, vec![10, 11]);
    assert_eq!(registry.fd_connection(11).unwrap().id, id);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_close_of_last_fd_drops_the_connection() {
    let mut registry = registry_for(1);
    let id = registry.insert_connection(file_kind("/tmp/f", 8, 1), vec![10]);
    registry.note_dup(10, 11);

    registry.note_close(10);
    assert!(registry.connection(&id).is_some());
    registry.note_close(11);
    assert!(registry.connection(&id).is_none());
    assert!(registry.is_empty());
}

#[test]
fn test_leader_election_smallest_id_wins() {
    // Two workers share one kernel object (same device and inode).
    let mut low = registry_for(1);
    let mut high = registry_for(2);
    let low_id = low.insert_connection(file_kind("/tmp/shared", 8, 500), vec![20]);
    let high_id = high.insert_connection(file_kind("/tmp/shared", 8, 500), vec![21]);

    low.leader_election();
    high.leader_election();

    let mut ns = NameService::new();
    low.pre_ckpt_register(&mut ns).unwrap();
    high.pre_ckpt_register(&mut ns).unwrap();
    low.pre_ckpt_query(&mut ns).unwrap();
    high.pre_ckpt_query(&mut ns).unwrap();

    assert!(low.connection(&low_id).unwrap().has_lock);
    assert!(!high.connection(&high_id).unwrap().has_lock);
}

#[test]
fn test_unshared_resources_keep_their_lock() {
    let mut registry = registry_for(1);
    let id = registry.insert_connection(file_kind("/tmp/mine", 8, 501), vec![20]);

    registry.leader_election();
    let mut ns = NameService::new();
    registry.pre_ckpt_register(&mut ns).unwrap();
    registry.pre_ckpt_query(&mut ns).unwrap();

    assert!(registry.connection(&id).unwrap().has_lock);
}

#[test]
fn test_ckpt_metadata_lists_and_copies_files() {
    let work = unique_temp_dir("meta");
    fs::create_dir_all(&work).unwrap();
    let source = work.join("precious.db");
    let mut f = fs::File::create(&source).unwrap();
    f.write_all(b"contents").unwrap();
    drop(f);

    let mut registry = registry_for(1);
    let id = registry.insert_connection(
        file_kind(source.to_str().unwrap(), 8, 600),
        vec![30],
    );
    {
        let conn = registry.connection_mut(&id).unwrap();
        conn.has_lock = true;
        conn.checkpointed = true;
    }
    // An unelected checkpointed file only leaves a back-reference; an
    // unmarked one leaves nothing.
    let lost = registry.insert_connection(file_kind("/tmp/shared.db", 8, 601), vec![31]);
    registry.connection_mut(&lost).unwrap().checkpointed = true;
    registry.insert_connection(file_kind("/tmp/other", 8, 602), vec![32]);

    let ckpt_dir = work.join("out");
    fs::create_dir_all(&ckpt_dir).unwrap();
    registry.write_ckpt_metadata(&ckpt_dir).unwrap();

    let fd_info = fs::read_to_string(ckpt_dir.join("fd-info.txt")).unwrap();
    let serial = id.serial;
    let lost_id = registry.connection(&lost).unwrap().id;
    assert_eq!(
        fd_info,
        format!(
            "{}_precious.db:{}\n@{}:/tmp/shared.db\n",
            serial,
            source.display(),
            lost_id
        )
    );
    let copied = ckpt_dir.join("files").join(format!("{}_precious.db", serial));
    assert_eq!(fs::read(copied).unwrap(), b"contents");

    fs::remove_dir_all(&work).unwrap();
}

fn ctty_kind(path: &std::path::Path, dev: u64, ino: u64) -> ConnectionKind {
    ConnectionKind::Pty {
        path: path.to_path_buf(),
        dev,
        ino,
        kind: PtyKind::Ctty,
        termios: None,
    }
}

#[test]
fn test_ctty_election_loser_reopens_locally_at_restart() {
    // Two workers inherit the same controlling terminal. Exactly one wins
    // the lock; the loser reopens the terminal locally at restart.
    let work = unique_temp_dir("ctty");
    fs::create_dir_all(&work).unwrap();
    let term = work.join("tty-stand-in");
    fs::write(&term, b"").unwrap();

    let mut low = registry_for(1);
    let mut high = registry_for(2);
    let low_id = low.insert_connection(ctty_kind(&term, 5, 700), vec![90]);
    // The loser holds a real fd that the reopen must splice over.
    let held = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&term)
        .unwrap();
    let held_fd = std::os::unix::io::AsRawFd::as_raw_fd(&held);
    let high_id = high.insert_connection(ctty_kind(&term, 5, 700), vec![held_fd]);

    low.leader_election();
    high.leader_election();
    let mut ns = NameService::new();
    low.pre_ckpt_register(&mut ns).unwrap();
    high.pre_ckpt_register(&mut ns).unwrap();
    low.pre_ckpt_query(&mut ns).unwrap();
    high.pre_ckpt_query(&mut ns).unwrap();

    assert!(low.connection(&low_id).unwrap().has_lock);
    assert!(!high.connection(&high_id).unwrap().has_lock);

    // The winner skips the reopen; the loser walks it, splicing a fresh
    // description over its original fd number.
    low.post_restart().unwrap();
    high.post_restart().unwrap();

    let mut reopened = unsafe {
        <fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(held_fd)
    };
    reopened.write_all(b"alive").unwrap();
    std::mem::forget(reopened);
    drop(held);

    fs::remove_dir_all(&work).unwrap();
}

#[test]
fn test_pre_existing_sockets_never_take_the_lock() {
    let mut registry = registry_for(1);
    let id = registry.insert_connection(
        ConnectionKind::Tcp {
            dev: 0,
            ino: 9000,
            domain: libc::AF_INET,
            peer: None,
            state: TcpState::Healthy,
        },
        vec![40],
    );
    registry.connection_mut(&id).unwrap().pre_existing = true;

    registry.leader_election();
    let mut ns = NameService::new();
    registry.pre_ckpt_register(&mut ns).unwrap();
    registry.pre_ckpt_query(&mut ns).unwrap();
    assert!(!registry.connection(&id).unwrap().has_lock);
}
