use super::*;

fn shared_entry(path: &str) -> MapsEntry {
    MapsEntry {
        start: 0x7f00_0000_0000,
        end: 0x7f00_0000_4000,
        prot: libc::PROT_READ | libc::PROT_WRITE,
        shared: true,
        offset: 0,
        inode: 1234,
        path: path.to_string(),
    }
}

#[test]
fn test_parse_maps_line_shared_file() {
    let line = "7f2b4c000000-7f2b4c021000 rw-s 00001000 08:01 1048600 /tmp/shm.X";
    let entry = parse_maps_line(line).unwrap();
    assert_eq!(entry.start, 0x7f2b4c000000);
    assert_eq!(entry.end, 0x7f2b4c021000);
    assert_eq!(entry.prot, libc::PROT_READ | libc::PROT_WRITE);
    assert!(entry.shared);
    assert_eq!(entry.offset, 0x1000);
    assert_eq!(entry.inode, 1048600);
    assert_eq!(entry.path, "/tmp/shm.X");
}

#[test]
fn test_parse_maps_line_keeps_spaces_and_deleted_suffix() {
    let line = "00400000-00452000 r-xp 00000000 08:02 173521 /tmp/my file (deleted)";
    let entry = parse_maps_line(line).unwrap();
    assert!(!entry.shared);
    assert_eq!(entry.path, "/tmp/my file (deleted)");
}

#[test]
fn test_parse_maps_line_anonymous_region() {
    let line = "7ffc7a521000-7ffc7a542000 rw-p 00000000 00:00 0";
    let entry = parse_maps_line(line).unwrap();
    assert_eq!(entry.path, "");
    assert_eq!(entry.inode, 0);
}

#[test]
fn test_parse_maps_line_garbage() {
    assert!(parse_maps_line("not a maps line").is_none());
    assert!(parse_maps_line("").is_none());
}

#[test]
fn test_private_and_protless_regions_ignored() {
    let mut entry = shared_entry("/tmp/shm.X");
    entry.shared = false;
    assert_eq!(classify_shm_entry(&entry, true, true), ShmDisposition::Ignore);

    let mut entry = shared_entry("/tmp/shm.X");
    entry.prot = 0;
    assert_eq!(classify_shm_entry(&entry, true, true), ShmDisposition::Ignore);
}

#[test]
fn test_unmanaged_regions_ignored() {
    for path in [
        "/dev/shm/ckptd-shared-area",
        "/SYSV00000000",
        "/var/run/nscd/passwd",
        "/dev/infiniband/uverbs0",
    ] {
        assert_eq!(
            classify_shm_entry(&shared_entry(path), true, true),
            ShmDisposition::Ignore,
            "path {path} must be left alone"
        );
    }
}

#[test]
fn test_existing_writable_file_is_checkpointed() {
    let entry = shared_entry("/tmp/shm.X");
    match classify_shm_entry(&entry, true, true) {
        ShmDisposition::Checkpoint(area) => {
            assert_eq!(area.len, 0x4000);
            assert_eq!(area.path.to_str(), Some("/tmp/shm.X"));
            assert!(!area.unlinked);
        }
        other => panic!("expected checkpoint disposition, got {:?}", other),
    }
}

#[test]
fn test_readonly_backing_file_is_ignored() {
    let entry = shared_entry("/usr/share/locale-archive");
    assert_eq!(classify_shm_entry(&entry, true, false), ShmDisposition::Ignore);
}

#[test]
fn test_unlinked_file_queued_for_recreation_with_clean_path() {
    let entry = shared_entry("/tmp/shm.gone (deleted)");
    match classify_shm_entry(&entry, false, false) {
        ShmDisposition::RecreateAtRestart(area) => {
            assert_eq!(area.path.to_str(), Some("/tmp/shm.gone"));
            assert!(area.unlinked);
        }
        other => panic!("expected recreate disposition, got {:?}", other),
    }
}

#[test]
fn test_unlinked_dev_zero_is_not_recreatable() {
    let entry = shared_entry("/dev/zero (deleted)");
    assert_eq!(classify_shm_entry(&entry, false, false), ShmDisposition::Ignore);
    let entry = shared_entry("/dev/null (deleted)");
    assert_eq!(classify_shm_entry(&entry, false, false), ShmDisposition::Ignore);
}
