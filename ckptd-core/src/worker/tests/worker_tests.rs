use super::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[test]
fn test_coord_host_prefers_primary_over_deprecated() {
    assert_eq!(coord_host_from(Some("a.example"), Some("b.example")), "a.example");
    assert_eq!(coord_host_from(None, Some("b.example")), "b.example");
    assert_eq!(coord_host_from(None, None), "127.0.0.1");
}

#[test]
fn test_coord_port_parsing_and_default() {
    assert_eq!(coord_port_from(Some("7000"), None), 7000);
    assert_eq!(coord_port_from(None, Some("7001")), 7001);
    assert_eq!(coord_port_from(Some("junk"), None), DEFAULT_COORD_PORT);
    assert_eq!(coord_port_from(None, None), DEFAULT_COORD_PORT);
}

#[test]
fn test_ckpt_signal_range_enforced() {
    assert_eq!(ckpt_signal_from(Some("10")), 10);
    assert_eq!(ckpt_signal_from(Some("31")), 31);
    assert_eq!(ckpt_signal_from(Some("0")), DEFAULT_CKPT_SIGNAL);
    assert_eq!(ckpt_signal_from(Some("32")), DEFAULT_CKPT_SIGNAL);
    assert_eq!(ckpt_signal_from(Some("-4")), DEFAULT_CKPT_SIGNAL);
    assert_eq!(ckpt_signal_from(Some("SIGUSR2")), DEFAULT_CKPT_SIGNAL);
    assert_eq!(ckpt_signal_from(None), DEFAULT_CKPT_SIGNAL);
}

#[test]
fn test_quiet_level_clamped() {
    assert_eq!(quiet_level_from(None), 0);
    assert_eq!(quiet_level_from(Some("1")), 1);
    assert_eq!(quiet_level_from(Some("2")), 2);
    assert_eq!(quiet_level_from(Some("9")), 2);
    assert_eq!(quiet_level_from(Some("junk")), 0);
}

#[test]
fn test_tmp_root_precedence() {
    assert_eq!(
        tmp_root_from(Some("/scratch"), Some("/var/tmp")),
        PathBuf::from("/scratch")
    );
    assert_eq!(tmp_root_from(None, Some("/var/tmp")), PathBuf::from("/var/tmp"));
    assert_eq!(tmp_root_from(None, None), PathBuf::from("/tmp"));
}

#[test]
fn test_scratch_dir_layout() {
    let dir = scratch_dir(&PathBuf::from("/tmp"), "alice", "node17");
    assert_eq!(dir, PathBuf::from("/tmp/dmtcp-alice@node17"));
}

#[test]
fn test_wrapper_lock_excludes_ckpt_thread() {
    let sync = Arc::new(ThreadSync::new());

    // Two wrappers may run concurrently.
    let g1 = sync.wrapper_shared().unwrap();
    let g2 = sync.wrapper_shared().unwrap();
    drop(g1);
    drop(g2);

    // With the exclusive side held, a wrapper on another thread blocks
    // until release.
    let guard = sync.ckpt_exclusive();
    let entered = Arc::new(AtomicBool::new(false));
    let waiter = {
        let sync = Arc::clone(&sync);
        let entered = Arc::clone(&entered);
        std::thread::spawn(move || {
            let _g = sync.wrapper_shared().unwrap();
            entered.store(true, Ordering::SeqCst);
        })
    };
    std::thread::sleep(Duration::from_millis(30));
    assert!(!entered.load(Ordering::SeqCst), "wrapper ran during checkpoint");
    drop(guard);
    waiter.join().unwrap();
    assert!(entered.load(Ordering::SeqCst));
}

#[test]
fn test_exit_in_progress_bypasses_wrapper_lock() {
    let sync = ThreadSync::new();
    assert!(sync.wrapper_shared().is_some());
    sync.set_exit_in_progress();
    assert!(sync.exit_in_progress());
    assert!(sync.wrapper_shared().is_none());
}

#[test]
fn test_atfork_hooks_run_in_registration_order() {
    let hooks = AtforkHooks::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for (phase, tag) in [
        (ForkPhase::Child, "virtual-pid"),
        (ForkPhase::Prepare, "lock"),
        (ForkPhase::Child, "wrappers"),
        (ForkPhase::Child, "rejoin"),
    ] {
        let order = Arc::clone(&order);
        hooks.register(phase, Box::new(move || order.lock().unwrap().push(tag)));
    }

    hooks.run(ForkPhase::Child);
    assert_eq!(
        *order.lock().unwrap(),
        vec!["virtual-pid", "wrappers", "rejoin"]
    );

    order.lock().unwrap().clear();
    hooks.run(ForkPhase::Parent);
    assert!(order.lock().unwrap().is_empty());
}

#[test]
fn test_roster_suspends_and_releases_a_thread() {
    ThreadRoster::install_handler(DEFAULT_CKPT_SIGNAL).unwrap();
    let roster = Arc::new(ThreadRoster::new());
    let stop = Arc::new(AtomicBool::new(false));

    let worker = {
        let roster = Arc::clone(&roster);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            roster.register_current();
            while !stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            roster.deregister_current();
        })
    };

    // Give the thread time to register and enter its loop.
    while roster.registered() == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }

    let parked = roster
        .suspend_all(DEFAULT_CKPT_SIGNAL, Duration::from_secs(5))
        .unwrap();
    assert_eq!(parked, 1);

    roster.release_all();
    stop.store(true, Ordering::SeqCst);
    worker.join().unwrap();
    assert_eq!(roster.registered(), 0);
}
