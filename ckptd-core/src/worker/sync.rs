use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use nix::sys::pthread::{Pthread, pthread_kill, pthread_self};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

/// Gate between syscall wrappers and the checkpoint thread.
///
/// Wrappers whose effects must not interleave with a checkpoint (fork, exec,
/// socket calls, setenv) hold the lock shared for the duration of the call;
/// the checkpoint thread holds it exclusively across stages 2-4, so it only
/// proceeds once no application thread is mid-wrapper.
#[derive(Debug, Default)]
pub struct ThreadSync {
    wrapper_lock: RwLock<()>,
    exit_in_progress: AtomicBool,
}

impl ThreadSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a wrapper. Returns `None` once process exit has begun: the
    /// wrapper then proceeds unguarded, since statics may be half torn down.
    pub fn wrapper_shared(&self) -> Option<RwLockReadGuard<'_, ()>> {
        if self.exit_in_progress() {
            return None;
        }
        Some(self.wrapper_lock.read().expect("wrapper lock poisoned"))
    }

    pub fn ckpt_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.wrapper_lock.write().expect("wrapper lock poisoned")
    }

    pub fn set_exit_in_progress(&self) {
        self.exit_in_progress.store(true, Ordering::SeqCst);
    }

    pub fn exit_in_progress(&self) -> bool {
        self.exit_in_progress.load(Ordering::SeqCst)
    }
}

/// Ordered fork hooks. A single registration list replaces scattered
/// `pthread_atfork` chains so the ordering is explicit: virtual-pid reset is
/// registered before wrapper reset, and both before coordinator rejoin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkPhase {
    Prepare,
    Parent,
    Child,
}

#[derive(Default)]
pub struct AtforkHooks {
    hooks: Mutex<Vec<(ForkPhase, Box<dyn Fn() + Send + Sync>)>>,
}

impl AtforkHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, phase: ForkPhase, hook: Box<dyn Fn() + Send + Sync>) {
        self.hooks
            .lock()
            .expect("atfork hooks poisoned")
            .push((phase, hook));
    }

    /// Run the hooks of `phase` in registration order. Callbacks must not
    /// allocate when `phase == Child`.
    pub fn run(&self, phase: ForkPhase) {
        let hooks = self.hooks.lock().expect("atfork hooks poisoned");
        for (p, hook) in hooks.iter() {
            if *p == phase {
                hook();
            }
        }
    }
}

// Parking state shared with the signal handler. The handler may only touch
// these atomics: no allocation, no locks.
static PARKED: AtomicUsize = AtomicUsize::new(0);
static RELEASE: AtomicBool = AtomicBool::new(true);

extern "C" fn park_handler(_sig: libc::c_int) {
    PARKED.fetch_add(1, Ordering::SeqCst);
    let pause = libc::timespec {
        tv_sec: 0,
        tv_nsec: 1_000_000,
    };
    while !RELEASE.load(Ordering::SeqCst) {
        unsafe { libc::nanosleep(&pause, std::ptr::null_mut()) };
    }
    PARKED.fetch_sub(1, Ordering::SeqCst);
}

/// Application threads known to the checkpoint thread. Threads register on
/// creation (via the wrapper layer) and are parked in the checkpoint-signal
/// handler while the process image is written.
#[derive(Default)]
pub struct ThreadRoster {
    threads: Mutex<Vec<Pthread>>,
}

impl ThreadRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_handler(signal: i32) -> Result<()> {
        let signal = Signal::try_from(signal).context("checkpoint signal out of range")?;
        let action = SigAction::new(
            SigHandler::Handler(park_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { sigaction(signal, &action) }.context("install checkpoint signal handler")?;
        Ok(())
    }

    pub fn register_current(&self) {
        self.threads
            .lock()
            .expect("thread roster poisoned")
            .push(pthread_self());
    }

    pub fn deregister_current(&self) {
        let current = pthread_self();
        self.threads
            .lock()
            .expect("thread roster poisoned")
            .retain(|t| *t != current);
    }

    pub fn registered(&self) -> usize {
        self.threads.lock().expect("thread roster poisoned").len()
    }

    pub fn clear(&self) {
        self.threads.lock().expect("thread roster poisoned").clear();
    }

    /// Deliver `signal` to every registered thread and wait until all of
    /// them are parked in the handler.
    pub fn suspend_all(&self, signal: i32, timeout: Duration) -> Result<usize> {
        let threads = self
            .threads
            .lock()
            .expect("thread roster poisoned")
            .clone();
        if threads.is_empty() {
            return Ok(0);
        }
        RELEASE.store(false, Ordering::SeqCst);
        let signal = Signal::try_from(signal).context("checkpoint signal out of range")?;
        for thread in &threads {
            pthread_kill(*thread, signal).context("deliver checkpoint signal")?;
        }
        let deadline = Instant::now() + timeout;
        while PARKED.load(Ordering::SeqCst) < threads.len() {
            if Instant::now() > deadline {
                RELEASE.store(true, Ordering::SeqCst);
                return Err(anyhow!(
                    "only {} of {} thread(s) parked before deadline",
                    PARKED.load(Ordering::SeqCst),
                    threads.len()
                ));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(threads.len())
    }

    /// Release every parked thread and wait for them to leave the handler.
    pub fn release_all(&self) {
        RELEASE.store(true, Ordering::SeqCst);
        while PARKED.load(Ordering::SeqCst) > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
