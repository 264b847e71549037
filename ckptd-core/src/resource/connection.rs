use std::fmt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::protocol::{UNIQUE_PID_BYTES, UniquePid};

/// Globally unique name for one open kernel resource, assigned by the worker
/// that first saw it. The derived order (owner first, then serial) is the
/// election order for shared resources.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ConnectionId {
    pub upid: UniquePid,
    pub serial: u32,
}

/// Packed size of [`ConnectionId::pack_ordered`].
pub const CONNECTION_ID_BYTES: usize = UNIQUE_PID_BYTES + 4;

impl ConnectionId {
    pub fn new(upid: UniquePid, serial: u32) -> Self {
        Self { upid, serial }
    }

    /// Big-endian packing whose byte order equals the derived order, so the
    /// name service's smallest-value rule elects the lowest id.
    pub fn pack_ordered(&self) -> [u8; CONNECTION_ID_BYTES] {
        let mut out = [0u8; CONNECTION_ID_BYTES];
        out[..UNIQUE_PID_BYTES].copy_from_slice(&self.upid.pack_ordered());
        out[UNIQUE_PID_BYTES..].copy_from_slice(&self.serial.to_be_bytes());
        out
    }

    pub fn unpack_ordered(raw: &[u8; CONNECTION_ID_BYTES]) -> Self {
        Self {
            upid: UniquePid::unpack_ordered(&raw[..UNIQUE_PID_BYTES]),
            serial: u32::from_be_bytes(raw[UNIQUE_PID_BYTES..].try_into().expect("4-byte slice")),
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.upid, self.serial)
    }
}

/// PTY flavor, decided from the device path at discovery time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyKind {
    DevTty,
    Master,
    Slave,
    BsdMaster,
    BsdSlave,
    /// Controlling terminal inherited from outside the computation.
    Ctty,
    /// Parent's controlling terminal.
    ParentCtty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    /// Backing file of a `MAP_SHARED` region.
    Shm,
    /// Batch-queue scratch file (SLURM and friends).
    BatchQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Healthy,
    /// Peer vanished mid-drain; the fd was replaced by an unclosed error
    /// socket and is excluded from refill and rewiring.
    Error,
}

/// Kind-specific state of a connection. A tagged variant with per-kind
/// handling replaces a class hierarchy: dispatch happens by `match`.
#[derive(Debug, Clone)]
pub enum ConnectionKind {
    File {
        path: PathBuf,
        dev: u64,
        ino: u64,
        kind: FileKind,
        unlinked: bool,
    },
    Fifo {
        path: PathBuf,
        dev: u64,
        ino: u64,
    },
    Pty {
        path: PathBuf,
        dev: u64,
        ino: u64,
        kind: PtyKind,
        termios: Option<nix::sys::termios::Termios>,
    },
    Tcp {
        dev: u64,
        ino: u64,
        domain: i32,
        peer: Option<ConnectionId>,
        state: TcpState,
    },
    Raw {
        dev: u64,
        ino: u64,
    },
    Stdio,
}

/// One open OS resource and every fd naming it in this process.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub kind: ConnectionKind,
    pub fds: Vec<RawFd>,
    pub has_lock: bool,
    pub pre_existing: bool,
    pub checkpointed: bool,
}

impl Connection {
    pub fn new(id: ConnectionId, kind: ConnectionKind, fd: RawFd) -> Self {
        Self {
            id,
            kind,
            fds: vec![fd],
            has_lock: false,
            pre_existing: false,
            checkpointed: false,
        }
    }

    /// Identity of the underlying kernel object, for duplicate detection and
    /// cross-worker leader election. Terminals share their device identity
    /// across every process holding them, so they race like files do. Stdio
    /// has none: it is never shared state worth electing over.
    pub fn resource_key(&self) -> Option<(u64, u64)> {
        match &self.kind {
            ConnectionKind::File { dev, ino, .. }
            | ConnectionKind::Fifo { dev, ino, .. }
            | ConnectionKind::Pty { dev, ino, .. }
            | ConnectionKind::Tcp { dev, ino, .. }
            | ConnectionKind::Raw { dev, ino } => Some((*dev, *ino)),
            ConnectionKind::Stdio => None,
        }
    }

    pub fn first_fd(&self) -> Option<RawFd> {
        self.fds.first().copied()
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self.kind, ConnectionKind::Tcp { .. })
    }
}

/// What discovery decided about one scanned fd.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// Benign inherited fd; leave it alone.
    Skip,
    Kind(ClassifiedKind),
}

/// `ConnectionKind` minus the runtime-only fields, so classification stays a
/// pure function of path and stat data.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedKind {
    File { kind: FileKind, unlinked: bool },
    Fifo,
    Pty { kind: PtyKind },
    Tcp,
    Raw,
    Stdio,
}

/// Facts about the environment the scan runs in.
#[derive(Debug, Clone, Default)]
pub struct ScanContext {
    pub ctty: Option<String>,
    pub parent_ctty: Option<String>,
    pub under_pbs: bool,
    pub under_slurm: bool,
}

/// Suffix the kernel appends in `/proc/*/fd` and `/proc/*/maps` for paths
/// whose file was unlinked.
pub const DELETED_SUFFIX: &str = " (deleted)";

/// Classify one fd from its `/proc/self/fd` link target and stat mode.
pub fn classify_fd(fd: RawFd, path: &str, mode: u32, ctx: &ScanContext) -> Classified {
    let fmt = mode & libc::S_IFMT;

    if fd <= 2 {
        return Classified::Kind(ClassifiedKind::Stdio);
    }
    if ctx.under_pbs && path.starts_with("/proc") && path.ends_with("environ") {
        // Batch launchers leak their /proc/<pid>/environ fd into jobs.
        return Classified::Skip;
    }
    if path.starts_with("socket:") {
        if ctx.under_slurm {
            return Classified::Skip;
        }
        return Classified::Kind(ClassifiedKind::Tcp);
    }
    if path.starts_with("pipe:") || fmt == libc::S_IFIFO {
        return Classified::Kind(ClassifiedKind::Fifo);
    }

    if path == "/dev/tty" {
        return Classified::Kind(ClassifiedKind::Pty { kind: PtyKind::DevTty });
    }
    if path == "/dev/ptmx" || path == "/dev/pts/ptmx" {
        return Classified::Kind(ClassifiedKind::Pty {
            kind: PtyKind::Master,
        });
    }
    if path.starts_with("/dev/pts/") {
        let kind = if ctx.parent_ctty.as_deref() == Some(path) {
            PtyKind::ParentCtty
        } else if ctx.ctty.as_deref() == Some(path) {
            PtyKind::Ctty
        } else {
            PtyKind::Slave
        };
        return Classified::Kind(ClassifiedKind::Pty { kind });
    }
    if path.starts_with("/dev/pty") {
        return Classified::Kind(ClassifiedKind::Pty {
            kind: PtyKind::BsdMaster,
        });
    }
    if path.starts_with("/dev/tty") {
        return Classified::Kind(ClassifiedKind::Pty {
            kind: PtyKind::BsdSlave,
        });
    }

    let unlinked = path.ends_with(DELETED_SUFFIX);
    if fmt == libc::S_IFREG || fmt == libc::S_IFCHR || fmt == libc::S_IFBLK || fmt == libc::S_IFDIR
    {
        return Classified::Kind(ClassifiedKind::File {
            kind: FileKind::Regular,
            unlinked,
        });
    }
    if fmt == libc::S_IFSOCK {
        return Classified::Kind(ClassifiedKind::Tcp);
    }

    Classified::Skip
}
