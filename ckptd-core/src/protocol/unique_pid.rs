use std::fmt;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Packed size of a [`UniquePid`] inside a wire header.
pub const UNIQUE_PID_BYTES: usize = 24;

/// Identity of a process across the cluster and across restarts.
///
/// The same triple also names a computation group: the group id is the
/// `UniquePid` of the root of the process tree. The derived ordering is
/// lexicographic over (host_id, pid, start_ns, generation), which gives the
/// total order used for tie-breaks in leader election.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UniquePid {
    pub host_id: u64,
    pub pid: i32,
    pub start_ns: i64,
    pub generation: i32,
}

impl UniquePid {
    pub fn new(host_id: u64, pid: i32, start_ns: i64) -> Self {
        Self {
            host_id,
            pid,
            start_ns,
            generation: 0,
        }
    }

    /// Identity of the calling process, computed once per process.
    pub fn this_process() -> Self {
        static THIS: OnceLock<UniquePid> = OnceLock::new();
        *THIS.get_or_init(|| {
            let host_id = unsafe { libc::gethostid() } as u64;
            let start_ns = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0);
            Self::new(host_id, std::process::id() as i32, start_ns)
        })
    }

    /// The all-zero identity used before a worker has been admitted.
    pub fn is_null(&self) -> bool {
        *self == Self::default()
    }

    pub fn pack_into(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.host_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.pid.to_le_bytes());
        out[12..20].copy_from_slice(&self.start_ns.to_le_bytes());
        out[20..24].copy_from_slice(&self.generation.to_le_bytes());
    }

    pub fn unpack_from(raw: &[u8]) -> Self {
        Self {
            host_id: u64::from_le_bytes(raw[0..8].try_into().expect("8-byte slice")),
            pid: i32::from_le_bytes(raw[8..12].try_into().expect("4-byte slice")),
            start_ns: i64::from_le_bytes(raw[12..20].try_into().expect("8-byte slice")),
            generation: i32::from_le_bytes(raw[20..24].try_into().expect("4-byte slice")),
        }
    }

    /// Big-endian packing whose byte-wise lexicographic order equals the
    /// derived field order. Used for name-service election keys.
    pub fn pack_ordered(&self) -> [u8; UNIQUE_PID_BYTES] {
        let mut out = [0u8; UNIQUE_PID_BYTES];
        out[0..8].copy_from_slice(&self.host_id.to_be_bytes());
        out[8..12].copy_from_slice(&self.pid.to_be_bytes());
        out[12..20].copy_from_slice(&self.start_ns.to_be_bytes());
        out[20..24].copy_from_slice(&self.generation.to_be_bytes());
        out
    }

    pub fn unpack_ordered(raw: &[u8]) -> Self {
        Self {
            host_id: u64::from_be_bytes(raw[0..8].try_into().expect("8-byte slice")),
            pid: i32::from_be_bytes(raw[8..12].try_into().expect("4-byte slice")),
            start_ns: i64::from_be_bytes(raw[12..20].try_into().expect("8-byte slice")),
            generation: i32::from_be_bytes(raw[20..24].try_into().expect("4-byte slice")),
        }
    }
}

impl fmt::Display for UniquePid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}-{}-{:x}",
            self.host_id, self.pid, self.start_ns as u64
        )
    }
}
