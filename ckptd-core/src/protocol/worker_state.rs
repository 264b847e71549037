use std::fmt;

use anyhow::{Result, anyhow};

/// Barrier stage a worker last reported. Strictly monotonic within one
/// checkpoint cycle; resets to `Running` after the resume broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum WorkerState {
    Unknown = 0,
    Running = 1,
    Suspended = 2,
    FdLeaderElection = 3,
    PreCkptNsRegister = 4,
    PreCkptNsQuery = 5,
    Drained = 6,
    Checkpointed = 7,
    NsDataRegistered = 8,
    DoneQuerying = 9,
    Refilled = 10,
}

impl TryFrom<u32> for WorkerState {
    type Error = anyhow::Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(WorkerState::Unknown),
            1 => Ok(WorkerState::Running),
            2 => Ok(WorkerState::Suspended),
            3 => Ok(WorkerState::FdLeaderElection),
            4 => Ok(WorkerState::PreCkptNsRegister),
            5 => Ok(WorkerState::PreCkptNsQuery),
            6 => Ok(WorkerState::Drained),
            7 => Ok(WorkerState::Checkpointed),
            8 => Ok(WorkerState::NsDataRegistered),
            9 => Ok(WorkerState::DoneQuerying),
            10 => Ok(WorkerState::Refilled),
            other => Err(anyhow!("unknown worker state: {}", other)),
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Unknown => "UNKNOWN",
            WorkerState::Running => "RUNNING",
            WorkerState::Suspended => "SUSPENDED",
            WorkerState::FdLeaderElection => "FD_LEADER_ELECTION",
            WorkerState::PreCkptNsRegister => "PRE_CKPT_NS_REGISTER",
            WorkerState::PreCkptNsQuery => "PRE_CKPT_NS_QUERY",
            WorkerState::Drained => "DRAINED",
            WorkerState::Checkpointed => "CHECKPOINTED",
            WorkerState::NsDataRegistered => "NAME_SERVICE_DATA_REGISTERED",
            WorkerState::DoneQuerying => "DONE_QUERYING",
            WorkerState::Refilled => "REFILLED",
        };
        f.write_str(name)
    }
}
