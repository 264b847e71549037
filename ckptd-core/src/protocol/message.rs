use anyhow::{Result, anyhow};

use super::{UNIQUE_PID_BYTES, UniquePid, WorkerState};

/// Sentinel every header starts with; anything else on the link is garbage.
pub const MAGIC: [u8; 16] = *b"DMTCP?MAGIC?\0\0\0\0";

/// Namespace discriminator for name-service traffic.
pub type NsId = [u8; 8];

/// Packed size of the fixed header. Payload bytes follow with no padding.
pub const HEADER_BYTES: usize = 144;

/// Headers advertising more payload than this are treated as corrupt.
pub const MAX_EXTRA_BYTES: u32 = 16 * 1024 * 1024;

/// Wire value of `checkpoint_interval` meaning "leave the interval unchanged".
pub const SAME_CKPT_INTERVAL: u32 = u32::MAX;

/// Control message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Null = 0,
    NewWorker = 1,
    RestartWorker = 2,
    Accept = 3,
    RejectNotRestarting = 4,
    RejectWrongComp = 5,
    RejectNotRunning = 6,
    CkptFilename = 7,
    UniqueCkptFilename = 8,
    UserCmd = 9,
    UserCmdResult = 10,
    DoSuspend = 11,
    DoFdLeaderElection = 12,
    DoPreCkptNsRegister = 13,
    DoPreCkptNsQuery = 14,
    DoDrain = 15,
    DoCheckpoint = 16,
    DoRegisterNsData = 17,
    DoSendQueries = 18,
    DoRefill = 19,
    DoResume = 20,
    KillPeer = 21,
    RegisterNsData = 22,
    RegisterNsDataSync = 23,
    RegisterNsDataSyncResponse = 24,
    NsQuery = 25,
    NsQueryResponse = 26,
    NsGetUniqueId = 27,
    NsGetUniqueIdResponse = 28,
    UpdateLogging = 29,
    Ok = 30,
}

impl TryFrom<u32> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u32) -> Result<Self> {
        let msg_type = match value {
            0 => Self::Null,
            1 => Self::NewWorker,
            2 => Self::RestartWorker,
            3 => Self::Accept,
            4 => Self::RejectNotRestarting,
            5 => Self::RejectWrongComp,
            6 => Self::RejectNotRunning,
            7 => Self::CkptFilename,
            8 => Self::UniqueCkptFilename,
            9 => Self::UserCmd,
            10 => Self::UserCmdResult,
            11 => Self::DoSuspend,
            12 => Self::DoFdLeaderElection,
            13 => Self::DoPreCkptNsRegister,
            14 => Self::DoPreCkptNsQuery,
            15 => Self::DoDrain,
            16 => Self::DoCheckpoint,
            17 => Self::DoRegisterNsData,
            18 => Self::DoSendQueries,
            19 => Self::DoRefill,
            20 => Self::DoResume,
            21 => Self::KillPeer,
            22 => Self::RegisterNsData,
            23 => Self::RegisterNsDataSync,
            24 => Self::RegisterNsDataSyncResponse,
            25 => Self::NsQuery,
            26 => Self::NsQueryResponse,
            27 => Self::NsGetUniqueId,
            28 => Self::NsGetUniqueIdResponse,
            29 => Self::UpdateLogging,
            30 => Self::Ok,
            other => return Err(anyhow!("unknown message type: {}", other)),
        };
        Ok(msg_type)
    }
}

/// Operator command codes carried in `coord_cmd` of a `UserCmd` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UserCommand {
    Status = b's' as u32,
    Checkpoint = b'c' as u32,
    SetInterval = b'i' as u32,
    ListPeers = b'l' as u32,
    Kill = b'k' as u32,
}

impl UserCommand {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            x if x == b's' as u32 => Some(UserCommand::Status),
            x if x == b'c' as u32 => Some(UserCommand::Checkpoint),
            x if x == b'i' as u32 => Some(UserCommand::SetInterval),
            x if x == b'l' as u32 => Some(UserCommand::ListPeers),
            x if x == b'k' as u32 => Some(UserCommand::Kill),
            _ => None,
        }
    }
}

/// Result codes carried in `coord_cmd_status` of a `UserCmdResult` message.
pub mod cmd_status {
    pub const NOERROR: i32 = 0;
    pub const ERROR_INVALID_COMMAND: i32 = -1;
    pub const ERROR_NOT_RUNNING_STATE: i32 = -2;
    pub const ERROR_COORDINATOR_NOT_FOUND: i32 = -3;
}

/// Fixed-layout control message. Every field is packed little-endian at a
/// fixed offset so the header is byte-identical on 32- and 64-bit hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub state: WorkerState,
    pub from: UniquePid,
    pub comp_group: UniquePid,
    pub virtual_pid: i32,
    pub real_pid: i32,
    pub nsid: [u8; 8],
    pub key_len: u32,
    pub val_len: u32,
    pub num_peers: u32,
    pub is_running: u32,
    pub coord_cmd: u32,
    pub coord_cmd_status: i32,
    pub coord_timestamp: u64,
    pub checkpoint_interval: u32,
    pub ip_addr: u32,
    pub unique_id_offset: u32,
    pub log_mask: u32,
    pub extra_bytes: u32,
}

impl Message {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            state: WorkerState::Unknown,
            from: UniquePid::default(),
            comp_group: UniquePid::default(),
            virtual_pid: 0,
            real_pid: 0,
            nsid: [0; 8],
            key_len: 0,
            val_len: 0,
            num_peers: 0,
            is_running: 0,
            coord_cmd: 0,
            coord_cmd_status: cmd_status::NOERROR,
            coord_timestamp: 0,
            checkpoint_interval: SAME_CKPT_INTERVAL,
            ip_addr: 0,
            unique_id_offset: 0,
            log_mask: 0,
            extra_bytes: 0,
        }
    }

    /// Zero-fill so a forgotten field can never be read back as valid; a
    /// poisoned message fails [`Message::is_valid`] on both ends.
    pub fn poison(&mut self) {
        *self = Message::new(MessageType::Null);
        self.coord_cmd_status = 0;
        self.checkpoint_interval = 0;
    }

    pub fn encode(&self) -> [u8; HEADER_BYTES] {
        let mut out = [0u8; HEADER_BYTES];
        out[0..16].copy_from_slice(&MAGIC);
        out[16..20].copy_from_slice(&(HEADER_BYTES as u32).to_le_bytes());
        out[20..24].copy_from_slice(&self.extra_bytes.to_le_bytes());
        out[24..28].copy_from_slice(&(self.msg_type as u32).to_le_bytes());
        out[28..32].copy_from_slice(&(self.state as u32).to_le_bytes());
        self.from.pack_into(&mut out[32..32 + UNIQUE_PID_BYTES]);
        self.comp_group.pack_into(&mut out[56..56 + UNIQUE_PID_BYTES]);
        out[80..84].copy_from_slice(&self.virtual_pid.to_le_bytes());
        out[84..88].copy_from_slice(&self.real_pid.to_le_bytes());
        out[88..96].copy_from_slice(&self.nsid);
        out[96..100].copy_from_slice(&self.key_len.to_le_bytes());
        out[100..104].copy_from_slice(&self.val_len.to_le_bytes());
        out[104..108].copy_from_slice(&self.num_peers.to_le_bytes());
        out[108..112].copy_from_slice(&self.is_running.to_le_bytes());
        out[112..116].copy_from_slice(&self.coord_cmd.to_le_bytes());
        out[116..120].copy_from_slice(&self.coord_cmd_status.to_le_bytes());
        out[120..128].copy_from_slice(&self.coord_timestamp.to_le_bytes());
        out[128..132].copy_from_slice(&self.checkpoint_interval.to_le_bytes());
        out[132..136].copy_from_slice(&self.ip_addr.to_le_bytes());
        out[136..140].copy_from_slice(&self.unique_id_offset.to_le_bytes());
        out[140..144].copy_from_slice(&self.log_mask.to_le_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() != HEADER_BYTES {
            return Err(anyhow!("header must be {} bytes, got {}", HEADER_BYTES, raw.len()));
        }
        if raw[0..16] != MAGIC {
            return Err(anyhow!("bad magic in message header"));
        }
        let msg_size = read_u32(raw, 16);
        if msg_size != HEADER_BYTES as u32 {
            return Err(anyhow!("unexpected header size on wire: {}", msg_size));
        }
        let extra_bytes = read_u32(raw, 20);
        if extra_bytes > MAX_EXTRA_BYTES {
            return Err(anyhow!("payload too large: {} bytes", extra_bytes));
        }
        let msg_type = MessageType::try_from(read_u32(raw, 24))?;
        let state = WorkerState::try_from(read_u32(raw, 28))?;

        let mut nsid = [0u8; 8];
        nsid.copy_from_slice(&raw[88..96]);

        Ok(Self {
            msg_type,
            state,
            extra_bytes,
            from: UniquePid::unpack_from(&raw[32..56]),
            comp_group: UniquePid::unpack_from(&raw[56..80]),
            virtual_pid: read_u32(raw, 80) as i32,
            real_pid: read_u32(raw, 84) as i32,
            nsid,
            key_len: read_u32(raw, 96),
            val_len: read_u32(raw, 100),
            num_peers: read_u32(raw, 104),
            is_running: read_u32(raw, 108),
            coord_cmd: read_u32(raw, 112),
            coord_cmd_status: read_u32(raw, 116) as i32,
            coord_timestamp: read_u64(raw, 120),
            checkpoint_interval: read_u32(raw, 128),
            ip_addr: read_u32(raw, 132),
            unique_id_offset: read_u32(raw, 136),
            log_mask: read_u32(raw, 140),
        })
    }

    /// A decoded message is structurally valid; this checks the invariants a
    /// receiver still has to enforce before acting on it.
    pub fn is_valid(&self) -> bool {
        if self.msg_type == MessageType::Null {
            return false;
        }
        if self.msg_type == MessageType::Ok && self.state == WorkerState::Unknown {
            return false;
        }
        true
    }
}

fn read_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(raw[at..at + 4].try_into().expect("4-byte slice"))
}

fn read_u64(raw: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(raw[at..at + 8].try_into().expect("8-byte slice"))
}
