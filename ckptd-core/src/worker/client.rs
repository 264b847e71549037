use std::net::{IpAddr, TcpStream};

use anyhow::{Context, Result, anyhow, bail};

use crate::link::{recv_message, send_message};
use crate::protocol::{Message, MessageType, NsId, UniquePid, WorkerState};
use crate::resource::NameRegistry;

/// The worker's single blocking, ordered channel to the coordinator.
/// Exactly one logical conversation happens at a time; during a cycle the
/// checkpoint thread is the only speaker.
pub struct CoordinatorChannel {
    stream: TcpStream,
    identity: UniquePid,
    comp_group: UniquePid,
    coord_timestamp: u64,
    num_peers: u32,
}

impl CoordinatorChannel {
    /// Join a running computation as a brand-new worker.
    pub fn connect_new(addr: &str, identity: UniquePid) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("connect to coordinator at {}", addr))?;
        let mut chan = Self {
            stream,
            identity,
            comp_group: UniquePid::default(),
            coord_timestamp: 0,
            num_peers: 0,
        };
        let mut hello = chan.base_msg(MessageType::NewWorker);
        hello.state = WorkerState::Running;
        chan.send(&hello, &[])?;
        chan.finish_handshake()?;
        Ok(chan)
    }

    /// Rejoin a restarting computation group.
    pub fn connect_restart(
        addr: &str,
        identity: UniquePid,
        comp_group: UniquePid,
        num_peers: u32,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("connect to coordinator at {}", addr))?;
        let mut chan = Self {
            stream,
            identity,
            comp_group,
            coord_timestamp: 0,
            num_peers,
        };
        let mut hello = chan.base_msg(MessageType::RestartWorker);
        hello.state = WorkerState::Checkpointed;
        hello.num_peers = num_peers;
        chan.send(&hello, &[])?;
        chan.finish_handshake()?;
        Ok(chan)
    }

    fn finish_handshake(&mut self) -> Result<()> {
        let (reply, _) = recv_message(&mut self.stream)?;
        match reply.msg_type {
            MessageType::Accept => {
                self.comp_group = reply.comp_group;
                self.coord_timestamp = reply.coord_timestamp;
                Ok(())
            }
            MessageType::RejectNotRunning => {
                bail!("coordinator rejected us: a cycle is in progress")
            }
            MessageType::RejectNotRestarting => {
                bail!("coordinator rejected us: no restart in progress")
            }
            MessageType::RejectWrongComp => {
                bail!("coordinator rejected us: wrong computation group")
            }
            other => bail!("unexpected handshake reply: {:?}", other),
        }
    }

    pub fn identity(&self) -> UniquePid {
        self.identity
    }

    pub fn comp_group(&self) -> UniquePid {
        self.comp_group
    }

    pub fn set_comp_group(&mut self, group: UniquePid) {
        self.comp_group = group;
    }

    pub fn coord_timestamp(&self) -> u64 {
        self.coord_timestamp
    }

    pub fn num_peers(&self) -> u32 {
        self.num_peers
    }

    /// Our address as the coordinator sees it; published for rewiring.
    pub fn local_ip(&self) -> Result<IpAddr> {
        Ok(self.stream.local_addr().context("local address of link")?.ip())
    }

    pub fn raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.stream.as_raw_fd()
    }

    pub fn send_ok(&mut self, state: WorkerState) -> Result<()> {
        let mut msg = self.base_msg(MessageType::Ok);
        msg.state = state;
        self.send(&msg, &[])
    }

    pub fn send_ckpt_filename(&mut self, filename: &str) -> Result<()> {
        let msg = self.base_msg(MessageType::CkptFilename);
        self.send(&msg, filename.as_bytes())
    }

    /// Block until the coordinator sends `expected`. Out-of-band messages
    /// are handled in place: a kill means immediate exit with status 0, a
    /// logging update is applied and the wait continues. Anything else at
    /// the wrong time is a protocol violation.
    pub fn await_stage(&mut self, expected: MessageType) -> Result<(Message, Vec<u8>)> {
        loop {
            let (msg, payload) = recv_message(&mut self.stream)?;
            match msg.msg_type {
                MessageType::KillPeer => {
                    tracing::info!("kill requested by coordinator, exiting");
                    std::process::exit(0);
                }
                MessageType::UpdateLogging => {
                    tracing::info!("log mask updated to {:#x}", msg.log_mask);
                    continue;
                }
                t if t == expected => {
                    self.coord_timestamp = msg.coord_timestamp;
                    if msg.num_peers != 0 {
                        self.num_peers = msg.num_peers;
                    }
                    return Ok((msg, payload));
                }
                other => {
                    return Err(anyhow!(
                        "expected {:?} from coordinator, got {:?}",
                        expected,
                        other
                    ));
                }
            }
        }
    }

    fn base_msg(&self, msg_type: MessageType) -> Message {
        let mut msg = Message::new(msg_type);
        msg.from = self.identity;
        msg.comp_group = self.comp_group;
        msg.real_pid = std::process::id() as i32;
        msg.virtual_pid = msg.real_pid;
        msg
    }

    fn send(&mut self, msg: &Message, payload: &[u8]) -> Result<()> {
        send_message(&mut self.stream, msg, payload)
    }

    fn request(&mut self, msg: &Message, payload: &[u8]) -> Result<(Message, Vec<u8>)> {
        self.send(msg, payload)?;
        recv_message(&mut self.stream)
    }
}

impl NameRegistry for CoordinatorChannel {
    fn ns_register(&mut self, nsid: NsId, key: &[u8], value: &[u8], sync: bool) -> Result<()> {
        let mut msg = self.base_msg(if sync {
            MessageType::RegisterNsDataSync
        } else {
            MessageType::RegisterNsData
        });
        msg.nsid = nsid;
        msg.key_len = key.len() as u32;
        msg.val_len = value.len() as u32;
        let mut payload = Vec::with_capacity(key.len() + value.len());
        payload.extend_from_slice(key);
        payload.extend_from_slice(value);
        if sync {
            let (reply, _) = self.request(&msg, &payload)?;
            if reply.msg_type != MessageType::RegisterNsDataSyncResponse {
                bail!("unexpected reply to sync register: {:?}", reply.msg_type);
            }
            Ok(())
        } else {
            self.send(&msg, &payload)
        }
    }

    fn ns_query(&mut self, nsid: NsId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut msg = self.base_msg(MessageType::NsQuery);
        msg.nsid = nsid;
        msg.key_len = key.len() as u32;
        let (reply, payload) = self.request(&msg, key)?;
        if reply.msg_type != MessageType::NsQueryResponse {
            bail!("unexpected reply to query: {:?}", reply.msg_type);
        }
        if reply.val_len == 0 {
            Ok(None)
        } else {
            Ok(Some(payload))
        }
    }

    fn ns_unique_id(&mut self, nsid: NsId, span: u32) -> Result<u64> {
        let mut msg = self.base_msg(MessageType::NsGetUniqueId);
        msg.nsid = nsid;
        msg.unique_id_offset = span;
        let (reply, payload) = self.request(&msg, &[])?;
        if reply.msg_type != MessageType::NsGetUniqueIdResponse || payload.len() != 8 {
            bail!("unexpected reply to unique-id request: {:?}", reply.msg_type);
        }
        Ok(u64::from_le_bytes(payload.try_into().expect("8-byte id")))
    }
}
