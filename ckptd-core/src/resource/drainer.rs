use std::io;
use std::os::unix::io::RawFd;

use ahash::AHashMap;
use anyhow::{Context, Result};

use super::ConnectionId;
use super::fdio::{read_exact_fd, read_fd, write_all_fd};

/// Marker both endpoints append when draining; everything read before it is
/// in-flight application data that must survive the checkpoint.
pub const DRAIN_SENTINEL: [u8; 8] = [0xDE, 0xAD, b'D', b'R', b'A', b'I', b'N', 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained(usize),
    /// The peer vanished mid-drain (reset or EOF). The caller replaces the
    /// socket with an unclosed error socket instead of losing the fd slot.
    Disconnected,
}

/// Captures the receive-queue contents of every checkpointed socket at drain
/// time and puts them back at refill time.
#[derive(Debug, Default)]
pub struct KernelBufferDrainer {
    drained: AHashMap<ConnectionId, Vec<u8>>,
    disconnected: Vec<ConnectionId>,
}

impl KernelBufferDrainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain one socket end to end. Fine between two live workers; when one
    /// process owns both endpoints of a pair, use the split
    /// `begin_drain`/`finish_drain` over all sockets instead, or the reads
    /// deadlock waiting for sentinels nobody has sent yet.
    pub fn drain_socket(&mut self, id: ConnectionId, fd: RawFd) -> Result<DrainOutcome> {
        if self.begin_drain(id, fd)? == DrainOutcome::Disconnected {
            return Ok(DrainOutcome::Disconnected);
        }
        self.finish_drain(id, fd)
    }

    /// Write phase of the drain: push our sentinel toward the peer.
    pub fn begin_drain(&mut self, id: ConnectionId, fd: RawFd) -> Result<DrainOutcome> {
        if let Err(err) = write_all_fd(fd, &DRAIN_SENTINEL) {
            if is_disconnect(&err) {
                self.disconnected.push(id);
                return Ok(DrainOutcome::Disconnected);
            }
            return Err(err).context("send drain sentinel");
        }
        Ok(DrainOutcome::Drained(0))
    }

    /// Read phase of the drain: collect application bytes until the peer's
    /// sentinel arrives.
    pub fn finish_drain(&mut self, id: ConnectionId, fd: RawFd) -> Result<DrainOutcome> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(pos) = find_sentinel(&buf) {
                buf.truncate(pos);
                break;
            }
            match read_fd(fd, &mut chunk) {
                Ok(0) => {
                    self.disconnected.push(id);
                    return Ok(DrainOutcome::Disconnected);
                }
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(err) if is_disconnect(&err) => {
                    self.disconnected.push(id);
                    return Ok(DrainOutcome::Disconnected);
                }
                Err(err) => return Err(err).context("drain socket"),
            }
        }

        let drained = buf.len();
        tracing::debug!("drained {} byte(s) from {}", drained, id);
        self.drained.insert(id, buf);
        Ok(DrainOutcome::Drained(drained))
    }

    /// Refill one socket end to end; split as `send_refill`/`finish_refill`
    /// when one process owns both endpoints.
    pub fn refill_socket(&mut self, id: ConnectionId, fd: RawFd) -> Result<()> {
        self.send_refill(id, fd)?;
        self.finish_refill(fd)
    }

    /// Write phase of the refill: frame the data we drained from our own
    /// receive queue and hand it to the peer.
    pub fn send_refill(&mut self, id: ConnectionId, fd: RawFd) -> Result<()> {
        let mine = self.drained.remove(&id).unwrap_or_default();
        write_all_fd(fd, &(mine.len() as u32).to_le_bytes()).context("send refill header")?;
        write_all_fd(fd, &mine).context("send refill data")?;
        Ok(())
    }

    /// Read phase of the refill: take the peer's frame and write its bytes
    /// back raw, leaving them unread. That lands them in the peer's kernel
    /// receive queue, which is exactly where they were drained from.
    pub fn finish_refill(&mut self, fd: RawFd) -> Result<()> {
        let mut len_buf = [0u8; 4];
        read_exact_fd(fd, &mut len_buf).context("read refill header")?;
        let peer_len = u32::from_le_bytes(len_buf) as usize;
        let mut peer_data = vec![0u8; peer_len];
        read_exact_fd(fd, &mut peer_data).context("read refill data")?;
        write_all_fd(fd, &peer_data).context("push peer data back")?;
        Ok(())
    }

    pub fn drained_bytes(&self, id: &ConnectionId) -> Option<&[u8]> {
        self.drained.get(id).map(Vec::as_slice)
    }

    pub fn disconnected(&self) -> &[ConnectionId] {
        &self.disconnected
    }

    pub fn take_disconnected(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.disconnected)
    }
}

fn find_sentinel(buf: &[u8]) -> Option<usize> {
    buf.windows(DRAIN_SENTINEL.len())
        .position(|w| w == DRAIN_SENTINEL)
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}
