use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::registry::NameRegistry;
use super::{CONNECTION_ID_BYTES, ConnectionId};
use crate::protocol::NsId;

/// Namespace the rewirer publishes listen addresses under.
pub const REWIRE_NS: NsId = *b"ckptrwr\0";

/// Socket family of the original connection; the restored socket matches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreDomain {
    Inet,
    Inet6,
    Unix,
}

impl RestoreDomain {
    pub fn from_raw(domain: i32) -> Option<Self> {
        match domain {
            libc::AF_INET => Some(RestoreDomain::Inet),
            libc::AF_INET6 => Some(RestoreDomain::Inet6),
            libc::AF_UNIX => Some(RestoreDomain::Unix),
            _ => None,
        }
    }
}

/// Published rendezvous record: where the listening side can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreAddr {
    pub domain: RestoreDomain,
    pub addr: String,
}

/// One TCP connection endpoint to re-establish at restart.
#[derive(Debug, Clone)]
pub struct RewireEndpoint {
    pub id: ConnectionId,
    pub peer: ConnectionId,
    pub fds: Vec<RawFd>,
    pub domain: RestoreDomain,
}

impl RewireEndpoint {
    /// The endpoint with the smaller identifier listens; the other connects.
    /// Deterministic on both sides without a negotiation round.
    pub fn is_listener(&self) -> bool {
        self.id < self.peer
    }
}

enum RestoreListener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

/// Restart-time socket reconstruction. Built at the register barrier, run at
/// the queries barrier, destroyed when done.
pub struct ConnectionRewirer {
    listeners: Vec<(RestoreDomain, RestoreListener, RestoreAddr)>,
    incoming: Vec<RewireEndpoint>,
    outgoing: Vec<RewireEndpoint>,
}

impl ConnectionRewirer {
    /// Split endpoints into listener/connector sides and bind one listening
    /// socket per needed domain. `advertise_ip` is the address this worker
    /// is reachable at (taken from the coordinator link); Unix sockets land
    /// under `scratch`.
    pub fn open(
        endpoints: Vec<RewireEndpoint>,
        advertise_ip: IpAddr,
        scratch: &Path,
    ) -> Result<Self> {
        let (incoming, outgoing): (Vec<_>, Vec<_>) =
            endpoints.into_iter().partition(RewireEndpoint::is_listener);

        let mut listeners = Vec::new();
        for domain in [RestoreDomain::Inet, RestoreDomain::Inet6, RestoreDomain::Unix] {
            if !incoming.iter().any(|e| e.domain == domain) {
                continue;
            }
            let (listener, addr) = match domain {
                RestoreDomain::Inet => {
                    let l = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
                        .context("bind restore listener")?;
                    let port = l.local_addr()?.port();
                    (
                        RestoreListener::Tcp(l),
                        format!("{}:{}", advertise_ip, port),
                    )
                }
                RestoreDomain::Inet6 => {
                    let l = TcpListener::bind("[::]:0").context("bind restore listener")?;
                    let port = l.local_addr()?.port();
                    (
                        RestoreListener::Tcp(l),
                        format!("[{}]:{}", advertise_ip, port),
                    )
                }
                RestoreDomain::Unix => {
                    let path = scratch.join(format!("rewire-{}", std::process::id()));
                    let _ = std::fs::remove_file(&path);
                    let l = UnixListener::bind(&path).context("bind restore unix listener")?;
                    let addr = path.to_string_lossy().into_owned();
                    (RestoreListener::Unix(l, path), addr)
                }
            };
            listeners.push((domain, listener, RestoreAddr { domain, addr }));
        }

        Ok(Self {
            listeners,
            incoming,
            outgoing,
        })
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing.len()
    }

    /// Publish `{own id -> listen address}` for every connection this side
    /// accepts. Runs at the register barrier, so every address is in the
    /// name service before any peer queries it.
    pub fn register(&self, ns: &mut dyn NameRegistry) -> Result<()> {
        for endpoint in &self.incoming {
            let record = self
                .listeners
                .iter()
                .find(|(d, _, _)| *d == endpoint.domain)
                .map(|(_, _, addr)| addr)
                .ok_or_else(|| anyhow!("no listener for domain {:?}", endpoint.domain))?;
            let value = bincode::serialize(record).context("serialize restore address")?;
            ns.ns_register(REWIRE_NS, &endpoint.id.pack_ordered(), &value, false)?;
        }
        Ok(())
    }

    /// Re-establish every connection and splice the new sockets over the
    /// original fd numbers. Consumes the rewirer; its listeners die here.
    pub fn rewire(mut self, ns: &mut dyn NameRegistry) -> Result<()> {
        // Connect side first: every listener was bound one barrier ago, so
        // connects complete against the backlog without a live accept.
        for endpoint in &self.outgoing {
            let key = endpoint.peer.pack_ordered();
            let value = ns
                .ns_query(REWIRE_NS, &key)?
                .ok_or_else(|| anyhow!("no published address for peer {}", endpoint.peer))?;
            let record: RestoreAddr =
                bincode::deserialize(&value).context("decode restore address")?;
            let fd = match record.domain {
                RestoreDomain::Inet | RestoreDomain::Inet6 => {
                    let stream = TcpStream::connect(record.addr.as_str())
                        .with_context(|| format!("reconnect to {}", record.addr))?;
                    announce(&stream, endpoint.id)?;
                    stream.into_raw_fd()
                }
                RestoreDomain::Unix => {
                    let stream = UnixStream::connect(record.addr.as_str())
                        .with_context(|| format!("reconnect to {}", record.addr))?;
                    announce(&stream, endpoint.id)?;
                    stream.into_raw_fd()
                }
            };
            dup_over(fd, &endpoint.fds)?;
            close_if_spare(fd, &endpoint.fds);
            tracing::debug!("reconnected {} over fds {:?}", endpoint.id, endpoint.fds);
        }

        // Accept side, one domain at a time: match each arrival to its
        // endpoint by the announced connector id.
        for (domain, listener, _) in &self.listeners {
            let mut pending: Vec<RewireEndpoint> = self
                .incoming
                .iter()
                .filter(|e| e.domain == *domain)
                .cloned()
                .collect();
            while !pending.is_empty() {
                let (fd, announced) = match listener {
                    RestoreListener::Tcp(l) => {
                        let (stream, _) = l.accept().context("accept restored connection")?;
                        let announced = read_announcement(&stream)?;
                        (stream.into_raw_fd(), announced)
                    }
                    RestoreListener::Unix(l, _) => {
                        let (stream, _) = l.accept().context("accept restored connection")?;
                        let announced = read_announcement(&stream)?;
                        (stream.into_raw_fd(), announced)
                    }
                };
                let position = pending
                    .iter()
                    .position(|e| e.peer == announced)
                    .ok_or_else(|| anyhow!("unexpected restored connection from {}", announced))?;
                let endpoint = pending.swap_remove(position);
                dup_over(fd, &endpoint.fds)?;
                close_if_spare(fd, &endpoint.fds);
                tracing::debug!("accepted restored connection for {}", endpoint.id);
            }
        }
        self.incoming.clear();

        for (_, listener, _) in &self.listeners {
            if let RestoreListener::Unix(_, path) = listener {
                let _ = std::fs::remove_file(path);
            }
        }
        Ok(())
    }
}

fn announce(mut stream: impl Write, id: ConnectionId) -> Result<()> {
    stream
        .write_all(&id.pack_ordered())
        .context("announce connection id")
}

fn read_announcement(mut stream: impl Read) -> Result<ConnectionId> {
    let mut raw = [0u8; CONNECTION_ID_BYTES];
    stream
        .read_exact(&mut raw)
        .context("read connection id announcement")?;
    Ok(ConnectionId::unpack_ordered(&raw))
}

/// Duplicate `src` over every original fd number, then drop the spare.
fn dup_over(src: RawFd, fds: &[RawFd]) -> Result<()> {
    for &fd in fds {
        if fd != src {
            nix::unistd::dup2(src, fd).context("dup restored socket over original fd")?;
        }
    }
    Ok(())
}

fn close_if_spare(fd: RawFd, fds: &[RawFd]) {
    if !fds.contains(&fd) {
        unsafe { libc::close(fd) };
    }
}
