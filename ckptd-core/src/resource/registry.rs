use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use anyhow::{Context, Result, anyhow};

use super::fdio;
use super::{
    CONNECTION_ID_BYTES, Classified, ClassifiedKind, Connection, ConnectionId, ConnectionKind,
    ConnectionRewirer, DELETED_SUFFIX, DrainOutcome, FileKind, KernelBufferDrainer, PtyKind,
    RestoreDomain, RewireEndpoint, ScanContext, ShmList, TcpState,
};
use crate::protocol::{NsId, UniquePid};

/// Namespace used for shared-resource leader election claims.
pub const ELECTION_NS: NsId = *b"ckptfdl\0";

/// Magic prefix of the in-band peer-id handshake exchanged over each TCP
/// connection right before the image is written.
const HANDSHAKE_MAGIC: [u8; 4] = *b"CKHS";

/// Name-service operations a registry stage can issue. The worker's
/// coordinator channel implements this; tests (and coordinator-less runs)
/// use the in-process [`crate::coordinator::NameService`].
pub trait NameRegistry {
    fn ns_register(&mut self, nsid: NsId, key: &[u8], value: &[u8], sync: bool) -> Result<()>;
    fn ns_query(&mut self, nsid: NsId, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn ns_unique_id(&mut self, nsid: NsId, span: u32) -> Result<u64>;
}

impl NameRegistry for crate::coordinator::NameService {
    fn ns_register(&mut self, nsid: NsId, key: &[u8], value: &[u8], _sync: bool) -> Result<()> {
        self.register(nsid, key.to_vec(), value.to_vec());
        Ok(())
    }

    fn ns_query(&mut self, nsid: NsId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.query(&nsid, key).map(<[u8]>::to_vec))
    }

    fn ns_unique_id(&mut self, nsid: NsId, span: u32) -> Result<u64> {
        Ok(self.get_unique_ids(nsid, span))
    }
}

/// Per-worker registry of every checkpoint-managed open resource.
///
/// Invariant: each managed fd appears in exactly one connection's fd list.
pub struct ResourceRegistry {
    identity: UniquePid,
    next_serial: u32,
    conns: AHashMap<ConnectionId, Connection>,
    fd_map: AHashMap<RawFd, ConnectionId>,
    protected: Vec<RawFd>,
    drainer: KernelBufferDrainer,
    shm: ShmList,
    rewirer: Option<ConnectionRewirer>,
    advertise_ip: IpAddr,
    scratch_dir: PathBuf,
}

impl ResourceRegistry {
    pub fn new(identity: UniquePid, scratch_dir: PathBuf) -> Self {
        Self {
            identity,
            next_serial: 1,
            conns: AHashMap::new(),
            fd_map: AHashMap::new(),
            protected: Vec::new(),
            drainer: KernelBufferDrainer::new(),
            shm: ShmList::new(),
            rewirer: None,
            advertise_ip: IpAddr::from([127, 0, 0, 1]),
            scratch_dir,
        }
    }

    /// Keep the coordinator link (and other internal fds) out of the scan.
    pub fn protect_fd(&mut self, fd: RawFd) {
        if !self.protected.contains(&fd) {
            self.protected.push(fd);
        }
    }

    pub fn set_advertise_ip(&mut self, ip: IpAddr) {
        self.advertise_ip = ip;
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<&Connection> {
        self.conns.get(id)
    }

    pub fn connection_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection> {
        self.conns.get_mut(id)
    }

    pub fn fd_connection(&self, fd: RawFd) -> Option<&Connection> {
        self.fd_map.get(&fd).and_then(|id| self.conns.get(id))
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    fn next_id(&mut self) -> ConnectionId {
        let id = ConnectionId::new(self.identity, self.next_serial);
        self.next_serial += 1;
        id
    }

    /// Enumerate `/proc/self/fd` and synthesize a connection for every fd we
    /// are responsible for. Duplicates (same device and inode) join the
    /// existing connection's fd list.
    pub fn scan(&mut self, ctx: &ScanContext) -> Result<()> {
        let entries = fs::read_dir("/proc/self/fd").context("list /proc/self/fd")?;
        let mut found: Vec<(RawFd, String)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>() else {
                continue;
            };
            let target = fs::read_link(entry.path())
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            found.push((fd, target));
        }

        for (fd, target) in found {
            if self.protected.contains(&fd) || self.fd_map.contains_key(&fd) {
                continue;
            }
            let Ok(st) = fdio::fd_stat(fd) else {
                // The read_dir fd itself is already gone by now.
                continue;
            };
            self.adopt_fd(fd, &target, &st, ctx, true)?;
        }
        Ok(())
    }

    fn adopt_fd(
        &mut self,
        fd: RawFd,
        path: &str,
        st: &libc::stat,
        ctx: &ScanContext,
        pre_existing: bool,
    ) -> Result<()> {
        let classified = super::classify_fd(fd, path, st.st_mode as u32, ctx);
        let Classified::Kind(kind) = classified else {
            tracing::debug!("fd {} ({}) left unmanaged", fd, path);
            return Ok(());
        };

        let dev = st.st_dev as u64;
        let ino = st.st_ino as u64;
        if let Some(existing) = self.conn_by_key(dev, ino) {
            // Same kernel object opened twice: one connection, two fds.
            self.attach_fd(existing, fd);
            return Ok(());
        }

        let kind = match kind {
            ClassifiedKind::Stdio => ConnectionKind::Stdio,
            ClassifiedKind::Fifo => ConnectionKind::Fifo {
                path: PathBuf::from(strip_deleted(path)),
                dev,
                ino,
            },
            ClassifiedKind::Pty { kind } => ConnectionKind::Pty {
                path: PathBuf::from(path),
                dev,
                ino,
                kind,
                termios: None,
            },
            ClassifiedKind::Tcp => {
                let sock_type = fdio::socket_type(fd).unwrap_or(libc::SOCK_STREAM);
                if sock_type == libc::SOCK_RAW {
                    ConnectionKind::Raw { dev, ino }
                } else {
                    ConnectionKind::Tcp {
                        dev,
                        ino,
                        domain: fdio::socket_domain(fd).unwrap_or(libc::AF_INET),
                        peer: None,
                        state: TcpState::Healthy,
                    }
                }
            }
            ClassifiedKind::File { kind, unlinked } => ConnectionKind::File {
                path: PathBuf::from(strip_deleted(path)),
                dev,
                ino,
                kind,
                unlinked,
            },
            ClassifiedKind::Raw => ConnectionKind::Raw { dev, ino },
        };

        let id = self.next_id();
        let mut conn = Connection::new(id, kind, fd);
        // Sockets alive before we attached cannot be reconstructed; unlinked
        // files must be checkpointed or their bytes are gone.
        conn.pre_existing = pre_existing && conn.is_tcp();
        conn.checkpointed = matches!(
            conn.kind,
            ConnectionKind::File {
                unlinked: true, ..
            } | ConnectionKind::File {
                kind: FileKind::Shm,
                ..
            }
        );
        self.fd_map.insert(fd, id);
        self.conns.insert(id, conn);
        Ok(())
    }

    fn healthy_led_sockets(&self) -> Vec<(ConnectionId, RawFd)> {
        self.conns
            .values()
            .filter(|c| c.has_lock && !c.pre_existing)
            .filter(|c| {
                matches!(
                    c.kind,
                    ConnectionKind::Tcp {
                        state: TcpState::Healthy,
                        ..
                    }
                )
            })
            .filter_map(|c| c.first_fd().map(|fd| (c.id, fd)))
            .collect()
    }

    fn mark_socket_error(&mut self, id: ConnectionId) {
        tracing::info!("socket {} disconnected during drain", id);
        if let Some(conn) = self.conns.get_mut(&id) {
            if let ConnectionKind::Tcp { state, .. } = &mut conn.kind {
                *state = TcpState::Error;
            }
        }
    }

    fn conn_by_key(&self, dev: u64, ino: u64) -> Option<ConnectionId> {
        self.conns
            .values()
            .find(|c| c.resource_key() == Some((dev, ino)))
            .map(|c| c.id)
    }

    fn attach_fd(&mut self, id: ConnectionId, fd: RawFd) {
        if let Some(conn) = self.conns.get_mut(&id) {
            if !conn.fds.contains(&fd) {
                conn.fds.push(fd);
            }
            self.fd_map.insert(fd, id);
        }
    }

    /// Wrapper-layer notification: a managed fd was closed.
    pub fn note_close(&mut self, fd: RawFd) {
        if let Some(id) = self.fd_map.remove(&fd) {
            let drop_conn = match self.conns.get_mut(&id) {
                Some(conn) => {
                    conn.fds.retain(|f| *f != fd);
                    conn.fds.is_empty()
                }
                None => false,
            };
            if drop_conn {
                self.conns.remove(&id);
            }
        }
    }

    /// Wrapper-layer notification: `dup(old) -> new`.
    pub fn note_dup(&mut self, old: RawFd, new: RawFd) {
        if old == new {
            return;
        }
        self.note_close(new);
        if let Some(id) = self.fd_map.get(&old).copied() {
            self.attach_fd(id, new);
        }
    }

    /// Wrapper-layer notification: a new fd was opened while running.
    pub fn note_open(&mut self, fd: RawFd, ctx: &ScanContext) -> Result<()> {
        if self.protected.contains(&fd) {
            return Ok(());
        }
        let st = fdio::fd_stat(fd).context("stat newly opened fd")?;
        let path = fs::read_link(format!("/proc/self/fd/{}", fd))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.adopt_fd(fd, &path, &st, ctx, false)
    }

    /// Checkpoint-signal quiescence reached: take over shared memory before
    /// anything else inspects the address space.
    pub fn prepare_ckpt(&mut self) -> Result<()> {
        let identity = self.identity;
        let mut next_serial = self.next_serial;
        let mut new_conns: Vec<Connection> = Vec::new();
        self.shm.prepare(|area| {
            let write = area.prot & libc::PROT_WRITE != 0;
            let file = fs::OpenOptions::new()
                .read(true)
                .write(write)
                .open(&area.path)
                .with_context(|| format!("open shm backing file {}", area.path.display()))?;
            let st = fdio::fd_stat(std::os::unix::io::AsRawFd::as_raw_fd(&file))?;
            let fd = std::os::unix::io::IntoRawFd::into_raw_fd(file);
            let id = ConnectionId::new(identity, next_serial);
            next_serial += 1;
            let mut conn = Connection::new(
                id,
                ConnectionKind::File {
                    path: area.path.clone(),
                    dev: st.st_dev as u64,
                    ino: st.st_ino as u64,
                    kind: FileKind::Shm,
                    unlinked: false,
                },
                fd,
            );
            conn.checkpointed = true;
            new_conns.push(conn);
            Ok(id)
        })?;
        self.next_serial = next_serial;
        for conn in new_conns {
            for fd in &conn.fds {
                self.fd_map.insert(*fd, conn.id);
            }
            self.conns.insert(conn.id, conn);
        }
        Ok(())
    }

    /// Stage `FD_LEADER_ELECTION`: nothing crosses the wire yet; claims are
    /// computed locally and raced through the name service in the two
    /// following stages.
    pub fn leader_election(&mut self) {
        for conn in self.conns.values_mut() {
            // Sole-owner resources keep their lock without a race.
            conn.has_lock = !conn.pre_existing;
        }
    }

    fn election_claims(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut claims = Vec::new();
        for conn in self.conns.values() {
            if conn.pre_existing {
                continue;
            }
            if let Some((dev, ino)) = conn.resource_key() {
                let mut key = Vec::with_capacity(16);
                key.extend_from_slice(&dev.to_be_bytes());
                key.extend_from_slice(&ino.to_be_bytes());
                claims.push((key, conn.id.pack_ordered().to_vec()));
            }
        }
        claims
    }

    /// Stage `PRE_CKPT_NS_REGISTER`: race our claim for every resource that
    /// may be shared with another worker. Smallest claim wins.
    pub fn pre_ckpt_register(&mut self, ns: &mut dyn NameRegistry) -> Result<()> {
        for (key, value) in self.election_claims() {
            ns.ns_register(ELECTION_NS, &key, &value, false)?;
        }
        Ok(())
    }

    /// Stage `PRE_CKPT_NS_QUERY`: find out which claims we won. Losers keep
    /// a back-reference through the shared key instead of writing data.
    pub fn pre_ckpt_query(&mut self, ns: &mut dyn NameRegistry) -> Result<()> {
        let claims = self.election_claims();
        for (key, value) in claims {
            let winner = ns.ns_query(ELECTION_NS, &key)?;
            let won = winner.as_deref() == Some(value.as_slice());
            let raw: [u8; CONNECTION_ID_BYTES] =
                value.as_slice().try_into().expect("claim is a packed id");
            let id = ConnectionId::unpack_ordered(&raw);
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.has_lock = won;
                if !won {
                    tracing::debug!("connection {} lost election", id);
                }
            }
        }
        Ok(())
    }

    /// Stage `DRAIN`: empty the kernel receive queue of every led socket.
    /// A peer that died mid-drain leaves an unclosed error socket behind.
    pub fn drain(&mut self) -> Result<()> {
        // Two phases so a process owning both ends of a pair cannot block
        // on a sentinel it has not sent yet.
        let targets = self.healthy_led_sockets();
        let mut live = Vec::new();
        for (id, fd) in targets {
            match self.drainer.begin_drain(id, fd)? {
                DrainOutcome::Disconnected => self.mark_socket_error(id),
                _ => live.push((id, fd)),
            }
        }
        for (id, fd) in live {
            if self.drainer.finish_drain(id, fd)? == DrainOutcome::Disconnected {
                self.mark_socket_error(id);
            }
        }

        // Terminal attributes are restored at refill.
        for conn in self.conns.values_mut() {
            if let ConnectionKind::Pty { termios, .. } = &mut conn.kind {
                if let Some(fd) = conn.fds.first() {
                    let borrowed = unsafe {
                        std::os::unix::io::BorrowedFd::borrow_raw(*fd)
                    };
                    *termios = nix::sys::termios::tcgetattr(borrowed).ok();
                }
            }
        }
        Ok(())
    }

    /// In-band handshake after drain: each TCP endpoint sends its own id
    /// over the (now empty) socket and learns the peer's. Send everything
    /// first; the handshakes are small enough to sit in kernel buffers.
    pub fn exchange_peer_ids(&mut self) -> Result<()> {
        let targets: Vec<(ConnectionId, RawFd)> = self
            .conns
            .values()
            .filter(|c| c.has_lock)
            .filter(|c| matches!(c.kind, ConnectionKind::Tcp { state: TcpState::Healthy, .. }))
            .filter_map(|c| c.first_fd().map(|fd| (c.id, fd)))
            .collect();

        for (id, fd) in &targets {
            let mut frame = Vec::with_capacity(4 + CONNECTION_ID_BYTES);
            frame.extend_from_slice(&HANDSHAKE_MAGIC);
            frame.extend_from_slice(&id.pack_ordered());
            fdio::write_all_fd(*fd, &frame).context("send peer-id handshake")?;
        }
        for (id, fd) in &targets {
            let mut frame = [0u8; 4 + CONNECTION_ID_BYTES];
            fdio::read_exact_fd(*fd, &mut frame).context("receive peer-id handshake")?;
            if frame[..4] != HANDSHAKE_MAGIC {
                return Err(anyhow!("bad peer-id handshake on {}", id));
            }
            let mut raw = [0u8; CONNECTION_ID_BYTES];
            raw.copy_from_slice(&frame[4..]);
            let peer_id = ConnectionId::unpack_ordered(&raw);
            if let Some(conn) = self.conns.get_mut(id) {
                if let ConnectionKind::Tcp { peer, .. } = &mut conn.kind {
                    *peer = Some(peer_id);
                }
            }
        }
        Ok(())
    }

    /// Stage `CHECKPOINT` metadata: `fd-info.txt` plus byte copies of the
    /// files elected for checkpointing, under `<ckpt_dir>/files/`. Election
    /// losers only emit a back-reference to the winning connection.
    pub fn write_ckpt_metadata(&mut self, ckpt_dir: &Path) -> Result<()> {
        let files_dir = ckpt_dir.join("files");
        fs::create_dir_all(&files_dir)
            .with_context(|| format!("create {}", files_dir.display()))?;

        let mut entries: Vec<(String, PathBuf, bool)> = Vec::new();
        let mut back_refs: Vec<String> = Vec::new();
        for conn in self.conns.values() {
            if !conn.checkpointed {
                continue;
            }
            if let ConnectionKind::File { path, unlinked, .. } = &conn.kind {
                if !conn.has_lock {
                    back_refs.push(format!("@{}:{}", conn.id, path.display()));
                    continue;
                }
                let base = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "unnamed".to_string());
                entries.push((
                    format!("{}_{}", conn.id.serial, base),
                    path.clone(),
                    *unlinked,
                ));
            }
        }
        entries.sort();
        back_refs.sort();

        let mut fd_info = fs::File::create(ckpt_dir.join("fd-info.txt"))
            .context("create fd-info.txt")?;
        for (saved, original, unlinked) in &entries {
            writeln!(fd_info, "{}:{}", saved, original.display()).context("write fd-info.txt")?;
            if *unlinked {
                // No path left to copy from; the image holds the bytes.
                continue;
            }
            let dest = files_dir.join(saved);
            if let Err(err) = fs::copy(original, &dest) {
                tracing::warn!("could not save {}: {}", original.display(), err);
            }
        }
        for line in &back_refs {
            writeln!(fd_info, "{}", line).context("write fd-info.txt")?;
        }
        Ok(())
    }

    /// Stage `REGISTER_NAME_SERVICE_DATA`. On the restart path this opens
    /// the restore listeners and publishes their addresses.
    pub fn register_ns(&mut self, ns: &mut dyn NameRegistry, is_restart: bool) -> Result<()> {
        if !is_restart {
            return Ok(());
        }
        let endpoints = self.rewire_endpoints();
        let rewirer = ConnectionRewirer::open(endpoints, self.advertise_ip, &self.scratch_dir)?;
        rewirer.register(ns)?;
        self.rewirer = Some(rewirer);
        Ok(())
    }

    /// Stage `SEND_QUERIES`. On the restart path this reconnects every TCP
    /// pair and tears the rewirer down.
    pub fn send_queries(&mut self, ns: &mut dyn NameRegistry, is_restart: bool) -> Result<()> {
        if !is_restart {
            return Ok(());
        }
        if let Some(rewirer) = self.rewirer.take() {
            rewirer.rewire(ns)?;
        }
        Ok(())
    }

    fn rewire_endpoints(&self) -> Vec<RewireEndpoint> {
        self.conns
            .values()
            .filter(|c| c.has_lock && !c.pre_existing)
            .filter_map(|c| match &c.kind {
                ConnectionKind::Tcp {
                    domain,
                    peer: Some(peer),
                    state: TcpState::Healthy,
                    ..
                } => RestoreDomain::from_raw(*domain).map(|domain| RewireEndpoint {
                    id: c.id,
                    peer: *peer,
                    fds: c.fds.clone(),
                    domain,
                }),
                _ => None,
            })
            .collect()
    }

    /// Stage `REFILL`: put drained socket bytes back and restore terminal
    /// attributes. On the restart path, recreate deferred shm files first.
    pub fn refill(&mut self, is_restart: bool) -> Result<()> {
        if is_restart {
            self.shm.recreate_missing()?;
        }

        let targets = self.healthy_led_sockets();
        for (id, fd) in &targets {
            self.drainer
                .send_refill(*id, *fd)
                .with_context(|| format!("refill socket {}", id))?;
        }
        for (id, fd) in &targets {
            self.drainer
                .finish_refill(*fd)
                .with_context(|| format!("refill socket {}", id))?;
        }

        for conn in self.conns.values() {
            if let ConnectionKind::Pty {
                termios: Some(termios),
                ..
            } = &conn.kind
            {
                if let Some(fd) = conn.fds.first() {
                    let borrowed = unsafe {
                        std::os::unix::io::BorrowedFd::borrow_raw(*fd)
                    };
                    if let Err(err) = nix::sys::termios::tcsetattr(
                        borrowed,
                        nix::sys::termios::SetArg::TCSANOW,
                        termios,
                    ) {
                        tracing::warn!("restore of terminal attributes failed: {}", err);
                    }
                }
            }
        }
        Ok(())
    }

    /// Stage `RESUME`: remap the blanked shared areas over their file
    /// connections; on restart, drop the recreated backing files.
    pub fn resume(&mut self, is_restart: bool) -> Result<()> {
        let conns = &self.conns;
        let consumed = self
            .shm
            .remap_blanked(|id| conns.get(id).and_then(Connection::first_fd))?;
        for (_id, fd) in consumed {
            unsafe { libc::close(fd) };
            self.note_close(fd);
        }
        if is_restart {
            self.shm.unlink_recreated();
        }
        Ok(())
    }

    /// Restart entry point, before rejoining the coordinator: reopen
    /// controlling terminals nobody was elected for and sort the unlinked
    /// shm areas into mappable and deferred.
    pub fn post_restart(&mut self) -> Result<()> {
        for conn in self.conns.values_mut() {
            if conn.has_lock {
                continue;
            }
            if let ConnectionKind::Pty {
                path,
                kind: PtyKind::Ctty | PtyKind::ParentCtty,
                ..
            } = &conn.kind
            {
                match fs::OpenOptions::new().read(true).write(true).open(path) {
                    Ok(file) => {
                        let new_fd = std::os::unix::io::IntoRawFd::into_raw_fd(file);
                        for fd in &conn.fds {
                            if *fd != new_fd {
                                nix::unistd::dup2(new_fd, *fd)
                                    .context("dup reopened terminal over original fd")?;
                            }
                        }
                        if !conn.fds.contains(&new_fd) {
                            unsafe { libc::close(new_fd) };
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            "could not reopen terminal {}: {}",
                            path.display(),
                            err
                        );
                    }
                }
            }
        }
        self.shm.restore_or_defer()
    }

    pub fn shm_mut(&mut self) -> &mut ShmList {
        &mut self.shm
    }

    pub fn drainer(&self) -> &KernelBufferDrainer {
        &self.drainer
    }

    /// Test/wrapper seam: adopt a connection record directly.
    pub fn insert_connection(&mut self, kind: ConnectionKind, fds: Vec<RawFd>) -> ConnectionId {
        let id = self.next_id();
        let mut conn = Connection::new(id, kind, fds[0]);
        conn.fds = fds.clone();
        for fd in fds {
            self.fd_map.insert(fd, id);
        }
        self.conns.insert(id, conn);
        id
    }
}

fn strip_deleted(path: &str) -> &str {
    path.strip_suffix(DELETED_SUFFIX).unwrap_or(path)
}
