use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::{ConnectionId, DELETED_SUFFIX};

/// One `MAP_SHARED` mapping worth checkpointing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmArea {
    pub addr: usize,
    pub len: usize,
    pub prot: i32,
    pub flags: i32,
    pub offset: u64,
    pub path: PathBuf,
    pub unlinked: bool,
}

/// One parsed line of `/proc/self/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapsEntry {
    pub start: usize,
    pub end: usize,
    pub prot: i32,
    pub shared: bool,
    pub offset: u64,
    pub inode: u64,
    pub path: String,
}

pub fn parse_maps_line(line: &str) -> Option<MapsEntry> {
    let mut parts = line.splitn(6, ' ');
    let range = parts.next()?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let inode = parts.next()?;
    let path = parts.next().unwrap_or("").trim_start();

    let (start, end) = range.split_once('-')?;
    let perms = perms.as_bytes();
    if perms.len() < 4 {
        return None;
    }
    let mut prot = 0;
    if perms[0] == b'r' {
        prot |= libc::PROT_READ;
    }
    if perms[1] == b'w' {
        prot |= libc::PROT_WRITE;
    }
    if perms[2] == b'x' {
        prot |= libc::PROT_EXEC;
    }

    Some(MapsEntry {
        start: usize::from_str_radix(start, 16).ok()?,
        end: usize::from_str_radix(end, 16).ok()?,
        prot,
        shared: perms[3] == b's',
        offset: u64::from_str_radix(offset, 16).ok()?,
        inode: inode.parse().ok()?,
        path: path.to_string(),
    })
}

/// Regions the checkpoint must leave alone: our own scratch, SysV segments,
/// InfiniBand and nscd caches.
pub fn is_unmanaged_region(path: &str) -> bool {
    path.contains("ckptd-shared")
        || path.contains("synchronization-log")
        || path.contains("infiniband")
        || path.starts_with("/SYSV")
        || path.starts_with("/var/run/nscd")
        || path.starts_with("/var/cache/nscd")
        || path.starts_with("/var/db/nscd")
}

/// Whether a `MAP_SHARED` maps entry is ours to handle, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShmDisposition {
    Ignore,
    /// Backing file on disk and writable: checkpoint through a file
    /// connection, blank the mapping, remap at resume.
    Checkpoint(ShmArea),
    /// Backing file unlinked: recreate it at restart.
    RecreateAtRestart(ShmArea),
}

/// Pure classification of one maps entry; the caller checks file existence
/// and writability so this stays testable.
pub fn classify_shm_entry(entry: &MapsEntry, exists: bool, writable: bool) -> ShmDisposition {
    if !entry.shared || entry.prot == 0 || is_unmanaged_region(&entry.path) {
        return ShmDisposition::Ignore;
    }
    if entry.path.is_empty() || entry.inode == 0 {
        return ShmDisposition::Ignore;
    }

    let unlinked = entry.path.ends_with(DELETED_SUFFIX);
    if unlinked {
        let bare = entry.path[..entry.path.len() - DELETED_SUFFIX.len()].to_string();
        if bare.starts_with("/dev/zero") || bare.starts_with("/dev/null") {
            // Anonymous shared memory is not recreatable from a path.
            return ShmDisposition::Ignore;
        }
        return ShmDisposition::RecreateAtRestart(ShmArea {
            addr: entry.start,
            len: entry.end - entry.start,
            prot: entry.prot,
            flags: libc::MAP_SHARED,
            offset: entry.offset,
            path: PathBuf::from(bare),
            unlinked: true,
        });
    }

    if exists && writable {
        return ShmDisposition::Checkpoint(ShmArea {
            addr: entry.start,
            len: entry.end - entry.start,
            prot: entry.prot,
            flags: libc::MAP_SHARED,
            offset: entry.offset,
            path: PathBuf::from(entry.path.clone()),
            unlinked: false,
        });
    }

    ShmDisposition::Ignore
}

/// Shared-memory areas of this worker across one checkpoint/restart.
#[derive(Debug, Default)]
pub struct ShmList {
    blanked: Vec<(ShmArea, ConnectionId)>,
    unlinked: Vec<ShmArea>,
    missing: Vec<ShmArea>,
    recreated: Vec<PathBuf>,
}

impl ShmList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blanked_count(&self) -> usize {
        self.blanked.len()
    }

    pub fn unlinked_areas(&self) -> &[ShmArea] {
        &self.unlinked
    }

    /// Walk `/proc/self/maps` and take over every eligible `MAP_SHARED`
    /// region. `register` opens the backing file and returns the file
    /// connection now responsible for its bytes.
    pub fn prepare(
        &mut self,
        mut register: impl FnMut(&ShmArea) -> Result<ConnectionId>,
    ) -> Result<()> {
        self.blanked.clear();
        self.unlinked.clear();
        self.missing.clear();
        self.recreated.clear();

        let maps = fs::read_to_string("/proc/self/maps").context("read /proc/self/maps")?;
        for line in maps.lines() {
            let Some(entry) = parse_maps_line(line) else {
                continue;
            };
            if !entry.shared || entry.prot == 0 {
                continue;
            }
            let exists = Path::new(&entry.path).exists();
            let writable = exists
                && fs::metadata(&entry.path)
                    .map(|m| !m.permissions().readonly())
                    .unwrap_or(false);

            match classify_shm_entry(&entry, exists, writable) {
                ShmDisposition::Ignore => {}
                ShmDisposition::Checkpoint(area) => {
                    // Next read of the pages reloads them from disk, so the
                    // file connection's copy is the authoritative one.
                    unsafe {
                        libc::msync(
                            area.addr as *mut libc::c_void,
                            area.len,
                            libc::MS_INVALIDATE,
                        );
                    }
                    let id = register(&area)?;
                    blank_area(&area)?;
                    tracing::debug!("blanked shared mapping {}", area.path.display());
                    self.blanked.push((area, id));
                }
                ShmDisposition::RecreateAtRestart(area) => {
                    tracing::debug!(
                        "will recreate unlinked shm file {} at restart",
                        area.path.display()
                    );
                    self.unlinked.push(area);
                }
            }
        }
        Ok(())
    }

    /// Restart: remap areas whose backing file reappeared on disk, defer the
    /// rest to `recreate_missing`.
    pub fn restore_or_defer(&mut self) -> Result<()> {
        let areas = std::mem::take(&mut self.unlinked);
        for area in areas {
            if area.path.exists() {
                tracing::warn!(
                    "{} was unlinked at checkpoint but exists on disk; mapping it as is",
                    area.path.display()
                );
                restore_area_from_file(&area)?;
            } else {
                self.missing.push(area);
            }
        }
        Ok(())
    }

    /// Restart: recreate every deferred backing file from the restored
    /// memory contents and map it back over the original address.
    pub fn recreate_missing(&mut self) -> Result<()> {
        let areas = std::mem::take(&mut self.missing);
        for area in areas {
            recreate_shm_file(&area)?;
            self.recreated.push(area.path.clone());
        }
        Ok(())
    }

    /// Remap the blanked areas over their file connections at resume.
    /// `fd_for` resolves the connection that kept the backing file open.
    pub fn remap_blanked(
        &mut self,
        mut fd_for: impl FnMut(&ConnectionId) -> Option<RawFd>,
    ) -> Result<Vec<(ConnectionId, RawFd)>> {
        let mut consumed = Vec::new();
        for (area, id) in std::mem::take(&mut self.blanked) {
            let fd = fd_for(&id)
                .ok_or_else(|| anyhow!("no fd left for shm area {}", area.path.display()))?;
            map_fixed(&area, fd)?;
            consumed.push((id, fd));
        }
        Ok(consumed)
    }

    /// The files recreated by `recreate_missing` were unlinked at checkpoint
    /// time; unlink them again once every peer has remapped (next barrier).
    pub fn unlink_recreated(&mut self) {
        for path in std::mem::take(&mut self.recreated) {
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!("unlink of recreated {} failed: {}", path.display(), err);
            }
        }
    }
}

/// Replace a mapping with an inaccessible anonymous one so the dump engine
/// skips it and the allocator cannot colonize the range.
fn blank_area(area: &ShmArea) -> Result<()> {
    let rc = unsafe {
        libc::mmap(
            area.addr as *mut libc::c_void,
            area.len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if rc == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error()).context("blank shared mapping");
    }
    Ok(())
}

fn map_fixed(area: &ShmArea, fd: RawFd) -> Result<()> {
    let rc = unsafe {
        libc::mmap(
            area.addr as *mut libc::c_void,
            area.len,
            area.prot,
            area.flags | libc::MAP_FIXED,
            fd,
            area.offset as libc::off_t,
        )
    };
    if rc == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("remap shared area {}", area.path.display()));
    }
    Ok(())
}

fn restore_area_from_file(area: &ShmArea) -> Result<()> {
    let write = area.prot & libc::PROT_WRITE != 0;
    let file = fs::OpenOptions::new()
        .read(true)
        .write(write)
        .open(&area.path)
        .with_context(|| format!("reopen shm file {}", area.path.display()))?;
    map_fixed(area, file.as_raw_fd())
}

/// Write the restored in-memory contents of `area` into a freshly created
/// backing file and map the file over the original address.
///
/// EEXIST means another restarting peer created the file first; its data may
/// still be in flight, so simply open and map it.
fn recreate_shm_file(area: &ShmArea) -> Result<()> {
    if let Some(parent) = area.path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directories for {}", area.path.display()))?;
    }

    let created = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&area.path);
    let mut file = match created {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&area.path)
            .with_context(|| format!("open recreated shm file {}", area.path.display()))?,
        Err(err) => {
            return Err(err)
                .with_context(|| format!("recreate shm file {}", area.path.display()));
        }
    };

    file.seek(SeekFrom::Start(area.offset)).context("seek in shm file")?;
    let contents = unsafe { std::slice::from_raw_parts(area.addr as *const u8, area.len) };
    file.write_all(contents).context("write shm contents")?;
    map_fixed(area, file.as_raw_fd())
}
