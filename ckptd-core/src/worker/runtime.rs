use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context, Result};

use crate::protocol::{UniquePid, WorkerState};
use crate::resource::{ResourceRegistry, ScanContext};

use super::{AtforkHooks, CoordinatorChannel, ForkPhase, ThreadRoster, ThreadSync, WorkerConfig};

/// Seam to the external dump engine that serializes memory and registers.
/// The core only decides *when* and *where* the image is written.
pub trait ImageDumper: Send + Sync {
    /// Write the process image to `path`; returns the image size.
    fn dump(&self, path: &Path) -> Result<u64>;
}

/// Stand-in dump engine: records the memory layout instead of page
/// contents. Enough for exercising the protocol end to end.
pub struct ProcMapsDumper;

impl ImageDumper for ProcMapsDumper {
    fn dump(&self, path: &Path) -> Result<u64> {
        let maps = fs::read_to_string("/proc/self/maps").context("read /proc/self/maps")?;
        fs::write(path, &maps).with_context(|| format!("write image {}", path.display()))?;
        Ok(maps.len() as u64)
    }
}

/// Per-process worker runtime. One instance per process, created by
/// [`WorkerRuntime::initialize`]; never by static constructors.
pub struct WorkerRuntime {
    pub config: WorkerConfig,
    pub identity: UniquePid,
    pub sync: ThreadSync,
    pub roster: ThreadRoster,
    pub atfork: AtforkHooks,
    pub registry: Mutex<ResourceRegistry>,
    pub channel: Mutex<CoordinatorChannel>,
    pub dumper: Box<dyn ImageDumper>,
    pub ckpt_dir: Mutex<PathBuf>,
    pub program_name: String,
    state: AtomicU32,
}

static INSTANCE: OnceLock<Arc<WorkerRuntime>> = OnceLock::new();

impl WorkerRuntime {
    /// Join the computation as a new worker: resolve configuration, scan our
    /// fds, connect, install the checkpoint-signal handler, and start the
    /// checkpoint thread. Call exactly once, before application threads
    /// start playing with the environment.
    pub fn initialize(dumper: Box<dyn ImageDumper>) -> Result<Arc<WorkerRuntime>> {
        let config = WorkerConfig::from_env()?;
        let identity = UniquePid::this_process();

        let channel = CoordinatorChannel::connect_new(&config.coord_addr(), identity)?;
        let runtime = Self::assemble(config, identity, channel, dumper, WorkerState::Running)?;
        runtime
            .channel
            .lock()
            .expect("channel poisoned")
            .send_ok(WorkerState::Running)?;
        super::spawn_ckpt_thread(Arc::clone(&runtime), false);
        Ok(runtime)
    }

    /// Rejoin after restart: the registry has been reconstructed from the
    /// image, local resources were reopened in `post_restart`, and the
    /// remaining barriers run on the restart path.
    pub fn initialize_restart(
        mut registry: ResourceRegistry,
        comp_group: UniquePid,
        num_peers: u32,
        dumper: Box<dyn ImageDumper>,
    ) -> Result<Arc<WorkerRuntime>> {
        let config = WorkerConfig::from_env()?;
        let identity = UniquePid::this_process();
        registry.post_restart()?;

        let channel =
            CoordinatorChannel::connect_restart(&config.coord_addr(), identity, comp_group, num_peers)?;
        let runtime = Self::assemble_with_registry(
            config,
            identity,
            channel,
            registry,
            dumper,
            WorkerState::Checkpointed,
        )?;
        super::spawn_ckpt_thread(Arc::clone(&runtime), true);
        Ok(runtime)
    }

    fn assemble(
        config: WorkerConfig,
        identity: UniquePid,
        channel: CoordinatorChannel,
        dumper: Box<dyn ImageDumper>,
        state: WorkerState,
    ) -> Result<Arc<WorkerRuntime>> {
        let mut registry = ResourceRegistry::new(identity, config.tmp_dir.clone());
        registry.protect_fd(channel.raw_fd());
        if let Ok(ip) = channel.local_ip() {
            registry.set_advertise_ip(ip);
        }
        registry.scan(&scan_context())?;
        Self::assemble_with_registry(config, identity, channel, registry, dumper, state)
    }

    fn assemble_with_registry(
        config: WorkerConfig,
        identity: UniquePid,
        channel: CoordinatorChannel,
        registry: ResourceRegistry,
        dumper: Box<dyn ImageDumper>,
        state: WorkerState,
    ) -> Result<Arc<WorkerRuntime>> {
        ThreadRoster::install_handler(config.ckpt_signal)?;

        let runtime = Arc::new(WorkerRuntime {
            identity,
            sync: ThreadSync::new(),
            roster: ThreadRoster::new(),
            atfork: AtforkHooks::new(),
            registry: Mutex::new(registry),
            channel: Mutex::new(channel),
            dumper,
            ckpt_dir: Mutex::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),
            program_name: program_name(),
            state: AtomicU32::new(state as u32),
            config,
        });

        INSTANCE
            .set(Arc::clone(&runtime))
            .map_err(|_| anyhow::anyhow!("worker runtime initialized twice"))?;
        Ok(runtime)
    }

    pub fn instance() -> Option<Arc<WorkerRuntime>> {
        INSTANCE.get().cloned()
    }

    pub fn current_state(&self) -> WorkerState {
        WorkerState::try_from(self.state.load(Ordering::SeqCst)).unwrap_or(WorkerState::Unknown)
    }

    pub fn set_current_state(&self, state: WorkerState) {
        self.state.store(state as u32, Ordering::SeqCst);
    }

    /// `ckpt_<progname>_<uniquepid>.dmtcp` inside the checkpoint directory.
    pub fn ckpt_image_path(&self) -> PathBuf {
        let dir = self.ckpt_dir.lock().expect("ckpt dir poisoned").clone();
        dir.join(format!(
            "ckpt_{}_{}.dmtcp",
            self.program_name, self.identity
        ))
    }

    pub fn set_ckpt_dir(&self, dir: PathBuf) {
        *self.ckpt_dir.lock().expect("ckpt dir poisoned") = dir;
    }

    /// Child side of fork: run the registered child hooks in registration
    /// order (virtual-pid reset comes before wrapper reset), clear inherited
    /// synchronization state, and rejoin the coordinator as a new worker.
    pub fn reset_after_fork(&self) {
        self.atfork.run(ForkPhase::Child);
        self.roster.clear();
        self.set_current_state(WorkerState::Running);
    }
}

fn scan_context() -> ScanContext {
    ScanContext {
        ctty: controlling_terminal(std::process::id()),
        parent_ctty: controlling_terminal(std::os::unix::process::parent_id()),
        under_pbs: std::env::var_os("PBS_JOBID").is_some(),
        under_slurm: std::env::var_os("SLURM_JOBID").is_some()
            || std::env::var_os("SLURM_JOB_ID").is_some(),
    }
}

fn controlling_terminal(pid: u32) -> Option<String> {
    // /proc/<pid>/fd/0 usually names the terminal; fall back to none.
    fs::read_link(format!("/proc/{}/fd/0", pid))
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| p.starts_with("/dev/"))
}

fn program_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}
