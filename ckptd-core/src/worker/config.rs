use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Default coordinator port, shared with the CLI.
pub const DEFAULT_COORD_PORT: u16 = 7779;

/// Default checkpoint signal (SIGUSR2) when `DMTCP_SIGCKPT` is absent or
/// out of the 1..=31 range.
pub const DEFAULT_CKPT_SIGNAL: i32 = libc::SIGUSR2;

/// Per-process configuration, resolved from the environment once at startup
/// so later `getenv` tricks played by the application cannot change it.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub coord_host: String,
    pub coord_port: u16,
    pub tmp_dir: PathBuf,
    pub ckpt_signal: i32,
    pub quiet: u8,
    pub env_file: PathBuf,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let coord_host = coord_host_from(
            env::var("DMTCP_COORD_HOST").ok().as_deref(),
            env::var("DMTCP_HOST").ok().as_deref(),
        );
        let coord_port = coord_port_from(
            env::var("DMTCP_COORD_PORT").ok().as_deref(),
            env::var("DMTCP_PORT").ok().as_deref(),
        );
        let root = tmp_root_from(
            env::var("DMTCP_TMPDIR").ok().as_deref(),
            env::var("TMPDIR").ok().as_deref(),
        );
        let tmp_dir = scratch_dir(&root, &current_user(), &current_host());
        fs::create_dir_all(&tmp_dir)
            .with_context(|| format!("create scratch dir {}", tmp_dir.display()))?;

        Ok(Self {
            coord_host,
            coord_port,
            tmp_dir,
            ckpt_signal: ckpt_signal_from(env::var("DMTCP_SIGCKPT").ok().as_deref()),
            quiet: quiet_level_from(env::var("DMTCP_QUIET").ok().as_deref()),
            env_file: PathBuf::from(
                env::var("DMTCP_ENV_FILE").unwrap_or_else(|_| "dmtcp_env.txt".to_string()),
            ),
        })
    }

    pub fn coord_addr(&self) -> String {
        format!("{}:{}", self.coord_host, self.coord_port)
    }
}

pub fn coord_host_from(primary: Option<&str>, deprecated: Option<&str>) -> String {
    primary
        .or(deprecated)
        .unwrap_or("127.0.0.1")
        .to_string()
}

pub fn coord_port_from(primary: Option<&str>, deprecated: Option<&str>) -> u16 {
    primary
        .or(deprecated)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_COORD_PORT)
}

/// Signal used to suspend application threads. Values outside 1..=31 (and
/// unparsable ones) fall back to the default.
pub fn ckpt_signal_from(raw: Option<&str>) -> i32 {
    match raw.and_then(|s| s.parse::<i32>().ok()) {
        Some(sig) if (1..=31).contains(&sig) => sig,
        _ => DEFAULT_CKPT_SIGNAL,
    }
}

pub fn quiet_level_from(raw: Option<&str>) -> u8 {
    raw.and_then(|s| s.parse::<u8>().ok())
        .map(|q| q.min(2))
        .unwrap_or(0)
}

pub fn tmp_root_from(dmtcp_tmpdir: Option<&str>, tmpdir: Option<&str>) -> PathBuf {
    PathBuf::from(dmtcp_tmpdir.or(tmpdir).unwrap_or("/tmp"))
}

/// `<root>/dmtcp-<user>@<host>`, the per-user scratch directory.
pub fn scratch_dir(root: &PathBuf, user: &str, host: &str) -> PathBuf {
    root.join(format!("dmtcp-{}@{}", user, host))
}

fn current_user() -> String {
    if let Ok(user) = env::var("USER") {
        return user;
    }
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_default()
}

fn current_host() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}
