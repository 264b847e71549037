use std::io::Write as _;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use ckptd_core::coordinator::{CoordinatorConfig, CoordinatorServer};
use ckptd_core::link::{recv_message, send_message};
use ckptd_core::protocol::{
    Message, MessageType, SAME_CKPT_INTERVAL, UserCommand, cmd_status,
};
use ckptd_core::worker::{coord_host_from, coord_port_from, quiet_level_from};

#[derive(Parser, Debug)]
#[command(name = "ckptd")]
#[command(about = "Checkpoint/restart coordinator and operator commands", long_about = None)]
struct Cli {
    /// Coordinator host (defaults to $DMTCP_COORD_HOST).
    #[arg(long, global = true)]
    host: Option<String>,
    /// Coordinator port (defaults to $DMTCP_COORD_PORT).
    #[arg(long, global = true)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the coordinator daemon.
    Coordinator {
        #[arg(long)]
        port_file: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        ckpt_dir: PathBuf,
        /// Checkpoint automatically every N seconds (0 disables).
        #[arg(long, default_value_t = 0)]
        interval: u32,
        /// Abort a cycle whose stage stalls longer than this many seconds.
        #[arg(long, default_value_t = 20)]
        stage_timeout: u64,
    },
    /// Print coordinator status.
    Status,
    /// Trigger a checkpoint cycle now.
    Checkpoint,
    /// Change the automatic checkpoint interval.
    SetInterval { seconds: u32 },
    /// List connected workers and their states.
    ListPeers,
    /// Kill every worker in the computation.
    Kill,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let host = coord_host_from(
        cli.host.as_deref(),
        std::env::var("DMTCP_COORD_HOST")
            .or_else(|_| std::env::var("DMTCP_HOST"))
            .ok()
            .as_deref(),
    );
    let port = cli.port.unwrap_or_else(|| {
        coord_port_from(
            std::env::var("DMTCP_COORD_PORT").ok().as_deref(),
            std::env::var("DMTCP_PORT").ok().as_deref(),
        )
    });

    match cli.command {
        Commands::Coordinator {
            port_file,
            ckpt_dir,
            interval,
            stage_timeout,
        } => run_coordinator(port, port_file, ckpt_dir, interval, stage_timeout),
        Commands::Status => send_command(&host, port, UserCommand::Status, None),
        Commands::Checkpoint => send_command(&host, port, UserCommand::Checkpoint, None),
        Commands::SetInterval { seconds } => {
            send_command(&host, port, UserCommand::SetInterval, Some(seconds))
        }
        Commands::ListPeers => send_command(&host, port, UserCommand::ListPeers, None),
        Commands::Kill => send_command(&host, port, UserCommand::Kill, None),
    }
}

fn run_coordinator(
    port: u16,
    port_file: Option<PathBuf>,
    ckpt_dir: PathBuf,
    interval: u32,
    stage_timeout: u64,
) -> Result<()> {
    let config = CoordinatorConfig {
        listen_port: port,
        port_file,
        ckpt_dir,
        checkpoint_interval_secs: interval,
        stage_timeout: Duration::from_secs(stage_timeout),
    };
    let runtime = tokio::runtime::Runtime::new().context("start tokio runtime")?;
    runtime.block_on(async move {
        let (server, addr) = CoordinatorServer::bind(config).await?;
        println!("coordinator listening on {}", addr);
        server.serve().await
    })
}

fn send_command(host: &str, port: u16, command: UserCommand, interval: Option<u32>) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let mut stream = match TcpStream::connect(&addr) {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("coordinator not found at {}: {}", addr, err);
            std::process::exit(-cmd_status::ERROR_COORDINATOR_NOT_FOUND);
        }
    };

    let mut msg = Message::new(MessageType::UserCmd);
    msg.coord_cmd = command as u32;
    msg.checkpoint_interval = interval.unwrap_or(SAME_CKPT_INTERVAL);
    send_message(&mut stream, &msg, &[])?;

    let (reply, payload) = recv_message(&mut stream).context("read command result")?;
    if reply.msg_type != MessageType::UserCmdResult {
        bail!("unexpected reply: {:?}", reply.msg_type);
    }
    if !payload.is_empty() {
        std::io::stdout().write_all(&payload)?;
    }
    match reply.coord_cmd_status {
        cmd_status::NOERROR => Ok(()),
        cmd_status::ERROR_NOT_RUNNING_STATE => {
            eprintln!("coordinator is not in a runnable state for this command");
            std::process::exit(-cmd_status::ERROR_NOT_RUNNING_STATE);
        }
        other => {
            eprintln!("command failed with status {}", other);
            std::process::exit(-cmd_status::ERROR_INVALID_COMMAND);
        }
    }
}

/// `DMTCP_QUIET` lowers verbosity: 0 keeps info, 1 keeps warnings, 2 keeps
/// errors only. `RUST_LOG` still wins when set.
fn init_logging() {
    let quiet = quiet_level_from(std::env::var("DMTCP_QUIET").ok().as_deref());
    let default = match quiet {
        0 => "info",
        1 => "warn",
        _ => "error",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
