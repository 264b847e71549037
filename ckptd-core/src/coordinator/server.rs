use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use ahash::AHashMap;
use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::link::{read_message, write_message};
use crate::protocol::{Message, MessageType};

use super::{Action, BarrierOrchestrator, LinkId, NameService};

/// Daemon configuration; defaults match the classic coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub listen_port: u16,
    pub port_file: Option<PathBuf>,
    pub ckpt_dir: PathBuf,
    pub checkpoint_interval_secs: u32,
    pub stage_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_port: 7779,
            port_file: None,
            ckpt_dir: PathBuf::from("."),
            checkpoint_interval_secs: 0,
            stage_timeout: Duration::from_secs(20),
        }
    }
}

enum Event {
    Message {
        link: LinkId,
        msg: Message,
        payload: Vec<u8>,
    },
    /// Undecodable bytes arrived: protocol violation, not a clean close.
    Invalid { link: LinkId },
    Closed { link: LinkId },
}

struct Link {
    sender: mpsc::UnboundedSender<(Message, Vec<u8>)>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// The coordinator daemon: accepts worker links and multiplexes them into the
/// single-threaded barrier orchestrator.
pub struct CoordinatorServer {
    listener: TcpListener,
    config: CoordinatorConfig,
}

impl CoordinatorServer {
    /// Bind the listen socket and, if asked, record the bound port so batch
    /// scripts can discover a port-0 binding.
    pub async fn bind(config: CoordinatorConfig) -> Result<(Self, SocketAddr)> {
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
            .await
            .with_context(|| format!("bind coordinator port {}", config.listen_port))?;
        let addr = listener.local_addr()?;
        if let Some(port_file) = &config.port_file {
            std::fs::write(port_file, format!("{}", addr.port()))
                .with_context(|| format!("write port file {}", port_file.display()))?;
        }
        Ok((Self { listener, config }, addr))
    }

    pub async fn serve(self) -> Result<()> {
        let mut orchestrator = BarrierOrchestrator::new(
            self.config.ckpt_dir.clone(),
            self.config.checkpoint_interval_secs,
        );
        let mut name_service = NameService::new();
        let mut links: AHashMap<LinkId, Link> = AHashMap::new();
        let mut next_link: LinkId = 1;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

        let mut stage_deadline: Option<Instant> = None;
        let mut interval_deadline: Option<Instant> = None;

        loop {
            if orchestrator.cycle_active()
                || orchestrator.worker_count() == 0
                || orchestrator.checkpoint_interval_secs() == 0
            {
                interval_deadline = None;
            } else if interval_deadline.is_none() {
                interval_deadline = Some(
                    Instant::now()
                        + Duration::from_secs(orchestrator.checkpoint_interval_secs() as u64),
                );
            }

            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.context("accept on coordinator port")?;
                    let link = next_link;
                    next_link += 1;
                    tracing::debug!("link {} connected from {}", link, peer);
                    links.insert(link, spawn_link(link, stream, event_tx.clone()));
                }
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let actions = match event {
                        Event::Message { link, msg, payload } => {
                            if is_name_service_request(msg.msg_type) {
                                handle_name_service(&mut name_service, &links, link, msg, payload);
                                Vec::new()
                            } else {
                                orchestrator.handle_message(link, msg, payload)
                            }
                        }
                        Event::Invalid { link } => orchestrator.protocol_violation(link),
                        Event::Closed { link } => {
                            drop_link(&mut links, link);
                            orchestrator.on_link_closed(link)
                        }
                    };
                    perform(
                        actions,
                        &mut links,
                        &mut name_service,
                        &mut stage_deadline,
                        self.config.stage_timeout,
                    );
                }
                _ = sleep_until_opt(stage_deadline), if stage_deadline.is_some() => {
                    stage_deadline = None;
                    let actions = orchestrator.on_stage_timeout();
                    perform(
                        actions,
                        &mut links,
                        &mut name_service,
                        &mut stage_deadline,
                        self.config.stage_timeout,
                    );
                }
                _ = sleep_until_opt(interval_deadline), if interval_deadline.is_some() => {
                    interval_deadline = None;
                    match orchestrator.start_checkpoint() {
                        Ok(actions) => perform(
                            actions,
                            &mut links,
                            &mut name_service,
                            &mut stage_deadline,
                            self.config.stage_timeout,
                        ),
                        Err(_) => tracing::debug!("interval checkpoint skipped"),
                    }
                }
            }
        }
        Ok(())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn spawn_link(link: LinkId, stream: TcpStream, event_tx: mpsc::UnboundedSender<Event>) -> Link {
    let (mut read_half, mut write_half) = stream.into_split();
    let (sender, mut outgoing) = mpsc::unbounded_channel::<(Message, Vec<u8>)>();

    let reader = tokio::spawn(async move {
        loop {
            match read_message(&mut read_half).await {
                Ok((msg, payload)) => {
                    if event_tx
                        .send(Event::Message { link, msg, payload })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    let event = if err.downcast_ref::<std::io::Error>().is_some() {
                        Event::Closed { link }
                    } else {
                        tracing::warn!("link {}: {}", link, err);
                        Event::Invalid { link }
                    };
                    let _ = event_tx.send(event);
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some((msg, payload)) = outgoing.recv().await {
            if write_message(&mut write_half, &msg, &payload).await.is_err() {
                break;
            }
        }
    });

    Link {
        sender,
        reader,
        writer,
    }
}

fn drop_link(links: &mut AHashMap<LinkId, Link>, link: LinkId) {
    if let Some(l) = links.remove(&link) {
        l.reader.abort();
        l.writer.abort();
    }
}

fn perform(
    actions: Vec<Action>,
    links: &mut AHashMap<LinkId, Link>,
    name_service: &mut NameService,
    stage_deadline: &mut Option<Instant>,
    stage_timeout: Duration,
) {
    for action in actions {
        match action {
            Action::Send { link, msg, payload } => {
                if let Some(l) = links.get(&link) {
                    let _ = l.sender.send((msg, payload));
                }
            }
            Action::CloseLink { link } => drop_link(links, link),
            Action::ArmStageTimer => {
                *stage_deadline = Some(Instant::now() + stage_timeout);
            }
            Action::DisarmStageTimer => *stage_deadline = None,
            Action::ClearNameService => name_service.clear(),
        }
    }
}

fn is_name_service_request(msg_type: MessageType) -> bool {
    matches!(
        msg_type,
        MessageType::RegisterNsData
            | MessageType::RegisterNsDataSync
            | MessageType::NsQuery
            | MessageType::NsGetUniqueId
    )
}

/// Name-service requests bypass the orchestrator: they arrive mid-barrier
/// from workers executing a registry stage and are answered immediately.
fn handle_name_service(
    name_service: &mut NameService,
    links: &AHashMap<LinkId, Link>,
    link: LinkId,
    msg: Message,
    payload: Vec<u8>,
) {
    let reply = |links: &AHashMap<LinkId, Link>, msg: Message, payload: Vec<u8>| {
        if let Some(l) = links.get(&link) {
            let _ = l.sender.send((msg, payload));
        }
    };

    match msg.msg_type {
        MessageType::RegisterNsData | MessageType::RegisterNsDataSync => {
            let key_len = msg.key_len as usize;
            let val_len = msg.val_len as usize;
            if payload.len() != key_len + val_len {
                tracing::warn!("malformed name-service register from link {}", link);
                return;
            }
            let key = payload[..key_len].to_vec();
            let value = payload[key_len..].to_vec();
            name_service.register(msg.nsid, key, value);
            if msg.msg_type == MessageType::RegisterNsDataSync {
                let mut out = Message::new(MessageType::RegisterNsDataSyncResponse);
                out.nsid = msg.nsid;
                reply(links, out, Vec::new());
            }
        }
        MessageType::NsQuery => {
            let value = name_service
                .query(&msg.nsid, &payload)
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            let mut out = Message::new(MessageType::NsQueryResponse);
            out.nsid = msg.nsid;
            out.key_len = payload.len() as u32;
            out.val_len = value.len() as u32;
            reply(links, out, value);
        }
        MessageType::NsGetUniqueId => {
            let base = name_service.get_unique_ids(msg.nsid, msg.unique_id_offset);
            let mut out = Message::new(MessageType::NsGetUniqueIdResponse);
            out.nsid = msg.nsid;
            reply(links, out, base.to_le_bytes().to_vec());
        }
        _ => {}
    }
}
