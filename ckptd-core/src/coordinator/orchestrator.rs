use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::AHashMap;

use crate::protocol::{
    Message, MessageType, SAME_CKPT_INTERVAL, UniquePid, UserCommand, WorkerState, cmd_status,
};

/// Coordinator-local handle for one worker link.
pub type LinkId = u64;

/// Ordered checkpoint barrier stages: broadcast the command, then await every
/// admitted worker's `Ok` at exactly the paired state.
pub const CKPT_STAGES: &[(MessageType, WorkerState)] = &[
    (MessageType::DoSuspend, WorkerState::Suspended),
    (MessageType::DoFdLeaderElection, WorkerState::FdLeaderElection),
    (MessageType::DoPreCkptNsRegister, WorkerState::PreCkptNsRegister),
    (MessageType::DoPreCkptNsQuery, WorkerState::PreCkptNsQuery),
    (MessageType::DoDrain, WorkerState::Drained),
    (MessageType::DoCheckpoint, WorkerState::Checkpointed),
    (MessageType::DoRegisterNsData, WorkerState::NsDataRegistered),
    (MessageType::DoSendQueries, WorkerState::DoneQuerying),
    (MessageType::DoRefill, WorkerState::Refilled),
];

/// Barrier stages of a restart group; workers rejoin at `Checkpointed`.
pub const RESTART_STAGES: &[(MessageType, WorkerState)] = &[
    (MessageType::DoRegisterNsData, WorkerState::NsDataRegistered),
    (MessageType::DoSendQueries, WorkerState::DoneQuerying),
    (MessageType::DoRefill, WorkerState::Refilled),
];

/// One admitted worker, as the coordinator sees it.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub upid: UniquePid,
    pub state: WorkerState,
    pub ckpt_filename: Option<String>,
    pub in_quorum: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Idle: workers run, admission of new workers is open.
    Running,
    /// Checkpoint cycle: the indexed [`CKPT_STAGES`] entry is outstanding.
    Ckpt { stage: usize },
    /// Restart group: gathering peers (`stage == None`), then driving
    /// [`RESTART_STAGES`].
    Restart { expected: u32, stage: Option<usize> },
}

/// Effect the event loop has to carry out for the orchestrator. The
/// orchestrator itself never touches a socket, which keeps every barrier
/// decision unit-testable.
#[derive(Debug)]
pub enum Action {
    Send {
        link: LinkId,
        msg: Message,
        payload: Vec<u8>,
    },
    CloseLink {
        link: LinkId,
    },
    ArmStageTimer,
    DisarmStageTimer,
    /// Name-service entries are scoped to one cycle/restart group.
    ClearNameService,
}

/// Drives every admitted worker through the ordered barrier stages and owns
/// the worker table for the computation group.
pub struct BarrierOrchestrator {
    workers: AHashMap<LinkId, WorkerRecord>,
    phase: Phase,
    comp_group: Option<UniquePid>,
    coord_timestamp: u64,
    checkpoint_interval_secs: u32,
    ckpt_dir: PathBuf,
}

impl BarrierOrchestrator {
    pub fn new(ckpt_dir: PathBuf, checkpoint_interval_secs: u32) -> Self {
        Self {
            workers: AHashMap::new(),
            phase: Phase::Running,
            comp_group: None,
            coord_timestamp: unix_nanos(),
            checkpoint_interval_secs,
            ckpt_dir,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn coord_timestamp(&self) -> u64 {
        self.coord_timestamp
    }

    pub fn checkpoint_interval_secs(&self) -> u32 {
        self.checkpoint_interval_secs
    }

    pub fn cycle_active(&self) -> bool {
        self.phase != Phase::Running
    }

    pub fn worker(&self, link: LinkId) -> Option<&WorkerRecord> {
        self.workers.get(&link)
    }

    /// Dispatch one decoded worker message.
    pub fn handle_message(&mut self, link: LinkId, msg: Message, payload: Vec<u8>) -> Vec<Action> {
        match msg.msg_type {
            MessageType::NewWorker => self.admit_new_worker(link, msg),
            MessageType::RestartWorker => self.admit_restart_worker(link, msg),
            MessageType::Ok => self.handle_ok(link, msg.state),
            MessageType::CkptFilename | MessageType::UniqueCkptFilename => {
                self.record_ckpt_filename(link, &payload);
                Vec::new()
            }
            MessageType::UserCmd => self.handle_user_cmd(link, &msg),
            other => {
                tracing::warn!("unexpected message type {:?} from link {}", other, link);
                self.protocol_violation(link)
            }
        }
    }

    /// A link closed. During a cycle, losing a worker aborts the whole cycle.
    pub fn on_link_closed(&mut self, link: LinkId) -> Vec<Action> {
        match self.workers.remove(&link) {
            Some(record) => {
                tracing::info!("worker {} disconnected", record.upid);
                if self.phase != Phase::Running {
                    self.abort_cycle("worker link closed during cycle")
                } else {
                    Vec::new()
                }
            }
            None => Vec::new(),
        }
    }

    /// The armed stage deadline expired without quorum.
    pub fn on_stage_timeout(&mut self) -> Vec<Action> {
        if self.phase == Phase::Running {
            return Vec::new();
        }
        self.abort_cycle("stage deadline expired")
    }

    /// A link produced garbage (bad magic, unknown type, framing error).
    pub fn protocol_violation(&mut self, link: LinkId) -> Vec<Action> {
        let mut actions = vec![Action::CloseLink { link }];
        if self.workers.remove(&link).is_some() && self.phase != Phase::Running {
            actions.extend(self.abort_cycle("protocol violation on worker link"));
        }
        actions
    }

    /// Begin a checkpoint cycle. Fails with a user-command status code when
    /// the coordinator is mid-cycle or has no workers.
    pub fn start_checkpoint(&mut self) -> Result<Vec<Action>, i32> {
        if self.phase != Phase::Running || self.workers.is_empty() {
            return Err(cmd_status::ERROR_NOT_RUNNING_STATE);
        }
        if let Some(group) = self.comp_group.as_mut() {
            group.generation += 1;
        }
        self.phase = Phase::Ckpt { stage: 0 };
        tracing::info!(
            "starting checkpoint cycle for {} worker(s)",
            self.workers.len()
        );
        Ok(self.fire_ckpt_stage(0))
    }

    fn admit_new_worker(&mut self, link: LinkId, msg: Message) -> Vec<Action> {
        if self.phase != Phase::Running {
            tracing::info!("rejecting worker {}: not in running state", msg.from);
            return vec![
                Action::Send {
                    link,
                    msg: self.base_msg(MessageType::RejectNotRunning),
                    payload: Vec::new(),
                },
                Action::CloseLink { link },
            ];
        }
        if self.comp_group.is_none() {
            self.comp_group = Some(msg.from);
        }
        self.workers.insert(
            link,
            WorkerRecord {
                upid: msg.from,
                state: WorkerState::Unknown,
                ckpt_filename: None,
                in_quorum: true,
            },
        );
        tracing::info!("admitted worker {} ({} total)", msg.from, self.workers.len());
        vec![Action::Send {
            link,
            msg: self.base_msg(MessageType::Accept),
            payload: Vec::new(),
        }]
    }

    fn admit_restart_worker(&mut self, link: LinkId, msg: Message) -> Vec<Action> {
        let reject = |this: &Self, msg_type: MessageType| {
            vec![
                Action::Send {
                    link,
                    msg: this.base_msg(msg_type),
                    payload: Vec::new(),
                },
                Action::CloseLink { link },
            ]
        };

        match self.phase {
            Phase::Ckpt { .. } => return reject(self, MessageType::RejectNotRestarting),
            Phase::Restart { stage: Some(_), .. } => {
                return reject(self, MessageType::RejectNotRestarting);
            }
            Phase::Running => {
                if let Some(group) = self.comp_group
                    && !same_computation(&group, &msg.comp_group)
                {
                    return reject(self, MessageType::RejectWrongComp);
                }
                self.comp_group = Some(msg.comp_group);
                self.phase = Phase::Restart {
                    expected: msg.num_peers.max(1),
                    stage: None,
                };
                tracing::info!(
                    "restart group opened for {} ({} peer(s) expected)",
                    msg.comp_group,
                    msg.num_peers.max(1)
                );
            }
            Phase::Restart { stage: None, .. } => {
                let group = self.comp_group.expect("restart phase has a group");
                if !same_computation(&group, &msg.comp_group) {
                    return reject(self, MessageType::RejectWrongComp);
                }
            }
        }

        self.workers.insert(
            link,
            WorkerRecord {
                upid: msg.from,
                state: WorkerState::Checkpointed,
                ckpt_filename: None,
                in_quorum: true,
            },
        );
        let mut actions = vec![Action::Send {
            link,
            msg: self.base_msg(MessageType::Accept),
            payload: Vec::new(),
        }];

        if let Phase::Restart {
            expected,
            stage: None,
        } = self.phase
            && self.workers.len() as u32 >= expected
        {
            tracing::info!("all {} restart peer(s) present, driving restart barriers", expected);
            self.phase = Phase::Restart {
                expected,
                stage: Some(0),
            };
            actions.extend(self.fire_restart_stage(0));
        }
        actions
    }

    fn handle_ok(&mut self, link: LinkId, state: WorkerState) -> Vec<Action> {
        let Some(record) = self.workers.get_mut(&link) else {
            tracing::warn!("Ok from unknown link {}", link);
            return vec![Action::CloseLink { link }];
        };

        // Admission acknowledgement: the worker announces RUNNING right
        // after Accept, possibly racing the first broadcast of a cycle.
        if state == WorkerState::Running && record.state == WorkerState::Unknown {
            record.state = WorkerState::Running;
            return Vec::new();
        }

        record.state = state;
        let expected = match self.phase {
            Phase::Ckpt { stage } => CKPT_STAGES[stage].1,
            Phase::Restart {
                stage: Some(stage), ..
            } => RESTART_STAGES[stage].1,
            _ => {
                return self.abort_cycle("Ok outside of any barrier stage");
            }
        };

        if state != expected {
            tracing::error!("worker reported {} while barrier expects {}", state, expected);
            return self.abort_cycle("worker state does not match barrier");
        }

        if self.quorum_reached(expected) {
            self.advance_stage()
        } else {
            Vec::new()
        }
    }

    fn quorum_reached(&self, expected: WorkerState) -> bool {
        self.workers
            .values()
            .filter(|w| w.in_quorum)
            .all(|w| w.state == expected)
    }

    fn advance_stage(&mut self) -> Vec<Action> {
        match self.phase {
            Phase::Ckpt { stage } => {
                let next = stage + 1;
                if next < CKPT_STAGES.len() {
                    self.phase = Phase::Ckpt { stage: next };
                    self.fire_ckpt_stage(next)
                } else {
                    self.finish_cycle()
                }
            }
            Phase::Restart {
                expected,
                stage: Some(stage),
            } => {
                let next = stage + 1;
                if next < RESTART_STAGES.len() {
                    self.phase = Phase::Restart {
                        expected,
                        stage: Some(next),
                    };
                    self.fire_restart_stage(next)
                } else {
                    if let Some(group) = self.comp_group.as_mut() {
                        group.generation += 1;
                    }
                    self.finish_cycle()
                }
            }
            Phase::Running | Phase::Restart { stage: None, .. } => Vec::new(),
        }
    }

    fn fire_ckpt_stage(&mut self, stage: usize) -> Vec<Action> {
        let (msg_type, _) = CKPT_STAGES[stage];
        let mut msg = self.base_msg(msg_type);
        let mut payload = Vec::new();
        match msg_type {
            MessageType::DoSuspend => {
                payload = self.ckpt_dir.to_string_lossy().into_owned().into_bytes();
            }
            MessageType::DoFdLeaderElection => {
                msg.num_peers = self.workers.values().filter(|w| w.in_quorum).count() as u32;
            }
            _ => {}
        }
        tracing::debug!("broadcasting {:?}", msg_type);
        let mut actions = self.broadcast(msg, payload);
        actions.push(Action::ArmStageTimer);
        actions
    }

    fn fire_restart_stage(&mut self, stage: usize) -> Vec<Action> {
        let (msg_type, _) = RESTART_STAGES[stage];
        let msg = self.base_msg(msg_type);
        tracing::debug!("broadcasting {:?} (restart)", msg_type);
        let mut actions = self.broadcast(msg, Vec::new());
        actions.push(Action::ArmStageTimer);
        actions
    }

    /// All workers refilled: resume them, advance the timestamp, go idle.
    fn finish_cycle(&mut self) -> Vec<Action> {
        self.coord_timestamp = unix_nanos().max(self.coord_timestamp + 1);
        for record in self.workers.values_mut() {
            record.state = WorkerState::Running;
        }
        self.phase = Phase::Running;
        tracing::info!("cycle complete, new timestamp {}", self.coord_timestamp);
        let mut actions = self.broadcast(self.base_msg(MessageType::DoResume), Vec::new());
        actions.push(Action::DisarmStageTimer);
        actions.push(Action::ClearNameService);
        actions
    }

    /// Abandon the current cycle: kill every remaining worker and go idle.
    /// The timestamp is left untouched; an aborted cycle never advances it.
    fn abort_cycle(&mut self, reason: &str) -> Vec<Action> {
        tracing::warn!("aborting cycle: {}", reason);
        let mut actions = self.broadcast(self.base_msg(MessageType::KillPeer), Vec::new());
        for link in self.workers.keys().copied().collect::<Vec<_>>() {
            actions.push(Action::CloseLink { link });
        }
        self.workers.clear();
        self.phase = Phase::Running;
        actions.push(Action::DisarmStageTimer);
        actions.push(Action::ClearNameService);
        actions
    }

    fn broadcast(&self, msg: Message, payload: Vec<u8>) -> Vec<Action> {
        self.workers
            .keys()
            .map(|&link| Action::Send {
                link,
                msg: msg.clone(),
                payload: payload.clone(),
            })
            .collect()
    }

    fn record_ckpt_filename(&mut self, link: LinkId, payload: &[u8]) {
        if let Some(record) = self.workers.get_mut(&link) {
            let name = String::from_utf8_lossy(payload).into_owned();
            tracing::info!("worker {} wrote checkpoint {}", record.upid, name);
            record.ckpt_filename = Some(name);
        }
    }

    fn handle_user_cmd(&mut self, link: LinkId, msg: &Message) -> Vec<Action> {
        let mut reply = self.base_msg(MessageType::UserCmdResult);
        reply.num_peers = self.workers.len() as u32;
        reply.is_running = u32::from(!self.workers.is_empty() && self.phase == Phase::Running);

        let mut payload = Vec::new();
        let mut actions = Vec::new();
        match UserCommand::from_raw(msg.coord_cmd) {
            Some(UserCommand::Status) => {
                payload = self.status_text().into_bytes();
            }
            Some(UserCommand::Checkpoint) => match self.start_checkpoint() {
                Ok(cycle_actions) => actions = cycle_actions,
                Err(code) => reply.coord_cmd_status = code,
            },
            Some(UserCommand::SetInterval) => {
                if msg.checkpoint_interval != SAME_CKPT_INTERVAL {
                    self.checkpoint_interval_secs = msg.checkpoint_interval;
                    tracing::info!(
                        "checkpoint interval set to {}s",
                        self.checkpoint_interval_secs
                    );
                }
            }
            Some(UserCommand::ListPeers) => {
                payload = self.peer_list_text().into_bytes();
            }
            Some(UserCommand::Kill) => {
                actions = self.abort_cycle("kill requested by operator");
            }
            None => {
                reply.coord_cmd_status = cmd_status::ERROR_INVALID_COMMAND;
            }
        }

        let mut all = vec![Action::Send {
            link,
            msg: reply,
            payload,
        }];
        all.extend(actions);
        all
    }

    fn status_text(&self) -> String {
        let phase = match self.phase {
            Phase::Running => "RUNNING".to_string(),
            Phase::Ckpt { stage } => format!("CKPT[{:?}]", CKPT_STAGES[stage].0),
            Phase::Restart { stage: None, .. } => "RESTART[gathering]".to_string(),
            Phase::Restart {
                stage: Some(stage), ..
            } => format!("RESTART[{:?}]", RESTART_STAGES[stage].0),
        };
        format!(
            "phase={}\nworkers={}\ntimestamp={}\ninterval={}\nckpt_dir={}\n",
            phase,
            self.workers.len(),
            self.coord_timestamp,
            self.checkpoint_interval_secs,
            self.ckpt_dir.display()
        )
    }

    fn peer_list_text(&self) -> String {
        let mut peers: Vec<_> = self.workers.values().collect();
        peers.sort_by_key(|w| w.upid);
        let mut out = String::new();
        for worker in peers {
            out.push_str(&format!("{} {}\n", worker.upid, worker.state));
        }
        out
    }

    fn base_msg(&self, msg_type: MessageType) -> Message {
        let mut msg = Message::new(msg_type);
        msg.comp_group = self.comp_group.unwrap_or_default();
        msg.coord_timestamp = self.coord_timestamp;
        msg.checkpoint_interval = self.checkpoint_interval_secs;
        msg
    }
}

/// Same computation across restarts: generation may differ, the rest not.
fn same_computation(a: &UniquePid, b: &UniquePid) -> bool {
    a.host_id == b.host_id && a.pid == b.pid && a.start_ns == b.start_ns
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
