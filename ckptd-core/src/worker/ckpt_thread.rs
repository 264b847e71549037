use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::protocol::{MessageType, WorkerState};

use super::WorkerRuntime;

/// How long thread quiescence may take before the cycle is hopeless.
const SUSPEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Start the per-process checkpoint thread. The join handle is dropped on
/// purpose: the thread must never be joined, because on an exit-in-progress
/// cycle it parks forever instead of returning.
pub fn spawn_ckpt_thread(runtime: Arc<WorkerRuntime>, starts_restarted: bool) {
    let _ = std::thread::Builder::new()
        .name("ckpt".to_string())
        .spawn(move || run_ckpt_loop(runtime, starts_restarted));
}

fn run_ckpt_loop(runtime: Arc<WorkerRuntime>, starts_restarted: bool) {
    if starts_restarted {
        if let Err(err) = run_restart_tail(&runtime) {
            tracing::error!("restart barriers failed: {:#}", err);
            std::process::abort();
        }
    }
    loop {
        if let Err(err) = run_cycle(&runtime) {
            // Resource errors during checkpoint are fatal to the worker; the
            // coordinator sees the link close and aborts the cycle.
            tracing::error!("checkpoint cycle failed: {:#}", err);
            std::process::abort();
        }
    }
}

/// The exiting application thread may be tearing statics down; never run
/// destructors from here again.
fn detach_forever() -> ! {
    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// One full checkpoint cycle, stage 1 through stage 4.
fn run_cycle(runtime: &Arc<WorkerRuntime>) -> Result<()> {
    // stage1: wait for the suspend command, then stop the wrapper world.
    runtime.set_current_state(WorkerState::Running);
    let mut channel = runtime.channel.lock().expect("channel poisoned");

    let (suspend, payload) = channel.await_stage(MessageType::DoSuspend)?;
    if runtime.sync.exit_in_progress() {
        tracing::info!("exit in progress, checkpoint thread detaching");
        drop(channel);
        detach_forever();
    }
    let mut group = channel.comp_group();
    group.generation = suspend.comp_group.generation;
    channel.set_comp_group(group);
    if !payload.is_empty() {
        runtime.set_ckpt_dir(String::from_utf8_lossy(&payload).into_owned().into());
    }

    tracing::debug!("suspend received, acquiring wrapper lock");
    let wrapper_guard = runtime.sync.ckpt_exclusive();
    if runtime.sync.exit_in_progress() {
        drop(wrapper_guard);
        drop(channel);
        detach_forever();
    }

    // stage2: quiesce application threads, then walk the registry through
    // election, name-service pre-stages, drain, and the image write.
    let parked = runtime
        .roster
        .suspend_all(runtime.config.ckpt_signal, SUSPEND_TIMEOUT)?;
    tracing::debug!("{} application thread(s) parked", parked);
    runtime.set_current_state(WorkerState::Suspended);

    let mut registry = runtime.registry.lock().expect("registry poisoned");
    registry.prepare_ckpt()?;

    channel.send_ok(WorkerState::Suspended)?;
    channel.await_stage(MessageType::DoFdLeaderElection)?;
    registry.leader_election();
    runtime.set_current_state(WorkerState::FdLeaderElection);

    channel.send_ok(WorkerState::FdLeaderElection)?;
    channel.await_stage(MessageType::DoPreCkptNsRegister)?;
    registry.pre_ckpt_register(&mut *channel)?;
    runtime.set_current_state(WorkerState::PreCkptNsRegister);

    channel.send_ok(WorkerState::PreCkptNsRegister)?;
    channel.await_stage(MessageType::DoPreCkptNsQuery)?;
    registry.pre_ckpt_query(&mut *channel)?;
    runtime.set_current_state(WorkerState::PreCkptNsQuery);

    channel.send_ok(WorkerState::PreCkptNsQuery)?;
    channel.await_stage(MessageType::DoDrain)?;
    registry.drain()?;
    runtime.set_current_state(WorkerState::Drained);

    channel.send_ok(WorkerState::Drained)?;
    channel.await_stage(MessageType::DoCheckpoint)?;
    registry.exchange_peer_ids()?;
    let ckpt_dir = runtime.ckpt_dir.lock().expect("ckpt dir poisoned").clone();
    registry.write_ckpt_metadata(&ckpt_dir)?;
    let image = runtime.ckpt_image_path();
    let bytes = runtime
        .dumper
        .dump(&image)
        .with_context(|| format!("dump image to {}", image.display()))?;
    tracing::info!("image written: {} ({} bytes)", image.display(), bytes);
    channel.send_ckpt_filename(&image.to_string_lossy())?;

    // stage3 + stage4 are shared with the restart path.
    run_refill_stages(runtime, &mut channel, &mut registry, false)?;

    drop(registry);
    runtime.roster.release_all();
    drop(wrapper_guard);
    runtime.set_current_state(WorkerState::Running);
    Ok(())
}

/// Restart path: the worker rejoined at `Checkpointed` and only runs the
/// name-service, refill, and resume barriers.
fn run_restart_tail(runtime: &Arc<WorkerRuntime>) -> Result<()> {
    let mut channel = runtime.channel.lock().expect("channel poisoned");
    let mut registry = runtime.registry.lock().expect("registry poisoned");
    run_refill_stages(runtime, &mut channel, &mut registry, true)?;
    drop(registry);
    runtime.set_current_state(WorkerState::Running);
    Ok(())
}

fn run_refill_stages(
    runtime: &Arc<WorkerRuntime>,
    channel: &mut std::sync::MutexGuard<'_, super::CoordinatorChannel>,
    registry: &mut std::sync::MutexGuard<'_, crate::resource::ResourceRegistry>,
    is_restart: bool,
) -> Result<()> {
    runtime.set_current_state(WorkerState::Checkpointed);

    channel.send_ok(WorkerState::Checkpointed)?;
    channel.await_stage(MessageType::DoRegisterNsData)?;
    registry.register_ns(&mut **channel, is_restart)?;
    runtime.set_current_state(WorkerState::NsDataRegistered);

    channel.send_ok(WorkerState::NsDataRegistered)?;
    channel.await_stage(MessageType::DoSendQueries)?;
    registry.send_queries(&mut **channel, is_restart)?;
    runtime.set_current_state(WorkerState::DoneQuerying);

    channel.send_ok(WorkerState::DoneQuerying)?;
    channel.await_stage(MessageType::DoRefill)?;
    registry.refill(is_restart)?;
    runtime.set_current_state(WorkerState::Refilled);

    channel.send_ok(WorkerState::Refilled)?;
    channel.await_stage(MessageType::DoResume)?;
    registry.resume(is_restart)?;
    Ok(())
}
