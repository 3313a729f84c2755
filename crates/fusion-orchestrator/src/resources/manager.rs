//! The Resource Manager: waiting queue, provider registry, volume
//! runtime, and the activation loop (spec §4.3). Grounded on
//! `original_source`'s `khResourceManager.cpp` for the activation
//! pseudocode; restructured as safe async Rust with `tokio::sync::Notify`
//! standing in for the original's condition variable (spec §9
//! "Coroutine-free concurrency": preserve the two-mutex partition and
//! the activation condition variable, don't collapse into shared async
//! state — here that partition is the resource-state `tokio::sync::Mutex`
//! held separately from the Asset Manager's own lock).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fusion_core::config::TaskRuleStore;
use fusion_core::error::{FusionError, Result};
use fusion_core::ids::{TaskId, TaskIdGenerator, VerRef};
use fusion_wire::{Message, MessageKind, WireChannel};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, trace, warn};

use crate::lifecycle::ExitFlag;
use crate::protocol::{resource_manager_commands as cmd, AssetNotify, JobDoneNotify, JobProgressNotify, StartJobRequest, TaskCommand, VolumeAvailNotify};
use crate::resources::provider::{ProviderHandle, ProviderProxy};
use crate::resources::queue::{QueueEntry, TaskWaitingQueue};
use crate::resources::requirements::TaskDef;
use crate::resources::reservation::{ReleaseEvent, Reservation};
use crate::resources::task::Task;
use crate::resources::volume::VolumeManager;

struct ResourceState {
    queue: TaskWaitingQueue,
    providers: HashMap<String, ProviderHandle>,
    tasks: HashMap<TaskId, Task>,
    verref_to_taskid: HashMap<VerRef, TaskId>,
}

pub struct ResourceManager {
    state: Mutex<ResourceState>,
    activation_signal: Notify,
    num_activate_blockers: AtomicU32,
    volumes: Arc<VolumeManager>,
    task_rules: Arc<TaskRuleStore>,
    state_dir: PathBuf,
    provider_timeout: Duration,
    id_gen: Arc<TaskIdGenerator>,
    asset_notify_tx: mpsc::UnboundedSender<AssetNotify>,
    release_tx: mpsc::UnboundedSender<ReleaseEvent>,
}

impl ResourceManager {
    pub fn new(
        volumes: Arc<VolumeManager>,
        task_rules: Arc<TaskRuleStore>,
        state_dir: PathBuf,
        provider_timeout: Duration,
        id_gen: Arc<TaskIdGenerator>,
        asset_notify_tx: mpsc::UnboundedSender<AssetNotify>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ReleaseEvent>) {
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            state: Mutex::new(ResourceState {
                queue: TaskWaitingQueue::new(),
                providers: HashMap::new(),
                tasks: HashMap::new(),
                verref_to_taskid: HashMap::new(),
            }),
            activation_signal: Notify::new(),
            num_activate_blockers: AtomicU32::new(0),
            volumes,
            task_rules,
            state_dir,
            provider_timeout,
            id_gen,
            asset_notify_tx,
            release_tx,
        });
        (manager, release_rx)
    }

    pub fn bump_up_blockers(&self) {
        self.num_activate_blockers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn bump_down_blockers(&self) {
        self.num_activate_blockers.fetch_sub(1, Ordering::SeqCst);
        self.activation_signal.notify_one();
    }

    fn blocked(&self) -> bool {
        self.num_activate_blockers.load(Ordering::SeqCst) > 0
    }

    /// Drives the `taskCmdQueue` (spec §5 thread 5 "TaskCmd"). Stops
    /// dequeuing once `exit_flag` is set (spec §5 "Cancellation").
    pub async fn run_task_cmd_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<TaskCommand>,
        exit_flag: ExitFlag,
    ) {
        loop {
            let command = tokio::select! {
                _ = exit_flag.cancelled() => {
                    info!("task command loop stopping: shutdown requested");
                    return;
                }
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => return,
                },
            };
            match command {
                TaskCommand::SubmitTask {
                    verref,
                    taskid,
                    priority,
                    taskdef,
                } => {
                    if let Err(err) = self.submit_task(&verref, TaskId(taskid), priority, taskdef).await {
                        warn!(verref = %verref, error = %err, "SubmitTask failed");
                    }
                }
                TaskCommand::DeleteTask { verref } => {
                    self.delete_task(&verref).await;
                }
                TaskCommand::BumpDownBlockers => {
                    self.bump_down_blockers();
                }
            }
            self.activation_signal.notify_one();
        }
    }

    /// Drains the reservation-release channel (spec §3 "Reservation"):
    /// every `Reservation::release`/`Drop` posts here instead of mutating
    /// shared state directly, so this loop is the single place that
    /// applies the effect. A `CleanupVolumePath` additionally asks the
    /// hosting provider to delete the abandoned file.
    pub async fn run_release_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ReleaseEvent>,
        exit_flag: ExitFlag,
    ) {
        loop {
            let event = tokio::select! {
                _ = exit_flag.cancelled() => {
                    info!("release loop stopping: shutdown requested");
                    return;
                }
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            match event {
                ReleaseEvent::ReleaseCpu { host, n } => {
                    let state = self.state.lock().await;
                    if let Some(provider) = state.providers.get(&host) {
                        provider.release_cpu(n);
                    }
                }
                ReleaseEvent::ReleaseVolume { volume, path } => {
                    self.volumes.release(&volume, &path);
                    self.push_volume_reservations(&volume).await;
                }
                ReleaseEvent::CleanupVolumePath { volume, path } => {
                    self.volumes.release(&volume, &path);
                    self.push_volume_reservations(&volume).await;
                    let host = self.volumes.volume_host(&volume).map(str::to_owned);
                    let provider = match host {
                        Some(host) => {
                            let state = self.state.lock().await;
                            state.providers.get(&host).cloned()
                        }
                        None => None,
                    };
                    if let Some(provider) = provider {
                        let timeout = self.provider_timeout;
                        let volume = volume.clone();
                        tokio::spawn(async move {
                            if let Err(err) = provider.clean_path(&path, timeout).await {
                                warn!(volume, error = %err, "CleanPath failed after reservation drop");
                            }
                        });
                    }
                }
            }
            self.activation_signal.notify_one();
        }
    }

    /// `SubmitTask(verref, taskid, priority, taskdef)` (spec §4.3): an
    /// existing task for `verref` is deleted first, then the new task is
    /// constructed. A construction failure synthesises an immediate
    /// `TaskDone(success=false)`.
    pub async fn submit_task(
        &self,
        verref: &str,
        taskid: TaskId,
        priority: i32,
        taskdef: TaskDef,
    ) -> Result<()> {
        self.delete_task(verref).await;
        let verref_parsed = VerRef::parse(verref)
            .ok_or_else(|| FusionError::client_request("SubmitTask", format!("malformed verref `{verref}`")))?;
        let rule = {
            let rules = self.task_rules.current();
            rules
                .lookup(verref_parsed.asset().as_str(), "build")
                .cloned()
        };
        let task = match Task::new(
            taskid,
            verref_parsed.clone(),
            priority,
            taskdef,
            rule.as_ref(),
            &self.volumes,
            &self.state_dir,
            Instant::now(),
        ) {
            Ok(task) => task,
            Err(err) => {
                self.id_gen.observe(taskid);
                self.bump_up_blockers();
                let _ = self.asset_notify_tx.send(AssetNotify::TaskDone {
                    verref: verref.to_owned(),
                    taskid: taskid.0,
                    success: false,
                });
                return Err(err);
            }
        };
        self.id_gen.observe(taskid);
        let entry = QueueEntry {
            priority,
            submit_time: task.submit_time,
            taskid,
            verref: verref_parsed.clone(),
        };
        let mut state = self.state.lock().await;
        state.tasks.insert(taskid, task);
        state.verref_to_taskid.insert(verref_parsed, taskid);
        state.queue.insert(entry);
        drop(state);
        self.activation_signal.notify_one();
        Ok(())
    }

    /// `DeleteTask(verref)` (spec §4.3): stop/release the task if
    /// present; if dispatched, send `StopJob` and move it to the
    /// provider's dead-map until acknowledged.
    pub async fn delete_task(&self, verref: &str) {
        let Some(verref_parsed) = VerRef::parse(verref) else {
            return;
        };
        let mut state = self.state.lock().await;
        let Some(taskid) = state.verref_to_taskid.remove(&verref_parsed) else {
            return;
        };
        state.queue.remove(taskid);
        let Some(mut task) = state.tasks.remove(&taskid) else {
            return;
        };
        if let Some(provider) = task.job_handler.take() {
            let reservations = std::iter::once(task.cpu_reservation.as_ref())
                .chain(task.volume_reservations.iter().map(Some))
                .flatten()
                .map(|r| r.kind().clone())
                .collect();
            provider.move_to_dead(taskid, reservations);
            let timeout = self.provider_timeout;
            tokio::spawn(async move {
                let _ = provider.stop_job(taskid, timeout).await;
            });
        }
        task.release_reservations();
    }

    pub async fn register_provider(&self, host: String, num_cpus: u32, channel: Arc<WireChannel>) -> ProviderHandle {
        let provider = ProviderProxy::new(host.clone(), num_cpus, channel);
        let mut state = self.state.lock().await;
        state.providers.insert(host.clone(), provider.clone());
        drop(state);
        info!(host = %host, num_cpus, "provider registered");
        // spec §4.4 "Connect": registration triggers a `ChangeVolumeReservations`
        // notify (possibly empty) to every volume whose host matches, so a
        // newly (re)connected provider starts from the orchestrator's view
        // of its reservations rather than whatever it remembers locally.
        for volume in self.volumes.get_host_volumes(&host) {
            self.push_volume_reservations(volume).await;
        }
        self.activation_signal.notify_one();
        provider
    }

    /// Sends the current serial/reservation map for `volume` to its
    /// hosting provider (spec §4.3 "Reservation serialisation"). Best
    /// effort: a send failure is logged and left to the provider's own
    /// liveness handling (a timed-out request marks the provider for
    /// abandonment) rather than retried here.
    async fn push_volume_reservations(&self, volume: &str) {
        let Some(host) = self.volumes.volume_host(volume).map(str::to_owned) else {
            return;
        };
        let provider = {
            let state = self.state.lock().await;
            state.providers.get(&host).cloned()
        };
        let Some(provider) = provider else {
            return;
        };
        let rt = self.volumes.snapshot(volume);
        let timeout = self.provider_timeout;
        let volume = volume.to_owned();
        tokio::spawn(async move {
            if let Err(err) = provider
                .change_volume_reservations(&volume, rt.serial, rt.reservations, timeout)
                .await
            {
                warn!(volume, error = %err, "ChangeVolumeReservations failed");
            }
        });
    }

    /// Tears down a provider connection: reinjects every active/dead
    /// task as `TaskLost`, clears its volumes' reservation state (spec
    /// §4.4 "Liveness").
    pub async fn abandon_provider(&self, host: &str) {
        let mut state = self.state.lock().await;
        let Some(provider) = state.providers.remove(host) else {
            return;
        };
        let lost_ids = provider.abandon();
        for taskid in lost_ids {
            if let Some(mut task) = state.tasks.remove(&taskid) {
                task.job_handler = None;
                task.release_reservations();
                let verref = task.verref.to_string();
                drop(task);
                state.verref_to_taskid.retain(|_, v| *v != taskid);
                self.bump_up_blockers();
                let _ = self.asset_notify_tx.send(AssetNotify::TaskLost {
                    verref,
                    taskid: taskid.0,
                });
            }
        }
        for volume in self.volumes.get_host_volumes(host) {
            self.volumes.clear_all(volume);
        }
        drop(state);
        warn!(host, "provider abandoned");
        self.activation_signal.notify_one();
    }

    /// Dispatches one inbound provider `Notify` (spec §4.4
    /// "Provider-to-orchestrator messages").
    pub async fn handle_provider_notify(&self, host: &str, message: Message) {
        if message.kind != MessageKind::Notify {
            return;
        }
        match message.command.as_str() {
            cmd::JOB_PROGRESS => {
                let Ok(notify) = serde_json::from_slice::<JobProgressNotify>(&message.payload) else {
                    return;
                };
                let mut state = self.state.lock().await;
                if let Some(task) = state.tasks.get_mut(&TaskId(notify.taskid)) {
                    task.progress = notify.progress;
                    let verref = task.verref.to_string();
                    drop(state);
                    let _ = self.asset_notify_tx.send(AssetNotify::TaskProgress {
                        verref,
                        taskid: notify.taskid,
                        progress: notify.progress,
                    });
                }
            }
            cmd::JOB_DONE => {
                let Ok(notify) = serde_json::from_slice::<JobDoneNotify>(&message.payload) else {
                    return;
                };
                let mut state = self.state.lock().await;
                if let Some(provider) = state.providers.get(host).cloned() {
                    provider.remove_active(TaskId(notify.taskid));
                    provider.ack_stop(TaskId(notify.taskid));
                }
                if let Some(mut task) = state.tasks.remove(&TaskId(notify.taskid)) {
                    task.release_reservations();
                    let verref = task.verref.to_string();
                    state.verref_to_taskid.remove(&task.verref);
                    drop(state);
                    self.bump_up_blockers();
                    let _ = self.asset_notify_tx.send(AssetNotify::TaskDone {
                        verref,
                        taskid: notify.taskid,
                        success: notify.success,
                    });
                }
            }
            cmd::VOLUME_AVAIL => {
                let Ok(notify) = serde_json::from_slice::<VolumeAvailNotify>(&message.payload) else {
                    return;
                };
                self.volumes.report_avail(&notify.volname, notify.serial, notify.avail);
            }
            other => {
                debug!(command = other, "unhandled provider notify");
            }
        }
        self.activation_signal.notify_one();
    }

    /// The activation loop (spec §4.3 pseudocode). Runs until the
    /// process exit flag is set.
    pub async fn run_activation_loop(self: Arc<Self>, exit_flag: ExitFlag) {
        loop {
            tokio::select! {
                _ = exit_flag.cancelled() => {
                    info!("activation loop stopping: shutdown requested");
                    return;
                }
                _ = self.activation_signal.notified() => {}
            }
            loop {
                if exit_flag.is_set() {
                    trace!("activation paused: shutdown requested");
                    break;
                }
                if self.blocked() {
                    trace!("activation paused: blockers pending");
                    break;
                }
                match self.try_activate_once().await {
                    Activated::Dispatched => continue,
                    Activated::NoProgress => break,
                }
            }
        }
    }

    /// One pass over the waiting queue in priority order. Returns
    /// `Dispatched` if a task was handed to a provider (the caller
    /// should re-enter immediately, per spec); `NoProgress` otherwise.
    async fn try_activate_once(&self) -> Activated {
        let mut state = self.state.lock().await;
        if state.queue.is_empty() || state.providers.is_empty() {
            return Activated::NoProgress;
        }

        let candidates: Vec<QueueEntry> = state.queue.iter_in_priority_order().cloned().collect();
        for entry in candidates {
            let Some(task) = state.tasks.get(&entry.taskid) else {
                continue;
            };
            if !check_volume_hosts(task, &state.providers) {
                trace!(taskid = entry.taskid.0, "CheckVolumeHosts failed");
                continue;
            }

            let fixed = match make_fixed_volume_reservations(self, task, &state.providers) {
                Some(res) => res,
                None => {
                    trace!(taskid = entry.taskid.0, "MakeFixedVolumeReservations failed");
                    continue;
                }
            };

            let required_host = task.requirements.required_build_host.clone();
            let preferred_host = task.requirements.preferred_build_host.clone();
            let candidate_hosts = find_satisfying_provider_order(&state.providers, required_host, preferred_host);

            let mut dispatched = None;
            for host in candidate_hosts {
                let Some(provider) = state.providers.get(&host).cloned() else {
                    continue;
                };
                if let Some(local) = provider_can_satisfy(self, task, &provider) {
                    dispatched = Some((provider, local));
                    break;
                }
            }

            let Some((provider, local_reservations)) = dispatched else {
                for r in fixed {
                    r.release();
                }
                continue;
            };

            let taskid = entry.taskid;
            state.queue.remove(taskid);
            let task = state.tasks.get_mut(&taskid).expect("task present");
            task.cpu_reservation = local_reservations.cpu;
            task.volume_reservations = fixed
                .into_iter()
                .chain(local_reservations.volumes.into_iter())
                .collect();
            task.job_handler = Some(provider.clone());
            task.begin_time = Some(Instant::now());
            provider.insert_active(taskid);

            let commands = task
                .taskdef
                .commands
                .iter()
                .map(|c| {
                    let mut argv = vec![c.program.clone()];
                    argv.extend(c.args.clone());
                    argv
                })
                .collect();
            let log_file = format!("{taskid}.log");
            let timeout = self.provider_timeout;

            // The Resource Manager mutex is held across this send (spec
            // §4.4): a `StartJob` failure must be diagnosed against the
            // exact state that produced it, and no other activation pass
            // may interleave with an in-flight dispatch to the same
            // provider.
            let start_req = StartJobRequest {
                taskid: taskid.0,
                log_file,
                commands,
            };
            match provider.start_job(start_req, timeout).await {
                Ok(()) => {
                    info!(taskid = taskid.0, host = %provider.host, "StartJob dispatched");
                    return Activated::Dispatched;
                }
                Err(err) => {
                    warn!(taskid = taskid.0, error = %err, "StartJob failed, provider will be abandoned");
                    return Activated::NoProgress;
                }
            }
        }
        Activated::NoProgress
    }
}

enum Activated {
    Dispatched,
    NoProgress,
}

/// Every host referenced by the task's inputs/outputs must currently be
/// a connected provider (spec §4.3 `CheckVolumeHosts`).
fn check_volume_hosts(task: &Task, providers: &HashMap<String, ProviderHandle>) -> bool {
    task.requirements
        .required_volume_hosts
        .iter()
        .all(|host| providers.contains_key(host))
}

/// For every output with an explicit (non-`*anytmp*`) volume, reserves
/// `size` bytes on that volume. Releases any partial reservations on the
/// first failure (spec §4.3 `MakeFixedVolumeReservations`).
fn make_fixed_volume_reservations(
    manager: &ResourceManager,
    task: &Task,
    providers: &HashMap<String, ProviderHandle>,
) -> Option<Vec<Reservation>> {
    let mut reserved = Vec::new();
    for output in &task.requirements.outputs {
        let Some(volume) = &output.volume else {
            continue;
        };
        match manager.volumes.try_reserve(volume, &output.path, output.size_estimate) {
            Some(_) => {
                spawn_push_volume_reservations(manager, providers, volume);
                reserved.push(Reservation::new_volume(
                    volume.clone(),
                    output.path.clone(),
                    output.size_estimate,
                    manager.release_tx.clone(),
                ));
            }
            None => {
                for r in reserved {
                    r.release();
                }
                return None;
            }
        }
    }
    Some(reserved)
}

/// Fire-and-forget `ChangeVolumeReservations` push used from inside the
/// activation pass, where the resource-state mutex is already held —
/// unlike `ResourceManager::push_volume_reservations`, this never
/// re-locks `state` (spec §4.3 "Reservation serialisation").
fn spawn_push_volume_reservations(manager: &ResourceManager, providers: &HashMap<String, ProviderHandle>, volume: &str) {
    let Some(host) = manager.volumes.volume_host(volume) else {
        return;
    };
    let Some(provider) = providers.get(host).cloned() else {
        return;
    };
    let rt = manager.volumes.snapshot(volume);
    let timeout = manager.provider_timeout;
    let volume = volume.to_owned();
    tokio::spawn(async move {
        if let Err(err) = provider
            .change_volume_reservations(&volume, rt.serial, rt.reservations, timeout)
            .await
        {
            warn!(volume, error = %err, "ChangeVolumeReservations failed");
        }
    });
}

/// Orders candidate hosts: if `requiredBuildHost` is set, it is the only
/// candidate; else `preferredBuildHost` first, then the rest in
/// insertion order (spec §4.3 `FindSatisfyingProvider`).
fn find_satisfying_provider_order(
    providers: &HashMap<String, ProviderHandle>,
    required_host: Option<String>,
    preferred_host: Option<String>,
) -> Vec<String> {
    if let Some(host) = required_host {
        return if providers.contains_key(&host) { vec![host] } else { vec![] };
    }
    let available: Vec<String> = providers
        .iter()
        .filter(|(_, p)| p.available_cpus() > 0)
        .map(|(h, _)| h.clone())
        .collect();
    match preferred_host {
        Some(preferred) if available.contains(&preferred) => {
            let mut ordered = vec![preferred.clone()];
            ordered.extend(available.into_iter().filter(|h| *h != preferred));
            ordered
        }
        _ => available,
    }
}

struct LocalReservations {
    cpu: Option<Reservation>,
    volumes: Vec<Reservation>,
}

/// Reserves CPUs, then places every `*anytmp*` output on a concrete tmp
/// volume (spec §4.3 `ProviderCanSatisfy`).
fn provider_can_satisfy(manager: &ResourceManager, task: &Task, provider: &ProviderHandle) -> Option<LocalReservations> {
    let cpu_grant = provider.try_reserve_cpu(task.requirements.cpu.min, task.requirements.cpu.max)?;
    let cpu_reservation = Reservation::new_cpu(provider.host.clone(), cpu_grant, manager.release_tx.clone());

    let mut volume_reservations = Vec::new();
    for output in &task.requirements.outputs {
        if output.volume.is_some() {
            continue;
        }
        let mut candidates: Vec<String> = if output.locality == fusion_core::config::Preference::Must {
            manager
                .volumes
                .get_local_tmp_volumes(&provider.host)
                .into_iter()
                .map(String::from)
                .collect()
        } else {
            let mut v: Vec<String> = manager
                .volumes
                .get_local_tmp_volumes(&provider.host)
                .into_iter()
                .map(String::from)
                .collect();
            v.extend(
                manager
                    .volumes
                    .get_remote_tmp_volumes(&provider.host)
                    .into_iter()
                    .map(String::from),
            );
            v
        };
        apply_different_volume_prefs(&mut candidates, task, output);

        let mut placed = false;
        for candidate in &candidates {
            if manager.volumes.try_reserve(candidate, &output.path, output.size_estimate).is_some() {
                let provider = provider.clone();
                let rt = manager.volumes.snapshot(candidate);
                let timeout = manager.provider_timeout;
                let candidate_name = candidate.clone();
                tokio::spawn(async move {
                    if let Err(err) = provider
                        .change_volume_reservations(&candidate_name, rt.serial, rt.reservations, timeout)
                        .await
                    {
                        warn!(volume = candidate_name, error = %err, "ChangeVolumeReservations failed");
                    }
                });
                volume_reservations.push(Reservation::new_volume(
                    candidate.clone(),
                    output.path.clone(),
                    output.size_estimate,
                    manager.release_tx.clone(),
                ));
                placed = true;
                break;
            }
        }
        if !placed {
            cpu_reservation.release();
            for r in volume_reservations {
                r.release();
            }
            return None;
        }
    }

    Some(LocalReservations {
        cpu: Some(cpu_reservation),
        volumes: volume_reservations,
    })
}

fn apply_different_volume_prefs(
    candidates: &mut Vec<String>,
    task: &Task,
    output: &crate::resources::requirements::ResolvedOutput,
) {
    for (index, pref) in output.different_volumes.iter().enumerate() {
        let Some(input) = task.requirements.inputs.get(index) else {
            continue;
        };
        match pref {
            fusion_core::config::Preference::Must => candidates.retain(|c| c != &input.volume),
            fusion_core::config::Preference::Prefer => {
                if let Some(pos) = candidates.iter().position(|c| c == &input.volume) {
                    let v = candidates.remove(pos);
                    candidates.push(v);
                }
            }
            fusion_core::config::Preference::DontCare => {}
        }
    }
}
