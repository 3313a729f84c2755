//! End-to-end scenarios from spec §8 that need the wire protocol, the
//! Resource Manager, and a (fake) provider agent wired together over a
//! real TCP loopback connection — the pieces each crate's own unit tests
//! exercise in isolation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fusion_core::config::{TaskRuleSet, TaskRuleStore, VolumeEntry};
use fusion_core::ids::{AssetRef, TaskId, TaskIdGenerator};
use fusion_core::time::MockClock;
use fusion_orchestrator::assets::manager::AssetManager;
use fusion_orchestrator::assets::model::VersionState;
use fusion_orchestrator::assets::notifier::AssetNotifier;
use fusion_orchestrator::lifecycle::ExitFlag;
use fusion_orchestrator::protocol::{
    resource_manager_commands as rm_cmd, AssetNotify, ProviderConnectNotify, StartJobRequest,
};
use fusion_orchestrator::resources::manager::ResourceManager;
use fusion_orchestrator::resources::requirements::{CommandTemplate, InputSpec, OutputSpec, TaskDef};
use fusion_orchestrator::resources::volume::VolumeManager;
use fusion_orchestrator::server::run_resource_manager_listener;
use fusion_wire::{validate_protocol_version, CommandName, Message, MessageKind, WireChannel, WireListener};
use tokio::sync::mpsc;

fn tempdir(label: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "fusion-orchestrator-scenarios-{label}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// A minimal fake provider agent: connects, passes the version gate,
/// registers with `ProviderConnect`, and answers every inbound `Request`
/// with an empty `Reply` unless told otherwise by the test driving it.
struct FakeProvider {
    channel: WireChannel,
}

impl FakeProvider {
    async fn connect(addr: std::net::SocketAddr, host: &str, num_cpus: u32) -> Self {
        let channel = WireChannel::connect(addr).await.unwrap();
        let gate = Message::request(1, CommandName::new("ValidateProtocolVersion").unwrap(), b"1".to_vec());
        channel.send(&gate).await.unwrap();
        let reply = channel.recv().await.unwrap().unwrap();
        assert_eq!(reply.kind, MessageKind::Reply);

        let connect = ProviderConnectNotify {
            host: host.to_owned(),
            num_cpus,
            fusion_version: "1".to_owned(),
        };
        let msg = Message::notify(
            CommandName::new(rm_cmd::PROVIDER_CONNECT).unwrap(),
            serde_json::to_vec(&connect).unwrap(),
        );
        channel.send(&msg).await.unwrap();
        Self { channel }
    }

    /// Drains inbound `Request`s until `StartJob` arrives, acking every
    /// other request (`ChangeVolumeReservations` etc.) with an empty
    /// `Reply` along the way.
    async fn await_start_job(&self) -> StartJobRequest {
        loop {
            let message = self.channel.recv().await.unwrap().unwrap();
            assert_eq!(message.kind, MessageKind::Request);
            if message.command.as_str() == rm_cmd::START_JOB {
                let req: StartJobRequest = serde_json::from_slice(&message.payload).unwrap();
                let reply = Message::reply(message.serial, message.command.clone(), Vec::new());
                self.channel.send(&reply).await.unwrap();
                return req;
            }
            let reply = Message::reply(message.serial, message.command.clone(), Vec::new());
            self.channel.send(&reply).await.unwrap();
        }
    }

    /// Acks exactly one inbound `Request` without inspecting it (used to
    /// drain the registration-time `ChangeVolumeReservations` push before
    /// a test closes the connection).
    async fn ack_one(&self) {
        let message = self.channel.recv().await.unwrap().unwrap();
        let reply = Message::reply(message.serial, message.command.clone(), Vec::new());
        self.channel.send(&reply).await.unwrap();
    }

    async fn close(self) {
        let _ = self.channel.shutdown().await;
    }
}

fn fixed_output_taskdef(volume: &str, path: &str, size: u64) -> TaskDef {
    TaskDef {
        inputs: vec![InputSpec {
            uri: format!("khfile://{volume}/in"),
        }],
        outputs: vec![OutputSpec {
            path: path.to_owned(),
            volume: Some(volume.to_owned()),
            size_estimate: size,
        }],
        commands: vec![CommandTemplate {
            program: "echo".to_owned(),
            args: vec!["$OUTPUT".to_owned()],
        }],
    }
}

async fn spawn_resource_stack(
    state_dir: PathBuf,
) -> (
    Arc<ResourceManager>,
    Arc<VolumeManager>,
    std::net::SocketAddr,
    mpsc::UnboundedReceiver<AssetNotify>,
) {
    let volumes = Arc::new(
        VolumeManager::new(
            vec![VolumeEntry {
                name: "vol_a".to_owned(),
                host: "h1".to_owned(),
                netpath: "/net/vol_a".to_owned(),
                localpath: "/data/vol_a".to_owned(),
                is_tmp: false,
            }],
            "h1",
        )
        .with_state_dir(state_dir.clone()),
    );
    volumes.report_avail("vol_a", 0, 2048);

    let task_rules = Arc::new(TaskRuleStore::new(TaskRuleSet::default()));
    let id_gen = Arc::new(TaskIdGenerator::new());
    let (asset_notify_tx, asset_notify_rx) = mpsc::unbounded_channel();

    let (resources, release_rx) = ResourceManager::new(
        volumes.clone(),
        task_rules,
        state_dir,
        Duration::from_secs(5),
        id_gen,
        asset_notify_tx,
    );

    let exit_flag = ExitFlag::new();
    tokio::spawn(resources.clone().run_release_loop(release_rx, exit_flag.clone()));
    tokio::spawn(resources.clone().run_activation_loop(exit_flag.clone()));

    let listener = WireListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_resource_manager_listener(listener, resources.clone(), exit_flag));

    (resources, volumes, addr, asset_notify_rx)
}

/// Spec §8 scenario 2, "Task submission round trip": one provider
/// registered on host `h1` owning `vol_a` (avail 2048, 2 CPUs); a task
/// with one fixed-volume output of 1024 bytes is submitted. Expect a
/// `StartJob` naming that task's id, and `vol_a` to carry a 1024-byte
/// reservation afterwards.
#[tokio::test]
async fn task_submission_round_trip_dispatches_start_job_and_reserves_the_volume() {
    let state_dir = tempdir("submit");
    let (resources, volumes, addr, _asset_notify_rx) = spawn_resource_stack(state_dir.clone()).await;

    let provider = FakeProvider::connect(addr, "h1", 2).await;
    // Registration triggers one `ChangeVolumeReservations` push for
    // `vol_a` (spec §4.4 "Connect") before any task exists.
    provider.ack_one().await;

    let taskdef = fixed_output_taskdef("vol_a", "khfile://vol_a/out", 1024);
    resources
        .submit_task("Imagery/Foo?version=1", TaskId(42), 0, taskdef)
        .await
        .unwrap();

    let start = provider.await_start_job().await;
    assert_eq!(start.taskid, 42);

    let snapshot = volumes.snapshot("vol_a");
    assert_eq!(snapshot.reservations.get("khfile://vol_a/out"), Some(&1024));
    assert!(snapshot.serial >= 1);

    provider.close().await;
    let _ = std::fs::remove_dir_all(&state_dir);
}

/// Spec §8 scenario 3, "Provider loss": while a task is active on a
/// provider, the connection drops. Expect the task to be reported as
/// `TaskLost` (not `TaskDone`) so the Asset Manager re-queues it, and the
/// hosting volume's reservations to be cleared.
#[tokio::test]
async fn provider_disconnect_reinjects_its_tasks_as_lost_and_clears_its_volumes() {
    let state_dir = tempdir("lost");
    let (resources, volumes, addr, mut asset_notify_rx) = spawn_resource_stack(state_dir.clone()).await;

    let provider = FakeProvider::connect(addr, "h1", 2).await;
    provider.ack_one().await;

    let taskdef = fixed_output_taskdef("vol_a", "khfile://vol_a/out", 512);
    resources
        .submit_task("Imagery/Bar?version=1", TaskId(7), 0, taskdef)
        .await
        .unwrap();
    let start = provider.await_start_job().await;
    assert_eq!(start.taskid, 7);
    assert!(!volumes.snapshot("vol_a").reservations.is_empty());

    provider.close().await;

    let notify = tokio::time::timeout(Duration::from_secs(5), asset_notify_rx.recv())
        .await
        .expect("TaskLost notify within timeout")
        .expect("channel open");
    match notify {
        AssetNotify::TaskLost { verref, taskid } => {
            assert_eq!(verref, "Imagery/Bar?version=1");
            assert_eq!(taskid, 7);
        }
        other => panic!("expected TaskLost, got {other:?}"),
    }

    // Give the release loop a moment to drain the reservation clear.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(volumes.snapshot("vol_a").reservations.is_empty());

    let _ = std::fs::remove_dir_all(&state_dir);
}

/// Spec §8 scenario 5, "Recovery": a `<state>/<taskid>.task` symlink left
/// over from a previous run is replayed as `TaskLost` at startup, and the
/// symlink is removed.
#[tokio::test]
async fn startup_recovery_replays_orphaned_task_symlinks_as_task_lost() {
    let dir = tempdir("recovery");
    let asset_root = dir.join("assets");
    let state_dir = dir.join(".state");
    std::fs::create_dir_all(&state_dir).unwrap();

    let clock: Arc<dyn fusion_core::time::Clock> = Arc::new(MockClock::new());
    let (notifier, notifier_rx) = AssetNotifier::new(clock);
    tokio::spawn(notifier.clone().run(notifier_rx));
    let (task_cmd_tx, mut task_cmd_rx) = mpsc::unbounded_channel();
    let manager = AssetManager::new(
        asset_root,
        state_dir.clone(),
        notifier,
        task_cmd_tx,
        Arc::new(TaskIdGenerator::new()),
    );

    let verref = AssetRef::new("Imagery/Recovered").version(3);
    {
        let mut guard = manager.open();
        let mut version = fusion_orchestrator::assets::model::AssetVersion::new(verref.clone());
        version.state = VersionState::InProgress;
        version.taskid = Some(TaskId(100));
        guard.put_version(version);
        guard.commit().unwrap();
    }
    let _ = task_cmd_rx.try_recv();

    #[cfg(unix)]
    std::os::unix::fs::symlink(verref.to_string(), state_dir.join("100.task")).unwrap();
    #[cfg(not(unix))]
    std::fs::write(state_dir.join("100.task"), verref.to_string()).unwrap();

    manager.recover_from_symlinks().await.unwrap();

    let version = manager.get_version(&verref).unwrap();
    assert_eq!(version.state, VersionState::Waiting);
    assert!(version.taskid.is_none());
    assert!(!state_dir.join("100.task").exists());

    // `TaskLost` handling also bumps and drops a blocker.
    let cmd = task_cmd_rx.try_recv().unwrap();
    assert!(matches!(
        cmd,
        fusion_orchestrator::protocol::TaskCommand::BumpDownBlockers
    ));

    let _ = std::fs::remove_dir_all(&dir);
}

/// Spec §4.4 "Connect" / §8 boundary behaviours: a provider whose
/// `ProviderConnect.fusion_version` differs from the orchestrator's own
/// must be rejected — the connection is closed, not registered — even
/// though it already passed the wire-level `ValidateProtocolVersion`
/// gate.
#[tokio::test]
async fn provider_connect_with_mismatched_fusion_version_is_rejected() {
    let state_dir = tempdir("version-mismatch");
    let (_resources, _volumes, addr, _asset_notify_rx) = spawn_resource_stack(state_dir.clone()).await;

    let channel = WireChannel::connect(addr).await.unwrap();
    let gate = Message::request(1, CommandName::new("ValidateProtocolVersion").unwrap(), b"1".to_vec());
    channel.send(&gate).await.unwrap();
    let reply = channel.recv().await.unwrap().unwrap();
    assert_eq!(reply.kind, MessageKind::Reply);

    let connect = ProviderConnectNotify {
        host: "h1".to_owned(),
        num_cpus: 2,
        fusion_version: "not-the-right-version".to_owned(),
    };
    let msg = Message::notify(
        CommandName::new(rm_cmd::PROVIDER_CONNECT).unwrap(),
        serde_json::to_vec(&connect).unwrap(),
    );
    channel.send(&msg).await.unwrap();

    // The orchestrator closes the connection instead of registering it.
    let closed = tokio::time::timeout(Duration::from_secs(5), channel.recv())
        .await
        .expect("server closes connection within timeout")
        .unwrap();
    assert!(closed.is_none());

    let _ = std::fs::remove_dir_all(&state_dir);
}

/// Spec §8 "Version gate": a client that opens with a mismatched
/// protocol version gets an `Exception` and the connection is then
/// closed by the server.
#[tokio::test]
async fn version_gate_rejects_mismatched_client_and_closes_the_connection() {
    let listener = WireListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (channel, _peer) = listener.accept().await.unwrap();
        let err = validate_protocol_version(&channel, "1").await.unwrap_err();
        assert!(err.to_string().contains("Invalid protocol version"));
    });

    let client = WireChannel::connect(addr).await.unwrap();
    let gate = Message::request(1, CommandName::new("ValidateProtocolVersion").unwrap(), b"0.0.0".to_vec());
    client.send(&gate).await.unwrap();
    let reply = client.recv().await.unwrap().unwrap();
    assert_eq!(reply.kind, MessageKind::Exception);
    assert!(reply.exception_text().unwrap().contains("Invalid protocol version"));

    // The server closes its side after the mismatch; the next read sees EOF.
    assert!(client.recv().await.unwrap().is_none());
    server.await.unwrap();
}

