//! `fusiond`: the process entry point (spec §5 "Concurrency & Resource
//! Model" thread inventory, §6 "External Interfaces"). Parses a single
//! `--config` flag, loads the on-disk configuration, takes the
//! single-instance lock, runs startup crash recovery, spawns every
//! long-running task the daemon needs, and blocks until a signal asks it
//! to stop.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fusion_core::config::{DaemonConfig, TaskRuleSet, TaskRuleStore, VolumesFile};
use fusion_core::ids::TaskIdGenerator;
use fusion_core::time::SystemClock;
use fusion_orchestrator::assets::manager::AssetManager;
use fusion_orchestrator::assets::notifier::AssetNotifier;
use fusion_orchestrator::lifecycle::{recover_from_prior_run, run_signal_loop, ExitFlag, SingletonLock};
use fusion_orchestrator::resources::manager::ResourceManager;
use fusion_orchestrator::resources::volume::VolumeManager;
use fusion_orchestrator::server::{
    run_asset_manager_listener, run_resource_manager_listener, AssetServerContext,
};
use fusion_wire::WireListener;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

const DEFAULT_CONFIG_PATH: &str = "/etc/fusion/fusiond.toml";

fn parse_config_path(mut args: impl Iterator<Item = String>) -> PathBuf {
    while let Some(arg) = args.next() {
        if let Some(value) = arg.strip_prefix("--config=") {
            return PathBuf::from(value);
        }
        if arg == "--config" {
            if let Some(value) = args.next() {
                return PathBuf::from(value);
            }
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

/// Installs the fmt/env-filter subscriber stack behind a `reload::Handle`
/// so `SIGHUP` can swap the filter without tearing anything down (spec
/// §5 thread 8 "Signal handler").
fn install_tracing(initial_level: &str) -> Arc<reload::Handle<EnvFilter, Registry>> {
    let filter = EnvFilter::try_new(initial_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .init();
    Arc::new(handle)
}

fn main() -> anyhow::Result<()> {
    let config_path = parse_config_path(std::env::args().skip(1));
    let config = DaemonConfig::load(&config_path)?;

    let log_level = Arc::new(Mutex::new(config.log_level.clone()));
    let log_filter = install_tracing(&config.log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, log_filter, log_level))
}

async fn run(
    config: DaemonConfig,
    log_filter: Arc<reload::Handle<EnvFilter, Registry>>,
    log_level: Arc<Mutex<String>>,
) -> anyhow::Result<()> {
    let state_dir = config.state_dir();
    let config_dir = config.config_dir();

    let _singleton = SingletonLock::acquire(&state_dir)?;
    info!(asset_root = %config.asset_root.display(), "fusiond starting up");

    let volumes_file = VolumesFile::load(&config.asset_root.join("volumes.toml"))?;
    let volumes = Arc::new(
        VolumeManager::new(volumes_file.volume, local_hostname()).with_state_dir(state_dir.clone()),
    );

    let task_rule_set = TaskRuleSet::load_dir(&config_dir)?;
    let task_rules = Arc::new(TaskRuleStore::new(task_rule_set));

    let id_gen = Arc::new(TaskIdGenerator::new());

    let (notifier, notifier_rx) = AssetNotifier::new(Arc::new(SystemClock));
    tokio::spawn(notifier.clone().run(notifier_rx));

    let (task_cmd_tx, task_cmd_rx) = mpsc::unbounded_channel();
    let (asset_notify_tx, mut asset_notify_rx) = mpsc::unbounded_channel();

    let asset_manager = Arc::new(AssetManager::new(
        config.asset_root.clone(),
        state_dir.clone(),
        notifier,
        task_cmd_tx,
        id_gen.clone(),
    ));

    let (resources, release_rx) = ResourceManager::new(
        volumes,
        task_rules.clone(),
        state_dir.clone(),
        Duration::from_secs(config.provider_timeout_secs),
        id_gen,
        asset_notify_tx,
    );

    recover_from_prior_run(&asset_manager).await?;

    let asset_listener = WireListener::bind(("0.0.0.0", config.asset_manager_port)).await?;
    let provider_listener = WireListener::bind(("0.0.0.0", config.resource_manager_port)).await?;

    let ctx = Arc::new(AssetServerContext {
        manager: asset_manager.clone(),
        config_dir,
        task_rules,
        mutex_timed_wait: Duration::from_secs(config.mutex_timed_wait_secs),
    });

    // Every long-running loop below selects on this alongside its normal
    // wait, so SIGINT/SIGTERM stops each one from dequeuing further work
    // rather than relying on implicit runtime teardown (spec §5
    // "Cancellation").
    let exit_flag = ExitFlag::new();

    // thread 1 "ClientListener" + thread 2 "AssetCmd" (spec §5).
    tokio::spawn(run_asset_manager_listener(asset_listener, ctx, exit_flag.clone()));
    // thread 4 "ProviderListener".
    tokio::spawn(run_resource_manager_listener(
        provider_listener,
        resources.clone(),
        exit_flag.clone(),
    ));
    // thread 5 "TaskCmd".
    tokio::spawn(resources.clone().run_task_cmd_loop(task_cmd_rx, exit_flag.clone()));
    // thread 6 "Release".
    tokio::spawn(resources.clone().run_release_loop(release_rx, exit_flag.clone()));
    // thread 7 "Activation".
    tokio::spawn(resources.clone().run_activation_loop(exit_flag.clone()));

    // Drains the Resource Manager's AssetCmd queue into the Asset
    // Manager's PendingAssetGuard transactions (spec §4.3 "Notify
    // surface"); this is the wire connecting threads 2 and 7.
    let notify_manager = asset_manager.clone();
    let notify_exit_flag = exit_flag.clone();
    tokio::spawn(async move {
        loop {
            let notify = tokio::select! {
                _ = notify_exit_flag.cancelled() => {
                    info!("asset notify drain loop stopping: shutdown requested");
                    return;
                }
                notify = asset_notify_rx.recv() => match notify {
                    Some(notify) => notify,
                    None => return,
                },
            };
            notify_manager.handle_resource_notify(notify).await;
        }
    });

    // thread 8 "Signal handler"; blocks until SIGINT/SIGTERM.
    run_signal_loop(exit_flag.clone(), log_filter, log_level).await?;

    info!("fusiond shutting down");
    Ok(())
}

fn local_hostname() -> String {
    std::env::var("FUSION_HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|s| s.trim().to_owned())
        })
        .unwrap_or_else(|| "localhost".to_owned())
}
