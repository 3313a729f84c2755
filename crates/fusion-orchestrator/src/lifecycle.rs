//! Process-wide lifecycle concerns that don't belong to either manager
//! (spec §5 "Concurrency & Resource Model", thread 8 "Signal handler"):
//! the single-instance lock, startup crash recovery, and signal-driven
//! shutdown/reload.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fusion_core::error::{FusionError, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::assets::manager::AssetManager;

/// A filesystem lock file held for the daemon's whole lifetime
/// (`<state>/active`, spec §4.4 "Startup recovery"): its presence at
/// startup with no matching process alive is recovered from by
/// overwriting it; normal shutdown removes it.
pub struct SingletonLock {
    path: PathBuf,
}

impl SingletonLock {
    /// Acquires the lock by creating `<state>/active` exclusively. If it
    /// already exists, this is a fatal error — spec §4.4 treats a second
    /// live instance as unrecoverable, not something to wait out.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .map_err(|err| FusionError::fatal(format!("cannot create state dir: {err}")))?;
        let path = state_dir.join("active");
        let mut open_opts = std::fs::OpenOptions::new();
        open_opts.write(true).create_new(true);
        match open_opts.open(&path) {
            Ok(mut file) => {
                use std::io::Write;
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(FusionError::fatal(format!(
                "another instance is already running ({} exists)",
                path.display()
            ))),
            Err(err) => Err(FusionError::fatal(format!("cannot create singleton lock: {err}"))),
        }
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Scans `<state>/*.task` symlinks left over from a previous run and
/// replays each as a `TaskLost` before the Resource Manager starts
/// accepting new work (spec §4.4 "Startup recovery").
pub async fn recover_from_prior_run(manager: &AssetManager) -> Result<()> {
    manager.recover_from_symlinks().await
}

struct ExitFlagInner {
    flag: AtomicBool,
    notify: tokio::sync::Notify,
}

/// The global exit flag every long-running loop selects on alongside its
/// normal wait (spec §5: SIGINT/SIGTERM "cascade wake-ups through every
/// queue" rather than killing threads outright) — each loop's
/// `tokio::select!` treats `cancelled()` resolving as "stop dequeuing new
/// work", matching §5 "Cancellation".
#[derive(Clone)]
pub struct ExitFlag(Arc<ExitFlagInner>);

impl Default for ExitFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitFlag {
    pub fn new() -> Self {
        Self(Arc::new(ExitFlagInner {
            flag: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        }))
    }

    pub fn is_set(&self) -> bool {
        self.0.flag.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.0.flag.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    /// Resolves once the flag is set, racily-safe against a `set()` that
    /// happens between the `is_set()` check and the wait (the `enable()`
    /// dance tokio's own docs recommend for `Notify`).
    pub async fn cancelled(&self) {
        let notified = self.0.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_set() {
            return;
        }
        notified.await;
    }
}

/// Installs SIGINT/SIGTERM/SIGHUP handling. SIGINT and SIGTERM set the
/// exit flag; SIGHUP reloads the log level from `log_level` without
/// touching task rules (spec §5 thread 8 — a narrower reload than the
/// client-facing `ReloadConfig` request, which reloads task rules
/// instead).
pub async fn run_signal_loop(exit_flag: ExitFlag, log_filter: Arc<tracing_subscriber::reload::Handle<EnvFilter, tracing_subscriber::Registry>>, log_level: Arc<std::sync::Mutex<String>>) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|err| FusionError::fatal(format!("cannot install SIGINT handler: {err}")))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|err| FusionError::fatal(format!("cannot install SIGTERM handler: {err}")))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|err| FusionError::fatal(format!("cannot install SIGHUP handler: {err}")))?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                exit_flag.set();
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                exit_flag.set();
                return Ok(());
            }
            _ = sighup.recv() => {
                let level = log_level.lock().expect("log level mutex poisoned").clone();
                match EnvFilter::try_new(&level) {
                    Ok(filter) => {
                        if let Err(err) = log_filter.reload(filter) {
                            warn!(error = %err, "failed to apply reloaded log level");
                        } else {
                            info!(level, "SIGHUP received, log level reloaded");
                        }
                    }
                    Err(err) => warn!(level, error = %err, "invalid log level in config, ignoring SIGHUP reload"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquiring_the_lock_twice_fails() {
        let dir = std::env::temp_dir().join(format!(
            "fusion-orchestrator-lifecycle-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let first = SingletonLock::acquire(&dir).unwrap();
        let second = SingletonLock::acquire(&dir);
        assert!(second.is_err());
        drop(first);
        assert!(SingletonLock::acquire(&dir).is_ok());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn exit_flag_starts_clear() {
        let flag = ExitFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_once_already_set() {
        let flag = ExitFlag::new();
        flag.set();
        tokio::time::timeout(std::time::Duration::from_millis(50), flag.cancelled())
            .await
            .expect("cancelled() must not block once the flag is already set");
    }

    #[tokio::test]
    async fn cancelled_wakes_a_waiter_once_set_from_elsewhere() {
        let flag = ExitFlag::new();
        let waiter_flag = flag.clone();
        let waiter = tokio::spawn(async move {
            waiter_flag.cancelled().await;
        });
        tokio::task::yield_now().await;
        flag.set();
        tokio::time::timeout(std::time::Duration::from_millis(500), waiter)
            .await
            .expect("waiter must wake up once set() is called")
            .unwrap();
    }
}
