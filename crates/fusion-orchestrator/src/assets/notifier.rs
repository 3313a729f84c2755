//! Change-broadcast fan-out for `AssetChanges` (spec §4.2 "Change
//! broadcast", §5 thread 3 "AssetNotifier"). A committed transaction's
//! change set is queued here; the notifier thread waits out a minimum
//! 2-second NFS-visibility delay from the transaction's origin time, then
//! fans the change out to every registered listener with a 4-second
//! per-listener send budget, dropping any listener that fails or times
//! out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fusion_core::ids::VerRef;
use fusion_core::time::Clock;
use fusion_wire::{CommandName, Message, WireChannel};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::assets::model::VersionState;

pub const MIN_NOTIFY_DELAY: Duration = Duration::from_secs(2);
pub const LISTENER_SEND_TIMEOUT: Duration = Duration::from_secs(4);

/// The union of serialised assets, state changes, and progress updates
/// from one committed transaction (spec §4.2 step 3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetChanges {
    pub assets: Vec<String>,
    pub state_changes: HashMap<String, VersionState>,
    pub progress: HashMap<String, f32>,
}

impl AssetChanges {
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty() && self.state_changes.is_empty() && self.progress.is_empty()
    }

    /// Later progress values overwrite earlier ones for the same verref
    /// within one pending window (spec §5 "Ordering guarantees").
    pub fn merge(&mut self, other: AssetChanges) {
        self.assets.extend(other.assets);
        self.state_changes.extend(other.state_changes);
        self.progress.extend(other.progress);
    }

    pub fn record_state_change(&mut self, verref: &VerRef, state: VersionState) {
        self.state_changes.insert(verref.to_string(), state);
    }

    pub fn record_progress(&mut self, verref: &VerRef, progress: f32) {
        self.progress.insert(verref.to_string(), progress);
    }
}

struct PendingChange {
    changes: AssetChanges,
    origin: Instant,
}

/// Registered listener sockets plus the queue feeding the notifier loop.
pub struct AssetNotifier {
    listeners: DashMap<u64, Arc<WireChannel>>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    min_delay: Duration,
    listener_timeout: Duration,
    tx: mpsc::UnboundedSender<PendingChange>,
}

impl AssetNotifier {
    pub fn new(clock: Arc<dyn Clock>) -> (Arc<Self>, mpsc::UnboundedReceiver<PendingChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = Arc::new(Self {
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
            clock,
            min_delay: MIN_NOTIFY_DELAY,
            listener_timeout: LISTENER_SEND_TIMEOUT,
            tx,
        });
        (notifier, rx)
    }

    pub fn register(&self, channel: Arc<WireChannel>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, channel);
        id
    }

    pub fn unregister(&self, id: u64) {
        self.listeners.remove(&id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Enqueues a committed transaction's changes. `origin` is the
    /// transaction's commit time; the notifier loop enforces the minimum
    /// delay relative to it before sending.
    pub fn enqueue(&self, changes: AssetChanges) {
        if changes.is_empty() {
            return;
        }
        let origin = self.clock.now();
        let _ = self.tx.send(PendingChange { changes, origin });
    }

    /// Drives the notifier loop: pop a pending change, wait out the
    /// remaining minimum delay, then fan out. Runs until the channel
    /// closes (process shutdown).
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PendingChange>) {
        while let Some(pending) = rx.recv().await {
            let elapsed = self.clock.now().saturating_duration_since(pending.origin);
            if elapsed < self.min_delay {
                tokio::time::sleep(self.min_delay - elapsed).await;
            }
            self.fan_out(&pending.changes).await;
        }
    }

    async fn fan_out(&self, changes: &AssetChanges) {
        let payload = match serde_json::to_vec(changes) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to serialise AssetChanges, dropping broadcast");
                return;
            }
        };
        let command = CommandName::new("AssetChanges").expect("literal command name fits");
        let message = Message::notify(command, payload);
        let mut dead = Vec::new();
        for entry in self.listeners.iter() {
            let id = *entry.key();
            let channel = entry.value().clone();
            let result =
                tokio::time::timeout(self.listener_timeout, channel.send(&message)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(listener = id, error = %err, "listener send failed, dropping");
                    dead.push(id);
                }
                Err(_) => {
                    debug!(listener = id, "listener send timed out, dropping");
                    dead.push(id);
                }
            }
        }
        for id in dead {
            self.listeners.remove(&id);
        }
    }
}
