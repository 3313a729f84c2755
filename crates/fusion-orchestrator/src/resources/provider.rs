//! Per-connection state for one remote resource-provider agent (spec
//! §4.4). Grounded on the teacher's per-connection proxy (one map of
//! live work owned per connection, sends serialised through the proxy)
//! and on `original_source`'s `khResourceProviderProxy.cpp` for the
//! active/dead-map split and abandonment semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fusion_core::error::{FusionError, Result};
use fusion_core::ids::TaskId;
use fusion_wire::{CommandName, Message, MessageKind, WireChannel};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use crate::protocol::{
    resource_manager_commands as cmd, ChangeVolumeReservationsRequest, CleanPathRequest,
    CleanupVolumeRequest, StartJobRequest, StopJobRequest,
};
use crate::resources::reservation::ReservationKind;

pub type ProviderHandle = Arc<ProviderProxy>;

/// One connected provider agent (spec §3 "Provider Registration").
pub struct ProviderProxy {
    pub host: String,
    pub num_cpus: u32,
    used_cpus: Mutex<u32>,
    active_map: DashMap<TaskId, ()>,
    dead_map: DashMap<TaskId, Vec<ReservationKind>>,
    want_abandon: AtomicBool,
    cleaned: AtomicBool,
    channel: Arc<WireChannel>,
    next_serial: Mutex<u32>,
    pending: DashMap<u32, oneshot::Sender<Message>>,
}

impl ProviderProxy {
    pub fn new(host: impl Into<String>, num_cpus: u32, channel: Arc<WireChannel>) -> ProviderHandle {
        Arc::new(Self {
            host: host.into(),
            num_cpus,
            used_cpus: Mutex::new(0),
            active_map: DashMap::new(),
            dead_map: DashMap::new(),
            want_abandon: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            channel,
            next_serial: Mutex::new(1),
            pending: DashMap::new(),
        })
    }

    pub fn used_cpus(&self) -> u32 {
        *self.used_cpus.lock()
    }

    pub fn available_cpus(&self) -> u32 {
        self.num_cpus.saturating_sub(self.used_cpus())
    }

    pub fn wants_abandon(&self) -> bool {
        self.want_abandon.load(Ordering::Acquire)
    }

    /// Reserves between `min` and `max` CPUs, granting as many as are
    /// available up to `max` (spec §4.3 `ProviderCanSatisfy`).
    pub fn try_reserve_cpu(&self, min: u32, max: u32) -> Option<u32> {
        let mut used = self.used_cpus.lock();
        let avail = self.num_cpus.saturating_sub(*used);
        if avail < min {
            return None;
        }
        let grant = avail.min(max).max(min);
        *used += grant;
        Some(grant)
    }

    pub fn release_cpu(&self, n: u32) {
        let mut used = self.used_cpus.lock();
        *used = used.saturating_sub(n);
    }

    pub fn insert_active(&self, taskid: TaskId) {
        self.active_map.insert(taskid, ());
    }

    pub fn remove_active(&self, taskid: TaskId) -> bool {
        self.active_map.remove(&taskid).is_some()
    }

    pub fn active_taskids(&self) -> Vec<TaskId> {
        self.active_map.iter().map(|e| *e.key()).collect()
    }

    /// Moves a task to the dead map pending a `StopJob` acknowledgement
    /// (spec §4.3 "Delete task commands").
    pub fn move_to_dead(&self, taskid: TaskId, reservations: Vec<ReservationKind>) {
        self.active_map.remove(&taskid);
        self.dead_map.insert(taskid, reservations);
    }

    /// Drains the dead-map entry for an acknowledged `StopJob`, per
    /// `original_source`'s dead-map semantics (only drained on ack or
    /// full abandonment, never eagerly).
    pub fn ack_stop(&self, taskid: TaskId) -> Option<Vec<ReservationKind>> {
        self.dead_map.remove(&taskid).map(|(_, v)| v)
    }

    /// Marks this provider for teardown and returns every task id that
    /// was active or dead, so the caller can reinject them into the
    /// waiting queue as `TaskLost` (spec §4.4 "Liveness").
    pub fn abandon(&self) -> Vec<TaskId> {
        self.want_abandon.store(true, Ordering::Release);
        let mut ids: Vec<TaskId> = self.active_map.iter().map(|e| *e.key()).collect();
        ids.extend(self.dead_map.iter().map(|e| *e.key()));
        self.active_map.clear();
        self.dead_map.clear();
        ids
    }

    pub fn mark_cleaned(&self) {
        self.cleaned.store(true, Ordering::Release);
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::Acquire)
    }

    /// Delivers an inbound wire message from the provider's reader task.
    /// If it resolves a pending `Request`, the waiter is woken and
    /// `None` is returned; otherwise the message is handed back to the
    /// caller as an unmatched `Notify`.
    pub fn deliver(&self, message: Message) -> Option<Message> {
        if matches!(message.kind, MessageKind::Reply | MessageKind::Exception) {
            if let Some((_, tx)) = self.pending.remove(&message.serial) {
                let _ = tx.send(message);
                return None;
            }
        }
        Some(message)
    }

    async fn request(&self, command: &str, payload: Vec<u8>, timeout: Duration) -> Result<Message> {
        let serial = {
            let mut next = self.next_serial.lock();
            let s = *next;
            *next = next.wrapping_add(1).max(1);
            s
        };
        let (tx, rx) = oneshot::channel();
        self.pending.insert(serial, tx);
        let command = CommandName::new(command)?;
        let message = Message::request(serial, command, payload);
        if let Err(err) = self.channel.send(&message).await {
            self.pending.remove(&serial);
            self.want_abandon.store(true, Ordering::Release);
            return Err(err);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) if reply.kind == MessageKind::Exception => {
                let text = reply.exception_text().unwrap_or_default();
                Err(FusionError::provider_communication(self.host.clone(), text))
            }
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(FusionError::provider_communication(
                self.host.clone(),
                "response channel dropped",
            )),
            Err(_) => {
                self.pending.remove(&serial);
                self.want_abandon.store(true, Ordering::Release);
                warn!(host = %self.host, "request timed out, scheduling abandonment");
                Err(FusionError::provider_communication(self.host.clone(), "request timed out"))
            }
        }
    }

    pub async fn start_job(&self, req: StartJobRequest, timeout: Duration) -> Result<()> {
        let payload = serde_json::to_vec(&req)
            .map_err(|err| FusionError::provider_communication(self.host.clone(), err.to_string()))?;
        self.request(cmd::START_JOB, payload, timeout).await?;
        Ok(())
    }

    pub async fn stop_job(&self, taskid: TaskId, timeout: Duration) -> Result<()> {
        let req = StopJobRequest { taskid: taskid.0 };
        let payload = serde_json::to_vec(&req)
            .map_err(|err| FusionError::provider_communication(self.host.clone(), err.to_string()))?;
        self.request(cmd::STOP_JOB, payload, timeout).await?;
        Ok(())
    }

    pub async fn change_volume_reservations(
        &self,
        volname: &str,
        serial: u32,
        reservations: HashMap<String, u64>,
        timeout: Duration,
    ) -> Result<()> {
        let req = ChangeVolumeReservationsRequest {
            volname: volname.to_owned(),
            serial,
            reservations,
        };
        let payload = serde_json::to_vec(&req)
            .map_err(|err| FusionError::provider_communication(self.host.clone(), err.to_string()))?;
        self.request(cmd::CHANGE_VOLUME_RESERVATIONS, payload, timeout).await?;
        Ok(())
    }

    pub async fn cleanup_volume(
        &self,
        volname: &str,
        serial: u32,
        reservations: HashMap<String, u64>,
        timeout: Duration,
    ) -> Result<()> {
        let req = CleanupVolumeRequest {
            volname: volname.to_owned(),
            serial,
            reservations,
        };
        let payload = serde_json::to_vec(&req)
            .map_err(|err| FusionError::provider_communication(self.host.clone(), err.to_string()))?;
        self.request(cmd::CLEANUP_VOLUME, payload, timeout).await?;
        Ok(())
    }

    pub async fn clean_path(&self, local_path: &str, timeout: Duration) -> Result<()> {
        let req = CleanPathRequest {
            local_path: local_path.to_owned(),
        };
        let payload = serde_json::to_vec(&req)
            .map_err(|err| FusionError::provider_communication(self.host.clone(), err.to_string()))?;
        self.request(cmd::CLEAN_PATH, payload, timeout).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_reservation_grants_between_min_and_max() {
        let channel = std::sync::Arc::new(test_channel());
        let provider = ProviderProxy::new("h1", 4, channel);
        let granted = provider.try_reserve_cpu(1, 2).unwrap();
        assert_eq!(granted, 2);
        assert_eq!(provider.available_cpus(), 2);
        let granted2 = provider.try_reserve_cpu(1, 8).unwrap();
        assert_eq!(granted2, 2);
        assert_eq!(provider.available_cpus(), 0);
        assert!(provider.try_reserve_cpu(1, 1).is_none());
        provider.release_cpu(2);
        assert_eq!(provider.available_cpus(), 2);
    }

    #[test]
    fn abandon_drains_active_and_dead_maps() {
        let channel = std::sync::Arc::new(test_channel());
        let provider = ProviderProxy::new("h1", 4, channel);
        provider.insert_active(TaskId(1));
        provider.move_to_dead(TaskId(2), vec![]);
        let lost = provider.abandon();
        assert!(lost.contains(&TaskId(1)));
        assert!(lost.contains(&TaskId(2)));
        assert!(provider.wants_abandon());
        assert_eq!(provider.active_taskids().len(), 0);
    }

    fn test_channel() -> WireChannel {
        // A `WireChannel` needs a live `TcpStream`; tests that only
        // exercise CPU/active-map bookkeeping never send on it, so a
        // loopback connection to nowhere (immediately dropped peer) is
        // sufficient scaffolding.
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
            let client = tokio::net::TcpStream::connect(addr).await.unwrap();
            let _server_side = accept.await.unwrap();
            WireChannel::new(client)
        })
    }
}
