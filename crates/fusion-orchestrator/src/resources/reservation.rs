//! Refcounted resource handles (spec §3 "Reservation", §9 "Dynamic
//! dispatch for Reservation"): a closed tagged sum of `Cpu` and `Volume`
//! kinds, released exactly once. A reservation dropped without an
//! explicit `release()` schedules the same cleanup a provider would see
//! from an orderly release — for a volume reservation this is a
//! `CleanupVolume` path delete (spec §3 "a volume reservation that is
//! destroyed without explicit release schedules file cleanup";
//! `original_source`'s `Reservation.cpp` does this by posting the
//! cleanup rather than running it inline, which this mirrors via an
//! unbounded channel instead of touching shared state from `Drop`).

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationKind {
    Cpu { host: String, n: u32 },
    Volume { volume: String, path: String, size: u64 },
}

/// Posted when a reservation is released, whether explicitly or via
/// `Drop`. `ResourceManager` consumes these to keep its accounting and
/// the volume's reservation map in sync without ever mutating shared
/// state from inside a destructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseEvent {
    ReleaseCpu { host: String, n: u32 },
    ReleaseVolume { volume: String, path: String },
    /// The reservation was dropped without an explicit `release()` call;
    /// the volume's backing file must be scheduled for deletion via
    /// `CleanupVolume`, not merely un-reserved.
    CleanupVolumePath { volume: String, path: String },
}

/// A refcounted claim on a CPU slot or a volume's byte budget.
pub struct Reservation {
    kind: ReservationKind,
    released: AtomicBool,
    release_tx: mpsc::UnboundedSender<ReleaseEvent>,
}

impl Reservation {
    pub fn new_cpu(host: impl Into<String>, n: u32, release_tx: mpsc::UnboundedSender<ReleaseEvent>) -> Self {
        Self {
            kind: ReservationKind::Cpu { host: host.into(), n },
            released: AtomicBool::new(false),
            release_tx,
        }
    }

    pub fn new_volume(
        volume: impl Into<String>,
        path: impl Into<String>,
        size: u64,
        release_tx: mpsc::UnboundedSender<ReleaseEvent>,
    ) -> Self {
        Self {
            kind: ReservationKind::Volume {
                volume: volume.into(),
                path: path.into(),
                size,
            },
            released: AtomicBool::new(false),
            release_tx,
        }
    }

    pub fn kind(&self) -> &ReservationKind {
        &self.kind
    }

    /// Releases the resource exactly once. Subsequent calls (and the
    /// eventual `Drop`) are no-ops. Unlike a drop-without-release, an
    /// explicit release of a volume reservation simply un-reserves the
    /// bytes — it does not schedule a file cleanup.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let event = match &self.kind {
            ReservationKind::Cpu { host, n } => ReleaseEvent::ReleaseCpu {
                host: host.clone(),
                n: *n,
            },
            ReservationKind::Volume { volume, path, .. } => ReleaseEvent::ReleaseVolume {
                volume: volume.clone(),
                path: path.clone(),
            },
        };
        let _ = self.release_tx.send(event);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let event = match &self.kind {
            ReservationKind::Cpu { host, n } => ReleaseEvent::ReleaseCpu {
                host: host.clone(),
                n: *n,
            },
            ReservationKind::Volume { volume, path, .. } => ReleaseEvent::CleanupVolumePath {
                volume: volume.clone(),
                path: path.clone(),
            },
        };
        let _ = self.release_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_release_of_volume_reservation_does_not_schedule_cleanup() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let res = Reservation::new_volume("vol_a", "y", 1024, tx);
        res.release();
        drop(res);
        let event = rx.try_recv().unwrap();
        assert_eq!(
            event,
            ReleaseEvent::ReleaseVolume {
                volume: "vol_a".to_owned(),
                path: "y".to_owned(),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropping_without_release_schedules_volume_cleanup() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let res = Reservation::new_volume("vol_a", "y", 1024, tx);
        drop(res);
        let event = rx.try_recv().unwrap();
        assert_eq!(
            event,
            ReleaseEvent::CleanupVolumePath {
                volume: "vol_a".to_owned(),
                path: "y".to_owned(),
            }
        );
    }

    #[test]
    fn release_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let res = Reservation::new_cpu("h1", 2, tx);
        res.release();
        res.release();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
