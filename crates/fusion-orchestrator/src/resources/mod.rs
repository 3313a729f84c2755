//! The task/provider/volume layer: waiting queue, activation loop,
//! provider proxies, and reservation bookkeeping (spec §3, §4.3-§4.6).

pub mod manager;
pub mod provider;
pub mod queue;
pub mod requirements;
pub mod reservation;
pub mod task;
pub mod volume;

pub use manager::ResourceManager;
pub use provider::{ProviderHandle, ProviderProxy};
pub use reservation::{ReleaseEvent, Reservation, ReservationKind};
pub use volume::VolumeManager;
