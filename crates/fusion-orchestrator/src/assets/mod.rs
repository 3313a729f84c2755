//! The asset/version graph, its on-disk persistence, and its
//! change-broadcast fan-out (spec §3, §4.2).

pub mod manager;
pub mod model;
pub mod notifier;
pub mod persist;

pub use manager::AssetManager;
pub use model::{Asset, AssetType, AssetVersion, VersionState};
pub use notifier::{AssetChanges, AssetNotifier};
