//! Asset and AssetVersion records (spec §3).

use std::time::SystemTime;

use fusion_core::ids::{AssetRef, TaskId, VerRef};
use serde::{Deserialize, Serialize};

/// The closed set of asset-type tags (spec §9 "Deep inheritance of asset
/// types"). Per-type business logic lives behind the handler entry points
/// these tags select; their bodies are out of scope here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetType {
    Vector,
    Imagery,
    Terrain,
    Map,
    MapDatabase,
    MercatorMapDatabase,
    Database,
    Kml,
}

/// A named, typed, versioned build target (spec §3 "Asset").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub name: AssetRef,
    pub asset_type: AssetType,
    pub subtype: String,
    pub inputs: Vec<AssetRef>,
    pub config: serde_json::Value,
    pub versions: Vec<u32>,
}

impl Asset {
    pub fn current_version(&self) -> Option<u32> {
        self.versions.last().copied()
    }

    pub fn verref(&self, version: u32) -> VerRef {
        self.name.version(version)
    }
}

/// Lifecycle state of one `AssetVersion` (spec §3). Transition to
/// `Succeeded` only after every input version is `Succeeded` and the
/// task (if any) reported success — enforced in `assets::manager`, not
/// here; this type only carries the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionState {
    New,
    Waiting,
    Queued,
    InProgress,
    Blocked,
    Canceled,
    Failed,
    Succeeded,
    Offline,
    Bad,
    Cleaned,
}

impl VersionState {
    pub fn is_terminal_success(self) -> bool {
        matches!(self, VersionState::Succeeded)
    }

    pub fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            VersionState::Failed | VersionState::Canceled | VersionState::Bad
        )
    }
}

/// One concrete build attempt of an asset (spec §3 "Asset Version").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetVersion {
    pub verref: VerRef,
    pub state: VersionState,
    pub progress: f32,
    pub taskid: Option<TaskId>,
    pub inputs: Vec<VerRef>,
    pub children: Vec<VerRef>,
    pub outfiles: Vec<String>,
    #[serde(with = "option_systemtime")]
    pub begin_time: Option<SystemTime>,
    #[serde(with = "option_systemtime")]
    pub end_time: Option<SystemTime>,
}

impl AssetVersion {
    pub fn new(verref: VerRef) -> Self {
        Self {
            verref,
            state: VersionState::New,
            progress: 0.0,
            taskid: None,
            inputs: Vec::new(),
            children: Vec::new(),
            outfiles: Vec::new(),
            begin_time: None,
            end_time: None,
        }
    }

    pub fn is_immutable(&self) -> bool {
        self.state.is_terminal_success()
    }
}

mod option_systemtime {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S: Serializer>(
        value: &Option<SystemTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let secs = value.map(|t| {
            t.duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_secs()
        });
        secs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<SystemTime>, D::Error> {
        let secs: Option<u64> = Option::deserialize(deserializer)?;
        Ok(secs.map(|s| UNIX_EPOCH + Duration::from_secs(s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_version_starts_mutable_with_zero_progress() {
        let v = AssetVersion::new(AssetRef::new("Foo").version(1));
        assert_eq!(v.state, VersionState::New);
        assert_eq!(v.progress, 0.0);
        assert!(!v.is_immutable());
    }

    #[test]
    fn succeeded_version_is_immutable() {
        let mut v = AssetVersion::new(AssetRef::new("Foo").version(1));
        v.state = VersionState::Succeeded;
        assert!(v.is_immutable());
    }
}
