//! URI/path resolution and per-volume runtime accounting (spec §4.6).
//! Loaded once at startup from `volumes.toml` (the Rust-idiomatic
//! replacement for `volumes.xml`, see `SPEC_FULL.md` §B.2); the volume
//! table itself never changes afterwards, but each volume's runtime
//! state (serial, reported-available bytes, live reservations) churns
//! continuously as the Resource Manager reserves and releases space.

use std::collections::HashMap;
use std::path::PathBuf;

use dashmap::DashMap;
use fusion_core::config::VolumeEntry;
use fusion_core::error::{FusionError, Result};
use serde::{Deserialize, Serialize};

/// Per-volume state reported by its hosting provider: a monotone serial
/// bumped on every reservation change, available bytes as last reported,
/// and the live path → bytes reservation map (spec §3 "Volume").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeRuntime {
    pub serial: u32,
    pub avail: u64,
    pub reservations: HashMap<String, u64>,
}

impl VolumeRuntime {
    pub fn reserved_bytes(&self) -> u64 {
        self.reservations.values().sum()
    }
}

pub struct VolumeManager {
    volumes: HashMap<String, VolumeEntry>,
    runtime: DashMap<String, VolumeRuntime>,
    local_host: String,
    /// Where `<volname>.reservations` files live (spec §6 "On-disk
    /// layout"). `None` in unit tests that never touch disk.
    state_dir: Option<PathBuf>,
}

impl VolumeManager {
    pub fn new(entries: Vec<VolumeEntry>, local_host: impl Into<String>) -> Self {
        let volumes = entries.into_iter().map(|v| (v.name.clone(), v)).collect();
        Self {
            volumes,
            runtime: DashMap::new(),
            local_host: local_host.into(),
            state_dir: None,
        }
    }

    /// Enables persistence of `<volname>.reservations` files under
    /// `dir` (spec §6, §8 scenario 3).
    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = Some(dir);
        self
    }

    fn reservations_path(&self, volume: &str) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| dir.join(format!("{volume}.reservations")))
    }

    /// Persists the volume's current serial/reservation map, or removes
    /// the file once the map is empty (spec §8 scenario 3: "`.reservations`
    /// file is removed" once a volume's reservations are cleared).
    fn persist(&self, volume: &str, rt: &VolumeRuntime) {
        let Some(path) = self.reservations_path(volume) else {
            return;
        };
        if rt.reservations.is_empty() {
            let _ = std::fs::remove_file(&path);
            return;
        }
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_vec(rt) {
            let _ = std::fs::write(&path, json);
        }
    }

    pub fn volume(&self, name: &str) -> Option<&VolumeEntry> {
        self.volumes.get(name)
    }

    pub fn volume_host(&self, name: &str) -> Option<&str> {
        self.volumes.get(name).map(|v| v.host.as_str())
    }

    pub fn get_host_volumes(&self, host: &str) -> Vec<&str> {
        self.volumes
            .values()
            .filter(|v| v.host == host)
            .map(|v| v.name.as_str())
            .collect()
    }

    pub fn get_local_tmp_volumes(&self, host: &str) -> Vec<&str> {
        self.volumes
            .values()
            .filter(|v| v.host == host && v.is_tmp)
            .map(|v| v.name.as_str())
            .collect()
    }

    pub fn get_remote_tmp_volumes(&self, host: &str) -> Vec<&str> {
        self.volumes
            .values()
            .filter(|v| v.host != host && v.is_tmp)
            .map(|v| v.name.as_str())
            .collect()
    }

    pub fn network_path_of(&self, uri: &str) -> Result<String> {
        let (volume, rel_path) = parse_uri(uri)?;
        let entry = self.volumes.get(volume).ok_or_else(|| {
            FusionError::client_request("VolumePath", format!("unknown volume `{volume}`"))
        })?;
        Ok(join_path(&entry.netpath, rel_path))
    }

    pub fn local_path_of(&self, uri: &str) -> Result<String> {
        let (volume, rel_path) = parse_uri(uri)?;
        let entry = self.volumes.get(volume).ok_or_else(|| {
            FusionError::client_request("VolumePath", format!("unknown volume `{volume}`"))
        })?;
        Ok(join_path(&entry.localpath, rel_path))
    }

    /// Finds the first volume whose netpath is a prefix of `abs_path`, or
    /// whose localpath is a prefix and whose host is the local host
    /// (spec §4.6 `DeduceURIFromPath`).
    pub fn deduce_uri_from_path(&self, abs_path: &str) -> Option<String> {
        for entry in self.volumes.values() {
            if let Some(rel) = abs_path.strip_prefix(&entry.netpath) {
                return Some(format!("khfile://{}/{}", entry.name, rel.trim_start_matches('/')));
            }
            if entry.host == self.local_host {
                if let Some(rel) = abs_path.strip_prefix(&entry.localpath) {
                    return Some(format!("khfile://{}/{}", entry.name, rel.trim_start_matches('/')));
                }
            }
        }
        None
    }

    fn runtime_entry(&self, volume: &str) -> dashmap::mapref::one::RefMut<'_, String, VolumeRuntime> {
        self.runtime.entry(volume.to_owned()).or_default()
    }

    /// Attempts to reserve `size` bytes at `path` on `volume`. Succeeds
    /// if current reservations plus `size` do not exceed the last
    /// reported `avail`. Bumps the volume's serial on success (spec
    /// §4.3 "Reservation serialisation").
    pub fn try_reserve(&self, volume: &str, path: &str, size: u64) -> Option<u32> {
        let mut rt = self.runtime_entry(volume);
        if rt.reserved_bytes() + size > rt.avail {
            return None;
        }
        rt.reservations.insert(path.to_owned(), size);
        rt.serial += 1;
        self.persist(volume, &rt);
        Some(rt.serial)
    }

    pub fn release(&self, volume: &str, path: &str) -> Option<u32> {
        let mut rt = self.runtime_entry(volume);
        if rt.reservations.remove(path).is_some() {
            rt.serial += 1;
            self.persist(volume, &rt);
            Some(rt.serial)
        } else {
            None
        }
    }

    /// Clears every reservation on a volume, e.g. after provider
    /// abandonment (spec §4.4 "Liveness"). Removes the volume's
    /// persisted `.reservations` file once the map is empty.
    pub fn clear_all(&self, volume: &str) -> u32 {
        let mut rt = self.runtime_entry(volume);
        rt.reservations.clear();
        rt.serial += 1;
        self.persist(volume, &rt);
        rt.serial
    }

    /// Accepts a provider's `VolumeAvail` report only if its serial is
    /// not stale (spec §4.3, §8 scenario 6).
    pub fn report_avail(&self, volume: &str, serial: u32, avail: u64) -> bool {
        let mut rt = self.runtime_entry(volume);
        if serial < rt.serial {
            return false;
        }
        rt.avail = avail;
        true
    }

    pub fn current_serial(&self, volume: &str) -> u32 {
        self.runtime.get(volume).map(|rt| rt.serial).unwrap_or(0)
    }

    pub fn snapshot(&self, volume: &str) -> VolumeRuntime {
        self.runtime.get(volume).map(|rt| rt.clone()).unwrap_or_default()
    }
}

fn join_path(base: &str, rel: &str) -> String {
    let trimmed_base = base.trim_end_matches('/');
    format!("{trimmed_base}/{rel}")
}

/// Parses `khfile://<volume>/<path>`; both volume and path must be
/// non-empty (spec §4.6).
fn parse_uri(uri: &str) -> Result<(&str, &str)> {
    let rest = uri.strip_prefix("khfile://").ok_or_else(|| {
        FusionError::client_request("VolumeUri", format!("`{uri}` is missing the khfile:// scheme"))
    })?;
    let (volume, path) = rest.split_once('/').ok_or_else(|| {
        FusionError::client_request("VolumeUri", format!("`{uri}` has no path component"))
    })?;
    if volume.is_empty() || path.is_empty() {
        return Err(FusionError::client_request(
            "VolumeUri",
            format!("`{uri}` has an empty volume or path"),
        ));
    }
    Ok((volume, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> VolumeManager {
        VolumeManager::new(
            vec![
                VolumeEntry {
                    name: "vol_a".to_owned(),
                    host: "h1".to_owned(),
                    netpath: "/net/vol_a".to_owned(),
                    localpath: "/data/vol_a".to_owned(),
                    is_tmp: false,
                },
                VolumeEntry {
                    name: "tmp_a".to_owned(),
                    host: "h1".to_owned(),
                    netpath: "/net/tmp_a".to_owned(),
                    localpath: "/data/tmp_a".to_owned(),
                    is_tmp: true,
                },
                VolumeEntry {
                    name: "tmp_b".to_owned(),
                    host: "h2".to_owned(),
                    netpath: "/net/tmp_b".to_owned(),
                    localpath: "/data/tmp_b".to_owned(),
                    is_tmp: true,
                },
            ],
            "h1",
        )
    }

    #[test]
    fn network_and_local_path_join_correctly() {
        let m = manager();
        assert_eq!(m.network_path_of("khfile://vol_a/x/y").unwrap(), "/net/vol_a/x/y");
        assert_eq!(m.local_path_of("khfile://vol_a/x/y").unwrap(), "/data/vol_a/x/y");
    }

    #[test]
    fn parse_uri_rejects_malformed_input() {
        let m = manager();
        assert!(m.network_path_of("not-a-uri").is_err());
        assert!(m.network_path_of("khfile://novolume").is_err());
    }

    #[test]
    fn deduce_uri_from_path_finds_netpath_prefix() {
        let m = manager();
        assert_eq!(
            m.deduce_uri_from_path("/net/vol_a/sub/file").unwrap(),
            "khfile://vol_a/sub/file"
        );
    }

    #[test]
    fn tmp_volume_partitioning_is_local_vs_remote() {
        let m = manager();
        assert_eq!(m.get_local_tmp_volumes("h1"), vec!["tmp_a"]);
        assert_eq!(m.get_remote_tmp_volumes("h1"), vec!["tmp_b"]);
    }

    #[test]
    fn reservation_respects_available_bytes_and_bumps_serial() {
        let m = manager();
        m.report_avail("vol_a", 0, 2048);
        let s1 = m.try_reserve("vol_a", "y", 1024).unwrap();
        assert_eq!(s1, 1);
        assert!(m.try_reserve("vol_a", "z", 2000).is_none());
        let s2 = m.release("vol_a", "y").unwrap();
        assert_eq!(s2, 2);
    }

    #[test]
    fn stale_avail_report_is_rejected() {
        let m = manager();
        m.report_avail("vol_a", 0, 4096);
        m.try_reserve("vol_a", "y", 1024);
        m.try_reserve("vol_a", "z", 1024);
        assert_eq!(m.current_serial("vol_a"), 2);
        assert!(!m.report_avail("vol_a", 1, 8192));
        assert!(m.report_avail("vol_a", 2, 8192));
    }
}
