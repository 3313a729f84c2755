//! On-disk configuration: the daemon-wide `fusiond.toml`, the per-volume
//! `volumes.toml` (the Rust-idiomatic replacement for the original
//! `volumes.xml`), and the per-`(assetType+taskName)` `*.taskrule` files
//! that `ReloadConfig` re-reads at runtime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;

use crate::error::{FusionError, Result};

/// Daemon-wide settings, loaded once at startup from `--config`.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    pub asset_root: PathBuf,
    #[serde(default = "default_state_dir_name")]
    pub state_dir_name: String,
    #[serde(default = "default_asset_manager_port")]
    pub asset_manager_port: u16,
    #[serde(default = "default_resource_manager_port")]
    pub resource_manager_port: u16,
    #[serde(default = "default_provider_port")]
    pub provider_port: u16,
    /// The `GetCurrTasks` escape-hatch timeout (spec §9 open question):
    /// how long a client request will wait on the resource mutex before
    /// giving up with `"ERROR: system busy"` rather than blocking
    /// indefinitely behind a long activation pass.
    #[serde(default = "default_mutex_timed_wait_secs")]
    pub mutex_timed_wait_secs: u64,
    /// How long the orchestrator waits on a `Request` to a provider
    /// before scheduling abandonment.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_state_dir_name() -> String {
    ".state".to_owned()
}
fn default_asset_manager_port() -> u16 {
    13031
}
fn default_resource_manager_port() -> u16 {
    13032
}
fn default_provider_port() -> u16 {
    13033
}
fn default_mutex_timed_wait_secs() -> u64 {
    5
}
fn default_provider_timeout_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_owned()
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            FusionError::fatal(format!("cannot read daemon config {}: {err}", path.display()))
        })?;
        toml::from_str(&text)
            .map_err(|err| FusionError::fatal(format!("malformed daemon config: {err}")))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.asset_root.join(&self.state_dir_name)
    }

    pub fn config_dir(&self) -> PathBuf {
        self.asset_root.join(".config")
    }
}

/// One entry of `volumes.toml`: a named disk mount attached to one host
/// (spec §3 "Volume").
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct VolumeEntry {
    pub name: String,
    pub host: String,
    pub netpath: String,
    pub localpath: String,
    #[serde(default)]
    pub is_tmp: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumesFile {
    pub volume: Vec<VolumeEntry>,
}

impl VolumesFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            FusionError::fatal(format!("cannot read volumes file {}: {err}", path.display()))
        })?;
        let file: VolumesFile = toml::from_str(&text)
            .map_err(|err| FusionError::fatal(format!("malformed volumes.toml: {err}")))?;
        for v in &file.volume {
            if !v.netpath.starts_with('/') || !v.localpath.starts_with('/') {
                return Err(FusionError::fatal(format!(
                    "volume `{}` has a non-absolute netpath or localpath",
                    v.name
                )));
            }
        }
        Ok(file)
    }
}

/// Locality preference for placing a task's input or output relative to
/// the provider that will run it (spec §3 "Task Requirements").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preference {
    Must,
    Prefer,
    DontCare,
}

/// Overrides the locality preference for one input, addressed by its
/// index in the task's `inputs[]`.
#[derive(Debug, Clone, Deserialize)]
pub struct InputConstraint {
    pub index: usize,
    pub locality: Preference,
}

/// Overrides for one output, addressed by its index in `outputs[]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConstraint {
    pub index: usize,
    #[serde(default)]
    pub volume: Option<String>,
    /// Path pattern; see `$taskid`/`$defaultpath`/`$vernum`/`$assetref`
    /// substitution in `fusion-orchestrator::resources::requirements`.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub locality: Option<Preference>,
    /// Indexed by input #; `Must` removes that input's volume as a
    /// candidate tmp volume for this output, `Prefer` moves it to the
    /// back of the candidate list.
    #[serde(default)]
    pub different_volumes: Vec<Preference>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CpuConstraint {
    #[serde(default = "default_cpu_count")]
    pub min: u32,
    #[serde(default = "default_cpu_count")]
    pub max: u32,
}

fn default_cpu_count() -> u32 {
    1
}

/// One `*.taskrule` file's contents, keyed externally by
/// `(assetType+taskName)` or `taskName` alone (spec §4.5).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskRule {
    #[serde(default)]
    pub inputs: Vec<InputConstraint>,
    #[serde(default)]
    pub outputs: Vec<OutputConstraint>,
    #[serde(default)]
    pub cpu: Option<CpuConstraint>,
}

/// The full set of loaded task rules, keyed by rule name
/// (`"<assetType><taskName>"` or bare `"<taskName>"`).
#[derive(Debug, Clone, Default)]
pub struct TaskRuleSet {
    rules: HashMap<String, TaskRule>,
}

impl TaskRuleSet {
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut rules = HashMap::new();
        if !dir.exists() {
            return Ok(Self { rules });
        }
        let entries = std::fs::read_dir(dir).map_err(|err| {
            FusionError::fatal(format!("cannot read task rule dir {}: {err}", dir.display()))
        })?;
        for entry in entries {
            let entry = entry
                .map_err(|err| FusionError::fatal(format!("cannot read task rule entry: {err}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("taskrule") {
                continue;
            }
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| FusionError::fatal(format!("non-UTF8 rule filename: {path:?}")))?
                .to_owned();
            let text = std::fs::read_to_string(&path).map_err(|err| {
                FusionError::fatal(format!("cannot read task rule {}: {err}", path.display()))
            })?;
            let rule: TaskRule = toml::from_str(&text)
                .map_err(|err| FusionError::fatal(format!("malformed task rule {name}: {err}")))?;
            rules.insert(name, rule);
        }
        Ok(Self { rules })
    }

    /// Looks up by `assetType+taskName` first, falling back to bare
    /// `taskName`, per spec §4.5.
    pub fn lookup(&self, asset_type: &str, task_name: &str) -> Option<&TaskRule> {
        let combined = format!("{asset_type}{task_name}");
        self.rules.get(&combined).or_else(|| self.rules.get(task_name))
    }
}

/// Hot-reloadable holder for the current `TaskRuleSet`. `ReloadConfig`
/// swaps in a freshly loaded set; in-flight readers never block behind
/// the swap (mirrors the teacher stack's use of `arc-swap` for
/// live-mutable shared state).
#[derive(Default)]
pub struct TaskRuleStore {
    current: ArcSwap<TaskRuleSet>,
}

impl TaskRuleStore {
    pub fn new(initial: TaskRuleSet) -> Self {
        Self {
            current: ArcSwap::new(Arc::new(initial)),
        }
    }

    pub fn current(&self) -> Arc<TaskRuleSet> {
        self.current.load_full()
    }

    pub fn reload(&self, fresh: TaskRuleSet) {
        self.current.store(Arc::new(fresh));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn task_rule_lookup_falls_back_to_bare_task_name() {
        let mut set = TaskRuleSet::default();
        set.rules.insert(
            "import".to_owned(),
            TaskRule {
                cpu: Some(CpuConstraint { min: 1, max: 4 }),
                ..Default::default()
            },
        );
        assert!(set.lookup("Imagery", "import").is_some());
        assert!(set.lookup("Vector", "export").is_none());
    }

    #[test]
    fn task_rule_lookup_prefers_combined_key() {
        let mut set = TaskRuleSet::default();
        set.rules.insert(
            "import".to_owned(),
            TaskRule {
                cpu: Some(CpuConstraint { min: 1, max: 1 }),
                ..Default::default()
            },
        );
        set.rules.insert(
            "Imageryimport".to_owned(),
            TaskRule {
                cpu: Some(CpuConstraint { min: 2, max: 8 }),
                ..Default::default()
            },
        );
        let rule = set.lookup("Imagery", "import").unwrap();
        assert_eq!(rule.cpu.as_ref().unwrap().max, 8);
    }

    #[test]
    fn volumes_file_rejects_relative_paths() {
        let dir = tempdir();
        let path = dir.join("volumes.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[[volume]]\nname = \"vol_a\"\nhost = \"h1\"\nnetpath = \"relative/path\"\nlocalpath = \"/data/vol_a\"\n"
        )
        .unwrap();
        let err = VolumesFile::load(&path).unwrap_err();
        assert!(matches!(err.category(), crate::error::ErrorCategory::Fatal));
    }

    #[test]
    fn task_rule_store_reload_is_visible_to_new_loads() {
        let store = TaskRuleStore::new(TaskRuleSet::default());
        assert!(store.current().lookup("Imagery", "import").is_none());
        let mut fresh = TaskRuleSet::default();
        fresh.rules.insert("import".to_owned(), TaskRule::default());
        store.reload(fresh);
        assert!(store.current().lookup("Imagery", "import").is_some());
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("fusion-core-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
