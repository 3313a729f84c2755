//! A live task instance (spec §3 "Task", §4.5). Construction computes
//! `TaskRequirements` and creates the `<state>/<taskid>.task` crash-
//! recovery symlink; the symlink is removed when the task is dropped.

use std::path::{Path, PathBuf};
use std::time::Instant;

use fusion_core::error::{FusionError, Result};
use fusion_core::ids::{TaskId, VerRef};

use crate::resources::provider::ProviderHandle;
use crate::resources::requirements::{TaskDef, TaskRequirements};
use crate::resources::reservation::Reservation;
use crate::resources::volume::VolumeManager;

/// The `<state>/<taskid>.task -> <verref>` symlink used for crash
/// recovery (spec §4.5 "Persistence"). Removed on drop.
pub struct TaskSymlink {
    path: PathBuf,
}

impl TaskSymlink {
    pub fn create(state_dir: &Path, taskid: TaskId, verref: &VerRef) -> Result<Self> {
        let path = state_dir.join(format!("{taskid}.task"));
        std::fs::create_dir_all(state_dir)
            .map_err(|err| FusionError::storage_commit_io("cannot create state dir", err))?;
        let _ = std::fs::remove_file(&path);
        #[cfg(unix)]
        std::os::unix::fs::symlink(verref.to_string(), &path)
            .map_err(|err| FusionError::storage_commit_io("cannot create task symlink", err))?;
        #[cfg(not(unix))]
        std::fs::write(&path, verref.to_string())
            .map_err(|err| FusionError::storage_commit_io("cannot create task marker", err))?;
        Ok(Self { path })
    }

    /// Reads back the verref a recovery-scan symlink points at (spec
    /// §4.4 "Startup recovery").
    pub fn read_target(path: &Path) -> Result<String> {
        #[cfg(unix)]
        {
            std::fs::read_link(path)
                .map_err(|err| FusionError::storage_commit_io("cannot read task symlink", err))
                .map(|p| p.to_string_lossy().into_owned())
        }
        #[cfg(not(unix))]
        {
            std::fs::read_to_string(path)
                .map_err(|err| FusionError::storage_commit_io("cannot read task marker", err))
        }
    }
}

impl Drop for TaskSymlink {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One unit of external work dispatched for exactly one version (spec
/// §3 "Task"). At most one live `Task` exists per verref at a time.
pub struct Task {
    pub verref: VerRef,
    pub taskid: TaskId,
    pub priority: i32,
    pub taskdef: TaskDef,
    pub requirements: TaskRequirements,
    pub submit_time: Instant,
    pub begin_time: Option<Instant>,
    pub progress_time: Option<Instant>,
    pub progress: f32,
    pub cpu_reservation: Option<Reservation>,
    pub volume_reservations: Vec<Reservation>,
    pub job_handler: Option<ProviderHandle>,
    symlink: TaskSymlink,
}

impl Task {
    pub fn new(
        taskid: TaskId,
        verref: VerRef,
        priority: i32,
        taskdef: TaskDef,
        rule: Option<&fusion_core::config::TaskRule>,
        volumes: &VolumeManager,
        state_dir: &Path,
        submit_time: Instant,
    ) -> Result<Self> {
        let requirements = TaskRequirements::build(taskid, &verref, &taskdef, rule, volumes)?;
        let symlink = TaskSymlink::create(state_dir, taskid, &verref)?;
        Ok(Self {
            verref,
            taskid,
            priority,
            taskdef,
            requirements,
            submit_time,
            begin_time: None,
            progress_time: None,
            progress: 0.0,
            cpu_reservation: None,
            volume_reservations: Vec::new(),
            job_handler: None,
            symlink,
        })
    }

    pub fn is_dispatched(&self) -> bool {
        self.job_handler.is_some()
    }

    pub fn release_reservations(&mut self) {
        if let Some(cpu) = self.cpu_reservation.take() {
            cpu.release();
        }
        for vol in self.volume_reservations.drain(..) {
            vol.release();
        }
    }

    pub fn symlink_path(&self) -> &Path {
        &self.symlink.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_core::config::VolumeEntry;
    use fusion_core::ids::AssetRef;
    use crate::resources::requirements::{InputSpec, OutputSpec};

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "fusion-orchestrator-task-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        dir
    }

    #[test]
    fn task_creation_writes_a_symlink_removed_on_drop() {
        let state_dir = tempdir();
        let volumes = VolumeManager::new(
            vec![VolumeEntry {
                name: "vol_a".to_owned(),
                host: "h1".to_owned(),
                netpath: "/net/vol_a".to_owned(),
                localpath: "/data/vol_a".to_owned(),
                is_tmp: false,
            }],
            "h1",
        );
        let verref = AssetRef::new("Foo").version(1);
        let taskdef = TaskDef {
            inputs: vec![InputSpec {
                uri: "khfile://vol_a/x".to_owned(),
            }],
            outputs: vec![OutputSpec {
                path: "/data/vol_a/y".to_owned(),
                volume: Some("vol_a".to_owned()),
                size_estimate: 1024,
            }],
            commands: vec![],
        };
        let task = Task::new(
            TaskId(1),
            verref,
            0,
            taskdef,
            None,
            &volumes,
            &state_dir,
            Instant::now(),
        )
        .unwrap();
        let symlink_path = task.symlink_path().to_path_buf();
        assert!(symlink_path.exists() || symlink_path.is_symlink());
        drop(task);
        assert!(!symlink_path.exists() && !symlink_path.is_symlink());
        let _ = std::fs::remove_dir_all(&state_dir);
    }
}
