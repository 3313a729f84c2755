//! The file-transaction object behind `PendingAssetGuard`'s commit
//! (spec §4.2 steps 1/4): every write goes through a `.new` sibling file,
//! committed by rename, with rollback if any rename fails.

use std::path::{Path, PathBuf};

use fusion_core::error::{FusionError, Result};
use tracing::warn;

enum PendingWrite {
    Write { target: PathBuf, new_path: PathBuf },
    Delete { target: PathBuf },
}

/// Accumulates writes and deletes, then commits them as a unit.
/// Construction writes nothing; `stage_write` immediately creates the
/// `.new` file (so a failure there is caught before anything else is
/// touched) but defers the rename to `commit`.
#[derive(Default)]
pub struct FileTransaction {
    pending: Vec<PendingWrite>,
}

impl FileTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialises `contents` to `<target>.new`, to be renamed over
    /// `target` on commit.
    pub fn stage_write(&mut self, target: &Path, contents: &[u8]) -> Result<()> {
        let new_path = new_suffixed(target);
        if let Some(parent) = new_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| FusionError::storage_commit_io("cannot create parent dir", err))?;
        }
        std::fs::write(&new_path, contents)
            .map_err(|err| FusionError::storage_commit_io("cannot stage .new file", err))?;
        self.pending.push(PendingWrite::Write {
            target: target.to_path_buf(),
            new_path,
        });
        Ok(())
    }

    pub fn stage_delete(&mut self, target: &Path) {
        self.pending.push(PendingWrite::Delete {
            target: target.to_path_buf(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Renames every staged `.new` file over its target and performs
    /// every staged delete. Before overwriting a target that already
    /// exists, its prior contents are preserved at a `.bak` sibling so a
    /// later failure can restore them, not just relocate the new file
    /// back out (spec §4.2 step 4 "all renames are rolled back"). On the
    /// first failure, every rename already performed is undone in
    /// reverse order and the transaction aborts.
    pub fn commit(mut self) -> Result<()> {
        let mut committed: Vec<(PathBuf, PathBuf, Option<PathBuf>)> = Vec::new();
        let result = (|| -> Result<()> {
            for item in &self.pending {
                match item {
                    PendingWrite::Write { target, new_path } => {
                        let bak_path = if target.exists() {
                            let bak = bak_suffixed(target);
                            std::fs::rename(target, &bak).map_err(|err| {
                                FusionError::storage_commit_io(
                                    format!(
                                        "backup rename {} -> {} failed",
                                        target.display(),
                                        bak.display()
                                    ),
                                    err,
                                )
                            })?;
                            Some(bak)
                        } else {
                            None
                        };
                        std::fs::rename(new_path, target).map_err(|err| {
                            FusionError::storage_commit_io(
                                format!("rename {} -> {} failed", new_path.display(), target.display()),
                                err,
                            )
                        })?;
                        committed.push((target.clone(), new_path.clone(), bak_path));
                    }
                    PendingWrite::Delete { target } => {
                        if target.exists() {
                            std::fs::remove_file(target).map_err(|err| {
                                FusionError::storage_commit_io(
                                    format!("delete {} failed", target.display()),
                                    err,
                                )
                            })?;
                        }
                    }
                }
            }
            Ok(())
        })();

        if let Err(err) = result {
            for (target, new_path, bak_path) in committed.into_iter().rev() {
                if let Err(rollback_err) = std::fs::rename(&target, &new_path) {
                    warn!(
                        target = %target.display(),
                        error = %rollback_err,
                        "rollback rename failed, on-disk state may be inconsistent"
                    );
                    continue;
                }
                if let Some(bak_path) = bak_path {
                    if let Err(rollback_err) = std::fs::rename(&bak_path, &target) {
                        warn!(
                            target = %target.display(),
                            error = %rollback_err,
                            "rollback of prior target contents failed, on-disk state may be inconsistent"
                        );
                    }
                }
            }
            self.pending.clear();
            return Err(err);
        }
        self.pending.clear();
        Ok(())
    }

    /// Discards every staged `.new` file without touching any target
    /// (the abort path of `PendingAssetGuard`, spec §4.2).
    pub fn abort(self) {
        for item in self.pending {
            if let PendingWrite::Write { new_path, .. } = item {
                let _ = std::fs::remove_file(new_path);
            }
        }
    }
}

fn new_suffixed(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".new");
    path.with_file_name(name)
}

fn bak_suffixed(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}
