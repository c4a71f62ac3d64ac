//! Process-wide advisory lock over a working directory.
//!
//! The primitive is an atomic `mkdir`: creation either succeeds (lock
//! acquired) or fails because the directory exists (lock held elsewhere).
//! There is no force-unlock path in the library; operators inspect
//! `owner.json` and clean up by hand.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const LOCK_DIR_NAME: &str = ".run_lock";
const TMP_PREFIX: &str = "data.parquet.tmp-";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub host: String,
    pub ts: f64,
    pub cwd: String,
}

#[derive(Debug, Clone)]
pub struct RunLock {
    base_dir: PathBuf,
    lock_dir: PathBuf,
    owner_file: PathBuf,
}

impl RunLock {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let lock_dir = base_dir.join(LOCK_DIR_NAME);
        let owner_file = lock_dir.join("owner.json");
        Self {
            base_dir,
            lock_dir,
            owner_file,
        }
    }

    /// Attempt to acquire by creating the lock directory. Returns false when
    /// the lock is already held; there is no blocking wait.
    pub fn try_acquire(&self) -> Result<bool> {
        match std::fs::create_dir(&self.lock_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(err.into()),
        }

        let owner = LockOwner {
            pid: std::process::id(),
            host: whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string()),
            ts: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map_or(0.0, |d| d.as_secs_f64()),
            cwd: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        };
        if let Err(err) = serde_json::to_string(&owner)
            .map_err(anyhow::Error::from)
            .and_then(|text| std::fs::write(&self.owner_file, text).map_err(Into::into))
        {
            // Best effort: the lock itself is the directory.
            tracing::debug!(%err, "failed to write lock owner metadata");
        }
        Ok(true)
    }

    pub fn owner_info(&self) -> Option<LockOwner> {
        let text = std::fs::read_to_string(&self.owner_file).ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn release(&self) {
        if self.owner_file.exists() {
            if let Err(err) = std::fs::remove_file(&self.owner_file) {
                tracing::debug!(%err, "failed to remove lock owner file");
            }
        }
        if self.lock_dir.exists() {
            if let Err(err) = std::fs::remove_dir(&self.lock_dir) {
                // Non-empty or racing: leave it for the operator.
                tracing::debug!(path = %self.lock_dir.display(), %err, "unable to remove lock dir");
            }
        }
    }

    /// Recover orphaned temp partition files under `{base}/data`.
    ///
    /// A tmp whose sibling `data.parquet` exists is a leftover from a
    /// completed write and is deleted. A tmp without a sibling is a
    /// half-finished write whose content is still authoritative and is
    /// renamed into place. Returns the number of tmp files processed.
    pub fn cleanup_tmp_files(&self) -> usize {
        let data_root = self.base_dir.join("data");
        if !data_root.exists() {
            return 0;
        }
        let mut processed = 0;
        visit_tmp_files(&data_root, &mut |tmp| {
            let final_path = tmp.with_file_name("data.parquet");
            if final_path.exists() {
                if let Err(err) = std::fs::remove_file(tmp) {
                    tracing::debug!(path = %tmp.display(), %err, "failed to remove tmp file");
                }
            } else if let Err(err) = std::fs::rename(tmp, &final_path) {
                tracing::warn!(path = %tmp.display(), %err, "failed to recover tmp file");
            }
            processed += 1;
        });
        processed
    }
}

fn visit_tmp_files(dir: &Path, visit: &mut impl FnMut(&Path)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            visit_tmp_files(&path, visit);
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(TMP_PREFIX))
        {
            visit(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_until_release() {
        let dir = TempDir::new().unwrap();
        let first = RunLock::new(dir.path());
        let second = RunLock::new(dir.path());

        assert!(first.try_acquire().unwrap());
        assert!(!second.try_acquire().unwrap());

        let owner = first.owner_info().unwrap();
        assert_eq!(owner.pid, std::process::id());

        first.release();
        assert!(second.try_acquire().unwrap());
        second.release();
    }

    #[test]
    fn cleanup_promotes_orphaned_tmp_and_removes_shadowed_tmp() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::new(dir.path());

        let orphan_dir = dir.path().join("data/us/yahoo/stocks_1d/ticker=AAA");
        std::fs::create_dir_all(&orphan_dir).unwrap();
        std::fs::write(orphan_dir.join("data.parquet.tmp-1-2-3"), b"orphan").unwrap();

        let shadowed_dir = dir.path().join("data/us/yahoo/stocks_1d/ticker=BBB");
        std::fs::create_dir_all(&shadowed_dir).unwrap();
        std::fs::write(shadowed_dir.join("data.parquet"), b"final").unwrap();
        std::fs::write(shadowed_dir.join("data.parquet.tmp-4-5-6"), b"stale").unwrap();

        assert_eq!(lock.cleanup_tmp_files(), 2);

        // Orphan promoted to the final name.
        assert!(orphan_dir.join("data.parquet").exists());
        assert!(!orphan_dir.join("data.parquet.tmp-1-2-3").exists());

        // Shadowed tmp removed, final left untouched.
        assert!(!shadowed_dir.join("data.parquet.tmp-4-5-6").exists());
        assert_eq!(
            std::fs::read(shadowed_dir.join("data.parquet")).unwrap(),
            b"final"
        );
    }

    #[test]
    fn cleanup_without_data_dir_is_a_noop() {
        let dir = TempDir::new().unwrap();
        assert_eq!(RunLock::new(dir.path()).cleanup_tmp_files(), 0);
    }
}
