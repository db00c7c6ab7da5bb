use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE_NAME: &str = "dqlogger.lock";

pub fn default_lock_path(log_root: &Path) -> PathBuf {
    log_root.join(LOCK_FILE_NAME)
}

// Exclusive OS file lock held for the whole sampling run, so two loggers never
// append to the same log tree.
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening lock file failed: {}", path.display()))?;

        file.try_lock_exclusive().with_context(|| {
            format!("another dqlogger is already running: {}", path.display())
        })?;
        log::debug!("holding lock {}", path.display());

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            log::warn!("releasing lock {} failed: {}", self.path.display(), err);
        }
    }
}
