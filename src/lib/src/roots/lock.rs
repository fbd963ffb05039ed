//! Cross-process exclusion for the metadata cache.

use crate::error::PolicyError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = ".lock";

/// Exclusive advisory lock on `<cache_path>/.lock`, released on drop.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Block until no other process holds the lock.
    pub fn acquire(cache_path: &Path) -> Result<Self, PolicyError> {
        std::fs::create_dir_all(cache_path).map_err(|source| PolicyError::Cache {
            path: cache_path.display().to_string(),
            source,
        })?;
        let path = cache_path.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| PolicyError::Cache {
                path: path.display().to_string(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| PolicyError::Cache {
            path: path.display().to_string(),
            source,
        })?;
        log::debug!("acquired cache lock {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("could not release cache lock {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_lock_creates_directory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("state").join("tuf");
        let lock = CacheLock::acquire(&cache).unwrap();
        assert_eq!(lock.path(), cache.join(".lock"));
        assert!(cache.join(".lock").exists());
    }

    #[test]
    fn test_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().to_path_buf();
        let first = CacheLock::acquire(&cache).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                let _second = CacheLock::acquire(&cache).unwrap();
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(first);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }
}
