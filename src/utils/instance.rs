use crate::error::InstanceError;
use fd_lock::{RwLock, RwLockWriteGuard};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Advisory lock keeping a single daemon per data directory.
pub struct InstanceLock {
    path: PathBuf,
    lock: RwLock<File>,
}

impl InstanceLock {
    pub fn open(path: &Path) -> Result<Self, InstanceError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| InstanceError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            lock: RwLock::new(file),
        })
    }

    /// Takes the lock without waiting and records our pid in the file.
    /// The lock is released when the guard drops.
    pub fn acquire(&mut self) -> Result<RwLockWriteGuard<'_, File>, InstanceError> {
        let path = &self.path;
        let io_err = |source| InstanceError::Io {
            path: path.clone(),
            source,
        };

        let mut guard = match self.lock.try_write() {
            Ok(guard) => guard,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(InstanceError::Held(path.clone()));
            }
            Err(e) => return Err(io_err(e)),
        };
        guard.set_len(0).map_err(io_err)?;
        writeln!(*guard, "{}", std::process::id()).map_err(io_err)?;
        debug!(path = %path.display(), "Instance lock acquired");
        Ok(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_instance_is_refused_while_first_runs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("potion-runner.lock");

        let mut first = InstanceLock::open(&path).unwrap();
        let guard = first.acquire().unwrap();

        let mut second = InstanceLock::open(&path).unwrap();
        assert!(matches!(second.acquire(), Err(InstanceError::Held(p)) if p == path));

        drop(guard);
        assert!(second.acquire().is_ok());
        let pid = std::fs::read_to_string(&path).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
    }
}
