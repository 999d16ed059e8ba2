//! Advisory whole-file lock on the agent pid file
//!
//! Exactly one agent per workdir may hold this lock. Losing the file
//! descriptor (process exit included) releases it.

use crate::error::{CharonError, CharonResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Holder of the pid-file lock. Unlocks on drop.
#[derive(Debug)]
pub struct Lockfile {
    file: File,
}

impl Lockfile {
    /// Open (creating if needed) and lock the pid file, non-blocking.
    /// Failure to lock means another agent is already running; callers must
    /// treat that as a non-fatal exit.
    pub fn acquire(path: &Path) -> CharonResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| CharonError::io(format!("opening lock file {}", path.display()), e))?;

        file.try_lock_exclusive().map_err(CharonError::LockHeld)?;

        file.set_len(0)
            .and_then(|()| write!(file, "{}", std::process::id()))
            .map_err(|e| CharonError::io("writing pid to agent lock file", e))?;

        Ok(Self { file })
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_writes_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.pid");
        let _lock = Lockfile::acquire(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.pid");
        let _lock = Lockfile::acquire(&path).unwrap();

        match Lockfile::acquire(&path) {
            Err(CharonError::LockHeld(_)) => {}
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[test]
    fn drop_releases_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.pid");
        {
            let _lock = Lockfile::acquire(&path).unwrap();
        }
        let _again = Lockfile::acquire(&path).unwrap();
    }
}
