//! Single-instance file lock with stale-process detection.
//!
//! The lock file records the holder's pid. A second engine refuses to start
//! while that pid is alive and reclaims the lock when it is not, so a crash
//! without cleanup never deadlocks the project.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct EngineLock {
    path: PathBuf,
    held: bool,
}

fn pid_alive(pid: u32) -> bool {
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    system.process(Pid::from_u32(pid)).is_some()
}

impl EngineLock {
    /// Acquire the lock, reclaiming it when the recorded holder is dead.
    pub fn acquire(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    return Ok(Self { path, held: true });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if pid != std::process::id() && pid_alive(pid) => {
                            return Err(Error::LockHeld(path));
                        }
                        _ => {
                            // Stale or unreadable — reclaim
                            warn!("reclaiming stale lock at {}", path.display());
                            fs::remove_file(&path)?;
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Release early (before drop), e.g. for the cautious-mode pause.
    pub fn release(&mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if self.held {
            self.held = false;
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove lock {}: {e}", self.path.display());
                }
            } else {
                info!("released lock {}", self.path.display());
            }
        }
    }
}

impl Drop for EngineLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_refuses_live_holder() {
        let dir = std::env::temp_dir().join(format!("evonest-lock-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(".lock");

        // Our own pid is alive, so a foreign lock naming it is "held"
        fs::write(&path, format!("{}", std::process::id())).unwrap();
        // Same pid is treated as reclaimable (we are the holder)
        let lock = EngineLock::acquire(path.clone()).unwrap();
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn acquire_reclaims_dead_holder() {
        let dir = std::env::temp_dir().join(format!("evonest-lock2-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(".lock");

        // Pid 0 / garbage is never a live holder
        fs::write(&path, "0").unwrap();
        let lock = EngineLock::acquire(path.clone());
        assert!(lock.is_ok());
        drop(lock);
        let _ = fs::remove_dir_all(&dir);
    }
}
