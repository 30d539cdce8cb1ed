// =============================================================================
// SingleInstanceLock — exclusive advisory lock preventing a second engine
// =============================================================================
//
// Open-or-create the lock file, attempt a non-blocking exclusive `flock`,
// and on success truncate it and write our own pid so a human inspecting
// the file can tell who holds it. Released automatically on drop.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SingleInstanceError {
    #[error("another instance is already running (pid={0:?}): {1}")]
    AlreadyRunning(Option<u32>, String),
    #[error("failed to open lock file {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

/// Holds an exclusive `flock` on a pidfile for as long as it is alive.
pub struct SingleInstanceLock {
    path: PathBuf,
    file: Option<File>,
}

impl SingleInstanceLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    /// Acquire the lock, or return `AlreadyRunning` with the pid recorded by
    /// whoever holds it (best-effort — a stale pidfile with no live holder
    /// still fails the `flock`, since the OS releases it on process exit).
    pub fn acquire(&mut self) -> Result<(), SingleInstanceError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SingleInstanceError::Io(self.path.clone(), e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| SingleInstanceError::Io(self.path.clone(), e))?;

        let existing_pid = read_pid(&mut file);

        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&file);
        let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(SingleInstanceError::AlreadyRunning(
                existing_pid,
                self.path.display().to_string(),
            ));
        }

        file.set_len(0).map_err(|e| SingleInstanceError::Io(self.path.clone(), e))?;
        file.seek(SeekFrom::Start(0)).ok();
        writeln!(file, "{}", std::process::id())
            .map_err(|e| SingleInstanceError::Io(self.path.clone(), e))?;
        file.flush().ok();

        self.file = Some(file);
        Ok(())
    }

    /// Release the lock early. A no-op if never acquired; also runs
    /// automatically on drop.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let fd = std::os::unix::io::AsRawFd::as_raw_fd(&file);
            unsafe {
                libc::flock(fd, libc::LOCK_UN);
            }
        }
    }
}

impl Drop for SingleInstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    file.seek(SeekFrom::Start(0)).ok()?;
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    content.split_whitespace().next()?.parse::<u32>().ok().filter(|p| *p > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aurora.lock");
        let mut lock = SingleInstanceLock::new(&path);
        lock.acquire().unwrap();
        lock.release();
    }

    #[test]
    fn second_acquire_in_same_process_fails_because_the_fd_is_still_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aurora.lock");
        let mut lock1 = SingleInstanceLock::new(&path);
        lock1.acquire().unwrap();

        let mut lock2 = SingleInstanceLock::new(&path);
        let result = lock2.acquire();
        assert!(result.is_err());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aurora.lock");
        {
            let mut lock1 = SingleInstanceLock::new(&path);
            lock1.acquire().unwrap();
        }
        let mut lock2 = SingleInstanceLock::new(&path);
        assert!(lock2.acquire().is_ok());
    }
}
