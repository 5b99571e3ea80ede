//! Whole-file exclusive advisory lock shared by every cooperating process.
//!
//! Each [`FileLock`] owns its own open file description, and `flock(2)` locks
//! belong to the description rather than the process. Two handles in the same
//! process therefore exclude each other exactly like handles in different
//! processes, which is what lets the control thread and the input thread of
//! the master share one lock file without any in-process mutex.

use std::{
    fs::{File, OpenOptions},
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use tracing::warn;

use crate::error::LockError;

pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
    held: bool,
}

impl FileLock {
    /// A handle that creates the lock file lazily on the first acquire.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            held: false,
        }
    }

    /// Like [`Self::new`] but creates the lock file immediately, so startup can
    /// fail fast when the lock object is unusable.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let mut lock = Self::new(path);
        lock.ensure_file()?;
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Blocks until this handle owns the lock file exclusively.
    pub fn acquire(&mut self) -> Result<LockGuard<'_>, LockError> {
        let fd = self.ensure_file()?.as_raw_fd();
        loop {
            if unsafe { libc::flock(fd, libc::LOCK_EX) } == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(LockError::Lock {
                path: self.path.clone(),
                source: err,
            });
        }
        self.held = true;
        Ok(LockGuard { lock: self })
    }

    /// Non-blocking variant of [`Self::acquire`]. `Ok(None)` means another
    /// handle currently owns the lock.
    pub fn try_acquire(&mut self) -> Result<Option<LockGuard<'_>>, LockError> {
        let fd = self.ensure_file()?.as_raw_fd();
        if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(LockError::Lock {
                    path: self.path.clone(),
                    source: err,
                }),
            };
        }
        self.held = true;
        Ok(Some(LockGuard { lock: self }))
    }

    /// Gives up ownership. A no-op when the lock is not held or the lock file
    /// was never opened.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        let Some(file) = &self.file else {
            return;
        };
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) } != 0 {
            warn!(
                path = %self.path.display(),
                error = %io::Error::last_os_error(),
                "failed to unlock"
            );
        }
    }

    fn ensure_file(&mut self) -> Result<&File, LockError> {
        let file = match self.file.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)
                .map_err(|source| LockError::Open {
                    path: self.path.clone(),
                    source,
                })?,
        };
        Ok(&*self.file.insert(file))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Releases the owning [`FileLock`] when dropped.
pub struct LockGuard<'a> {
    lock: &'a mut FileLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
