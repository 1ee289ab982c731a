// src/device/lock.rs

//! Cross-process exclusive lock on one device
//!
//! A [`DeviceLock`] is `flock(LOCK_EX)` on `<lock dir>/<device>.lock`. It is
//! held for the whole life of a [`DeviceSession`](super::DeviceSession), so
//! two tabsync processes never run sessions against the same device at
//! once. The lock goes away when the file handle is closed, including when
//! the holding process dies.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug)]
pub struct DeviceLock {
    /// Kept open to hold the lock
    _file: File,
    path: PathBuf,
}

impl DeviceLock {
    /// Lock file for a device; anything but `[A-Za-z0-9._-]` becomes `_`
    pub fn path_for(lock_dir: &Path, device_id: &str) -> PathBuf {
        let name: String = device_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        lock_dir.join(format!("{}.lock", name))
    }

    /// Acquire the lock, blocking while another process holds it
    pub fn acquire(lock_dir: &Path, device_id: &str) -> Result<Self> {
        let (file, path) = open_lock_file(lock_dir, device_id)?;
        file.lock_exclusive().map_err(|e| {
            Error::Connection(format!("failed to lock device {}: {}", device_id, e))
        })?;
        debug!("Acquired device lock {}", path.display());
        Ok(Self { _file: file, path })
    }

    /// Acquire the lock only if nobody holds it
    pub fn try_acquire(lock_dir: &Path, device_id: &str) -> Result<Option<Self>> {
        let (file, path) = open_lock_file(lock_dir, device_id)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired device lock {}", path.display());
                Ok(Some(Self { _file: file, path }))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("Device lock {} is held elsewhere", path.display());
                Ok(None)
            }
            Err(e) => Err(Error::Connection(format!(
                "failed to lock device {}: {}",
                device_id, e
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        debug!("Released device lock {}", self.path.display());
    }
}

fn open_lock_file(lock_dir: &Path, device_id: &str) -> Result<(File, PathBuf)> {
    fs::create_dir_all(lock_dir)?;
    let path = DeviceLock::path_for(lock_dir, device_id);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    Ok((file, path))
}
