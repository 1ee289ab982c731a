// src/device/mod.rs

//! Device connection management
//!
//! A [`Connection`] is the only way the engines touch a device. Two
//! implementations exist:
//! - [`LocalConnection`]: the "device" is a directory on this machine
//! - [`SshConnection`]: a real tablet reached over SSH
//!
//! Connections are owned by a [`DeviceManager`], which keeps at most one open
//! connection per device and hands out exclusive [`DeviceSession`]s so that
//! installs, removals, backups and restores on one device never interleave.
//! A session holds both the in-process mutex and a [`DeviceLock`] file lock,
//! which keeps separate tabsync processes apart as well.

pub mod local;
pub mod lock;
pub mod path;
pub mod retry;
pub mod ssh;
#[cfg(test)]
pub(crate) mod testing;

pub use local::LocalConnection;
pub use lock::DeviceLock;
pub use retry::RetryPolicy;
pub use ssh::{SshConnection, SshTarget};

use crate::config::Config;
use crate::db::models::{Device, DeviceKind};
use crate::error::{Error, Result};
use crate::hash::sha256_hex;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tracing::debug;

/// Output of a command run on the device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Size and (when the device can compute it cheaply) checksum of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub checksum: Option<String>,
}

/// Remote command execution and file transfer against one device
///
/// Paths are absolute device paths. Implementations map every failure into
/// [`Error::Connection`] or [`Error::NotFound`]; raw transport errors never
/// cross this boundary.
pub trait Connection: Send {
    /// Identifier used in log messages
    fn describe(&self) -> String;

    /// Run a shell command on the device
    fn exec(&mut self, command: &str) -> Result<CommandOutput>;

    /// Read a whole file
    fn read_file(&mut self, path: &str) -> Result<Vec<u8>>;

    /// Create or truncate a file with the given contents
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()>;

    /// Regular files below `root`, as sorted relative paths
    fn list_tree(&mut self, root: &str) -> Result<Vec<String>>;

    /// Stat a regular file; `None` when it does not exist
    fn stat(&mut self, path: &str) -> Result<Option<FileStat>>;

    fn create_dir_all(&mut self, path: &str) -> Result<()>;

    /// Remove a file; [`Error::NotFound`] when it is already gone
    fn remove_file(&mut self, path: &str) -> Result<()>;

    /// Remove an empty directory
    fn remove_dir(&mut self, path: &str) -> Result<()>;

    /// Rename a file, replacing the destination
    fn rename(&mut self, from: &str, to: &str) -> Result<()>;

    /// Whether a directory exists
    fn dir_exists(&mut self, path: &str) -> Result<bool>;

    /// Set the permission bits of a file
    fn set_permissions(&mut self, path: &str, mode: u32) -> Result<()>;

    /// Checksum of the file as it is stored on the device
    fn checksum(&mut self, path: &str) -> Result<String> {
        if let Some(FileStat {
            checksum: Some(sum), ..
        }) = self.stat(path)?
        {
            return Ok(sum);
        }
        let data = self.read_file(path)?;
        Ok(sha256_hex(&data))
    }

    /// Write a file through a temporary sibling and rename it into place
    fn write_file_atomic(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let tmp = temp_sibling(path);
        self.write_file(&tmp, data)?;
        if let Err(e) = self.rename(&tmp, path) {
            let _ = self.remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    }
}

/// Temporary path beside `path`, used for write-then-rename
pub fn temp_sibling(path: &str) -> String {
    format!("{}.tabsync-tmp", path)
}

/// Open a connection for a registered device
pub fn connect(device: &Device, config: &Config) -> Result<Box<dyn Connection>> {
    match device.kind {
        DeviceKind::Local => {
            let base = device.host.as_deref().ok_or_else(|| {
                Error::InitError(format!("local device {} has no base directory", device.name))
            })?;
            Ok(Box::new(LocalConnection::new(base)?))
        }
        DeviceKind::Ssh => {
            let target = SshTarget {
                host: device
                    .host
                    .clone()
                    .ok_or_else(|| Error::InitError(format!("device {} has no host", device.name)))?,
                port: device.port.unwrap_or(22),
                user: device.user.clone().unwrap_or_else(|| "root".to_string()),
                key_path: device.key_path.clone(),
                password: std::env::var("TABSYNC_SSH_PASSWORD").ok(),
            };
            Ok(Box::new(SshConnection::connect(
                target,
                config.retry,
                config.call_timeout,
            )?))
        }
    }
}

/// Shared flag checked between file units
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Cancelled`] if cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Holds the open connection of every known device
pub struct DeviceManager {
    connections: HashMap<String, Mutex<Box<dyn Connection>>>,
    lock_dir: PathBuf,
}

impl DeviceManager {
    /// Manager whose sessions take their file locks in `lock_dir`
    pub fn new(lock_dir: impl AsRef<Path>) -> Self {
        Self {
            connections: HashMap::new(),
            lock_dir: lock_dir.as_ref().to_path_buf(),
        }
    }

    /// Register the connection for a device; a device can only be
    /// registered once
    pub fn register(&mut self, device_id: &str, conn: Box<dyn Connection>) -> Result<()> {
        if self.connections.contains_key(device_id) {
            return Err(Error::Connection(format!(
                "device {} already has an open connection",
                device_id
            )));
        }
        debug!("Registered connection for {}: {}", device_id, conn.describe());
        self.connections.insert(device_id.to_string(), Mutex::new(conn));
        Ok(())
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.connections.contains_key(device_id)
    }

    /// Acquire the device exclusively, waiting for any session in progress
    pub fn session(&self, device_id: &str) -> Result<DeviceSession<'_>> {
        let (id, lock) = self.lookup(device_id)?;
        let guard = lock
            .lock()
            .map_err(|_| Error::Connection(format!("device {} lock poisoned", device_id)))?;
        let file_lock = DeviceLock::acquire(&self.lock_dir, id)?;
        debug!("Acquired session on {}", device_id);
        Ok(DeviceSession {
            device_id: id,
            conn: guard,
            _lock: file_lock,
        })
    }

    /// Acquire the device only if no other session holds it
    pub fn try_session(&self, device_id: &str) -> Result<Option<DeviceSession<'_>>> {
        let (id, lock) = self.lookup(device_id)?;
        let guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Poisoned(_)) => {
                return Err(Error::Connection(format!("device {} lock poisoned", device_id)));
            }
        };
        Ok(DeviceLock::try_acquire(&self.lock_dir, id)?.map(|file_lock| DeviceSession {
            device_id: id,
            conn: guard,
            _lock: file_lock,
        }))
    }

    fn lookup(&self, device_id: &str) -> Result<(&str, &Mutex<Box<dyn Connection>>)> {
        self.connections
            .get_key_value(device_id)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))
    }
}

/// Exclusive access to one device for the duration of a session
pub struct DeviceSession<'a> {
    device_id: &'a str,
    conn: MutexGuard<'a, Box<dyn Connection>>,
    _lock: DeviceLock,
}

impl DeviceSession<'_> {
    pub fn device_id(&self) -> &str {
        self.device_id
    }
}

impl Deref for DeviceSession<'_> {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        &**self.conn
    }
}

impl DerefMut for DeviceSession<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn manager_with_local() -> (tempfile::TempDir, DeviceManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_on(dir.path());
        (dir, manager)
    }

    /// A manager as a separate process would build it: device files in
    /// `root/device`, locks in `root/locks`
    fn manager_on(root: &Path) -> DeviceManager {
        let device = root.join("device");
        std::fs::create_dir_all(&device).unwrap();
        let mut manager = DeviceManager::new(root.join("locks"));
        manager
            .register("tablet", Box::new(LocalConnection::new(&device).unwrap()))
            .unwrap();
        manager
    }

    #[test]
    fn test_register_twice_is_rejected() {
        let (dir, mut manager) = manager_with_local();
        let second = LocalConnection::new(dir.path()).unwrap();
        assert!(manager.register("tablet", Box::new(second)).is_err());
    }

    #[test]
    fn test_unknown_device_is_not_found() {
        let (_dir, manager) = manager_with_local();
        assert!(matches!(manager.session("other"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_session_is_exclusive() {
        let (_dir, manager) = manager_with_local();
        let session = manager.session("tablet").unwrap();
        assert_eq!(session.device_id(), "tablet");
        assert!(manager.try_session("tablet").unwrap().is_none());
        drop(session);
        assert!(manager.try_session("tablet").unwrap().is_some());
    }

    #[test]
    fn test_sessions_serialize_across_threads() {
        let (_dir, manager) = manager_with_local();
        thread::scope(|scope| {
            for _ in 0..4 {
                let manager = &manager;
                scope.spawn(move || {
                    let mut session = manager.session("tablet").unwrap();
                    let path = "/counter";
                    let current = match session.read_file(path) {
                        Ok(bytes) => String::from_utf8(bytes).unwrap().parse::<u32>().unwrap(),
                        Err(_) => 0,
                    };
                    session.write_file(path, (current + 1).to_string().as_bytes()).unwrap();
                });
            }
        });
        let mut session = manager.session("tablet").unwrap();
        assert_eq!(session.read_file("/counter").unwrap(), b"4");
    }

    #[test]
    fn test_session_excludes_other_managers() {
        let dir = tempfile::tempdir().unwrap();
        let first = manager_on(dir.path());
        let second = manager_on(dir.path());

        let held = first.session("tablet").unwrap();
        assert!(second.try_session("tablet").unwrap().is_none());
        drop(held);

        let taken = second.try_session("tablet").unwrap();
        assert!(taken.is_some());
        assert!(first.try_session("tablet").unwrap().is_none());
    }

    #[test]
    fn test_blocking_session_waits_for_other_manager() {
        let dir = tempfile::tempdir().unwrap();
        let first = manager_on(dir.path());
        let second = manager_on(dir.path());

        let mut held = first.session("tablet").unwrap();
        thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let mut session = second.session("tablet").unwrap();
                session.read_file("/marker").unwrap()
            });
            thread::sleep(std::time::Duration::from_millis(100));
            held.write_file("/marker", b"written first").unwrap();
            drop(held);
            assert_eq!(waiter.join().unwrap(), b"written first");
        });
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.clone().cancel();
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_default_checksum_reads_file() {
        let (_dir, manager) = manager_with_local();
        let mut session = manager.session("tablet").unwrap();
        session.write_file_atomic("/a.txt", b"hello").unwrap();
        assert_eq!(session.checksum("/a.txt").unwrap(), sha256_hex(b"hello"));
        assert_eq!(session.stat("/a.txt.tabsync-tmp").unwrap(), None);
    }
}
