// src/config.rs

//! Runtime configuration
//!
//! A [`Config`] is built once by the caller and passed explicitly to every
//! engine call; nothing reads the install prefix from process state after
//! that.
//!
//! ## Host data directory resolution
//!
//! 1. `TABSYNC_DATA_DIR` environment variable (if set)
//! 2. `$XDG_DATA_HOME/tabsync`
//! 3. `~/.local/share/tabsync`

use crate::device::RetryPolicy;
use crate::device::path::join;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default per-call transport timeout
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Install prefix used when `PREFIX` is unset and no home is known
pub const DEVICE_HOME_PREFIX: &str = "/home/root/.local";

#[derive(Debug, Clone)]
pub struct Config {
    /// Install root on the target filesystem (a device path)
    pub prefix: String,
    /// Host directory holding the database and snapshot store
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    /// Per-device session lock files
    pub lock_dir: PathBuf,
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
}

impl Config {
    /// Resolve the configuration from the environment
    pub fn from_env() -> Result<Self> {
        let data_dir = match std::env::var("TABSYNC_DATA_DIR") {
            Ok(custom) => PathBuf::from(custom),
            Err(_) => resolve_default_data_dir()?,
        };
        Ok(Self::with_data_dir(data_dir).with_prefix(default_prefix()))
    }

    /// Configuration rooted at an explicit data directory (useful for testing)
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            prefix: DEVICE_HOME_PREFIX.to_string(),
            db_path: data_dir.join("tabsync.db"),
            backup_dir: data_dir.join("backups"),
            lock_dir: data_dir.join("locks"),
            data_dir,
            retry: RetryPolicy::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let trimmed = prefix.trim_end_matches('/');
        self.prefix = if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() };
        self
    }

    /// Where the installed registry lives on the target
    pub fn registry_path(&self) -> String {
        join(&self.prefix, "share/tabsync/registry.json")
    }

    /// Absolute target path of a manifest entry
    pub fn target_path(&self, relative: &str) -> String {
        join(&self.prefix, relative)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir).map_err(|e| {
            Error::InitError(format!("Failed to create data directory: {}", e))
        })?;
        std::fs::create_dir_all(&self.backup_dir).map_err(|e| {
            Error::InitError(format!("Failed to create backup directory: {}", e))
        })?;
        Ok(())
    }
}

/// `PREFIX` from the environment, else `$HOME/.local`
pub fn default_prefix() -> String {
    if let Ok(prefix) = std::env::var("PREFIX")
        && !prefix.is_empty()
    {
        return prefix;
    }
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => join(&home, ".local"),
        _ => DEVICE_HOME_PREFIX.to_string(),
    }
}

fn resolve_default_data_dir() -> Result<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME")
        && !xdg.is_empty()
    {
        return Ok(PathBuf::from(xdg).join("tabsync"));
    }
    let home = std::env::var("HOME")
        .map_err(|_| Error::InitError("HOME environment variable not set".to_string()))?;
    Ok(PathBuf::from(home).join(".local").join("share").join("tabsync"))
}
