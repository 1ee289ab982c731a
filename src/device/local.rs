// src/device/local.rs

//! Local filesystem shim
//!
//! Treats a host directory as the root of a device, so `/home/root/x` on
//! the "device" is `<base>/home/root/x` on the host. Used for sample
//! devices, staging and tests.

use super::{CommandOutput, Connection, FileStat};
use crate::error::{Error, Result};
use crate::hash::hash_file;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

pub struct LocalConnection {
    base: PathBuf,
}

impl LocalConnection {
    /// Open a shim rooted at `base`, which must be an existing directory
    pub fn new(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref();
        if !base.is_dir() {
            return Err(Error::NotFound(format!(
                "local device root {}",
                base.display()
            )));
        }
        Ok(Self {
            base: base.to_path_buf(),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Host path backing a device path
    pub fn host_path(&self, device_path: &str) -> Result<PathBuf> {
        let mut out = self.base.clone();
        for component in device_path.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    return Err(Error::Connection(format!(
                        "refusing path outside device root: {}",
                        device_path
                    )));
                }
                c => out.push(c),
            }
        }
        Ok(out)
    }
}

fn map_io(path: &str, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::NotFound(path.to_string())
    } else {
        Error::Connection(format!("{}: {}", path, err))
    }
}

impl Connection for LocalConnection {
    fn describe(&self) -> String {
        format!("local:{}", self.base.display())
    }

    fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.base)
            .output()
            .map_err(|e| Error::Connection(format!("failed to spawn shell: {}", e)))?;

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.host_path(path)?).map_err(|e| map_io(path, e))
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        fs::write(self.host_path(path)?, data).map_err(|e| map_io(path, e))
    }

    fn list_tree(&mut self, root: &str) -> Result<Vec<String>> {
        let host_root = self.host_path(root)?;
        if !host_root.is_dir() {
            return Err(Error::NotFound(root.to_string()));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&host_root).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Connection(format!("{}: {}", root, e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&host_root)
                .map_err(|e| Error::Connection(e.to_string()))?;
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            files.push(parts.join("/"));
        }
        files.sort();
        Ok(files)
    }

    fn stat(&mut self, path: &str) -> Result<Option<FileStat>> {
        let host = self.host_path(path)?;
        match fs::metadata(&host) {
            Ok(meta) if meta.is_file() => {
                let checksum = hash_file(&host).map_err(|e| map_io(path, e))?;
                Ok(Some(FileStat {
                    size: meta.len(),
                    checksum: Some(checksum),
                }))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(path, e)),
        }
    }

    fn create_dir_all(&mut self, path: &str) -> Result<()> {
        fs::create_dir_all(self.host_path(path)?).map_err(|e| map_io(path, e))
    }

    fn remove_file(&mut self, path: &str) -> Result<()> {
        fs::remove_file(self.host_path(path)?).map_err(|e| map_io(path, e))
    }

    fn remove_dir(&mut self, path: &str) -> Result<()> {
        fs::remove_dir(self.host_path(path)?).map_err(|e| map_io(path, e))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.host_path(from)?, self.host_path(to)?).map_err(|e| map_io(from, e))
    }

    fn dir_exists(&mut self, path: &str) -> Result<bool> {
        Ok(self.host_path(path)?.is_dir())
    }

    #[cfg(unix)]
    fn set_permissions(&mut self, path: &str, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(self.host_path(path)?, fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| map_io(path, e))
    }

    #[cfg(not(unix))]
    fn set_permissions(&mut self, path: &str, _mode: u32) -> Result<()> {
        self.host_path(path)?;
        Ok(())
    }
}
