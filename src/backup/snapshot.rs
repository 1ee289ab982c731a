// src/backup/snapshot.rs

//! Host-side snapshot store
//!
//! ```text
//! <backup_dir>/
//!   <device>-<YYYYmmddTHHMMSSZ>/
//!     snapshot.json
//!     files/<relative path>
//! ```

use crate::backup::identity::DeviceIdentity;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const FILES_DIR: &str = "files";

/// Size and checksum of one stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub device_id: String,
    /// Device directory the snapshot mirrors
    pub managed_root: String,
    /// RFC 3339 creation time
    pub timestamp: String,
    pub committed: bool,
    /// What the device reported when the snapshot was started
    #[serde(default)]
    pub device_info: DeviceIdentity,
    entries: BTreeMap<String, FileRecord>,
}

impl Snapshot {
    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.entries.get(path)
    }

    /// Entries sorted by relative path
    pub fn entries(&self) -> impl Iterator<Item = (&str, &FileRecord)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|r| r.size).sum()
    }

    pub fn record(&mut self, path: impl Into<String>, record: FileRecord) {
        self.entries.insert(path.into(), record);
    }

    /// Drop entries whose path is not in `paths`, returning them
    pub fn retain_paths(&mut self, paths: &BTreeSet<&str>) -> Vec<String> {
        let gone: Vec<String> = self
            .entries
            .keys()
            .filter(|p| !paths.contains(p.as_str()))
            .cloned()
            .collect();
        for path in &gone {
            self.entries.remove(path);
        }
        gone
    }
}

/// Directory of snapshots on the host
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a new, uncommitted snapshot for a device
    pub fn create(&self, device_id: &str, managed_root: &str) -> Result<Snapshot> {
        let now = chrono::Utc::now();
        let base = format!("{}-{}", device_id, now.format("%Y%m%dT%H%M%SZ"));
        check_id(&base)?;

        let mut id = base.clone();
        let mut n = 1;
        while self.dir(&id).exists() {
            n += 1;
            id = format!("{}-{}", base, n);
        }

        fs::create_dir_all(self.dir(&id).join(FILES_DIR))?;
        let snapshot = Snapshot {
            id,
            device_id: device_id.to_string(),
            managed_root: managed_root.to_string(),
            timestamp: now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            committed: false,
            device_info: DeviceIdentity::default(),
            entries: BTreeMap::new(),
        };
        self.save(&snapshot)?;
        debug!("Created snapshot {}", snapshot.id);
        Ok(snapshot)
    }

    pub fn dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Host path of the stored copy of `relative`
    pub fn stored_path(&self, id: &str, relative: &str) -> PathBuf {
        let mut path = self.dir(id).join(FILES_DIR);
        for component in relative.split('/').filter(|c| !c.is_empty()) {
            path.push(component);
        }
        path
    }

    pub fn load(&self, id: &str) -> Result<Snapshot> {
        check_id(id)?;
        let path = self.dir(id).join(SNAPSHOT_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("snapshot {}", id)));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Persist the snapshot manifest, replacing the previous one atomically
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let dir = self.dir(&snapshot.id);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, snapshot)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(SNAPSHOT_FILE)).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Snapshots in the store, newest first, optionally for one device
    pub fn list(&self, device_id: Option<&str>) -> Result<Vec<Snapshot>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.load(&id) {
                Ok(snapshot) => {
                    if device_id.is_none_or(|d| d == snapshot.device_id) {
                        snapshots.push(snapshot);
                    }
                }
                Err(Error::NotFound(_)) => {}
                Err(e) => warn!("Ignoring unreadable snapshot {}: {}", id, e),
            }
        }
        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    pub fn latest(&self, device_id: &str) -> Result<Option<Snapshot>> {
        Ok(self.list(Some(device_id))?.into_iter().next())
    }

    pub fn latest_committed(&self, device_id: &str) -> Result<Option<Snapshot>> {
        Ok(self
            .list(Some(device_id))?
            .into_iter()
            .find(|s| s.committed))
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        check_id(id)?;
        let dir = self.dir(id);
        if !dir.join(SNAPSHOT_FILE).is_file() {
            return Err(Error::NotFound(format!("snapshot {}", id)));
        }
        fs::remove_dir_all(&dir)?;
        debug!("Deleted snapshot {}", id);
        Ok(())
    }
}

/// Snapshot ids are single path components
fn check_id(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\\') {
        return Err(Error::NotFound(format!("snapshot {}", id)));
    }
    Ok(())
}
