// src/packages/registry.rs

//! Installed-package registry stored on the device
//!
//! The registry is a JSON document under the install prefix. It is never
//! edited in place: every save writes a temporary sibling and renames it
//! over the previous version, so a reader sees either the old or the new
//! registry.

use crate::config::Config;
use crate::device::Connection;
use crate::device::path::parent;
use crate::error::{Error, Result};
use crate::packages::manifest::Manifest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Current on-device registry format
pub const REGISTRY_FORMAT: u32 = 1;

/// One installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub version: String,
    pub manifest: Manifest,
    /// Directories the install created, relative to the prefix
    #[serde(default)]
    pub created_dirs: Vec<String>,
    pub installed_at: String,
}

impl RegistryEntry {
    pub fn new(version: impl Into<String>, manifest: Manifest, created_dirs: Vec<String>) -> Self {
        Self {
            version: version.into(),
            manifest,
            created_dirs,
            installed_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    format: u32,
    packages: BTreeMap<String, RegistryEntry>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            format: REGISTRY_FORMAT,
            packages: BTreeMap::new(),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the registry from the device; a missing file is an empty registry
    pub fn load(conn: &mut dyn Connection, config: &Config) -> Result<Self> {
        let path = config.registry_path();
        let bytes = match conn.read_file(&path) {
            Ok(bytes) => bytes,
            Err(Error::NotFound(_)) => {
                debug!("No registry at {}, starting empty", path);
                return Ok(Self::new());
            }
            Err(e) => return Err(e),
        };
        Self::from_json(&bytes)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let registry: Self = serde_json::from_slice(bytes)?;
        if registry.format != REGISTRY_FORMAT {
            return Err(Error::Format(format!(
                "unsupported registry format {}",
                registry.format
            )));
        }
        Ok(registry)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Atomically replace the registry on the device
    pub fn save(&self, conn: &mut dyn Connection, config: &Config) -> Result<()> {
        let path = config.registry_path();
        if let Some(dir) = parent(&path) {
            conn.create_dir_all(dir)?;
        }
        conn.write_file_atomic(&path, &self.to_json()?)?;
        debug!("Saved registry with {} package(s) to {}", self.len(), path);
        Ok(())
    }

    pub fn get(&self, package_id: &str) -> Option<&RegistryEntry> {
        self.packages.get(package_id)
    }

    pub fn contains(&self, package_id: &str) -> bool {
        self.packages.contains_key(package_id)
    }

    /// Insert or replace an entry, returning the previous one
    pub fn insert(&mut self, package_id: impl Into<String>, entry: RegistryEntry) -> Option<RegistryEntry> {
        self.packages.insert(package_id.into(), entry)
    }

    pub fn remove(&mut self, package_id: &str) -> Option<RegistryEntry> {
        self.packages.remove(package_id)
    }

    /// Entries sorted by package identifier
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegistryEntry)> {
        self.packages.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Package owning a relative path, if any
    pub fn owner_of(&self, path: &str) -> Option<&str> {
        self.iter()
            .find(|(_, entry)| entry.manifest.contains(path))
            .map(|(id, _)| id)
    }

    /// Relative paths owned by any package except `except`
    pub fn paths_owned_by_others(&self, except: &str) -> BTreeSet<&str> {
        self.iter()
            .filter(|(id, _)| *id != except)
            .flat_map(|(_, entry)| entry.manifest.iter())
            .collect()
    }

    /// Created directories recorded by any package except `except`
    pub fn dirs_recorded_by_others(&self, except: &str) -> BTreeSet<&str> {
        self.iter()
            .filter(|(id, _)| *id != except)
            .flat_map(|(_, entry)| entry.created_dirs.iter().map(String::as_str))
            .collect()
    }
}
