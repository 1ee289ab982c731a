// src/db/models.rs

//! Data models for tabsync database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;

/// How a device is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Ssh,
    Local,
}

impl DeviceKind {
    pub fn as_str(&self) -> &str {
        match self {
            DeviceKind::Ssh => "ssh",
            DeviceKind::Local => "local",
        }
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ssh" => Ok(DeviceKind::Ssh),
            "local" => Ok(DeviceKind::Local),
            _ => Err(format!("Invalid device kind: {}", s)),
        }
    }
}

/// A registered device
///
/// For `Local` devices `host` holds the host directory acting as the device
/// root.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: Option<i64>,
    pub name: String,
    pub kind: DeviceKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub key_path: Option<String>,
    pub managed_root: String,
    pub created_at: Option<String>,
}

impl Device {
    /// Create a new SSH device
    pub fn ssh(name: String, host: String, managed_root: String) -> Self {
        Self {
            id: None,
            name,
            kind: DeviceKind::Ssh,
            host: Some(host),
            port: None,
            user: None,
            key_path: None,
            managed_root,
            created_at: None,
        }
    }

    /// Create a new local-directory device
    pub fn local(name: String, base_dir: String, managed_root: String) -> Self {
        Self {
            id: None,
            name,
            kind: DeviceKind::Local,
            host: Some(base_dir),
            port: None,
            user: None,
            key_path: None,
            managed_root,
            created_at: None,
        }
    }

    /// Insert this device into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO devices (name, kind, host, port, user, key_path, managed_root)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &self.name,
                self.kind.as_str(),
                &self.host,
                &self.port,
                &self.user,
                &self.key_path,
                &self.managed_root,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a device by name
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, host, port, user, key_path, managed_root, created_at
             FROM devices WHERE name = ?1",
        )?;

        let device = stmt.query_row([name], Self::from_row).optional()?;

        Ok(device)
    }

    /// Find a device by name, failing with `NotFound` when it is unknown
    pub fn require(conn: &Connection, name: &str) -> Result<Self> {
        Self::find_by_name(conn, name)?.ok_or_else(|| Error::NotFound(format!("device {}", name)))
    }

    /// List all devices
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, host, port, user, key_path, managed_root, created_at
             FROM devices ORDER BY name",
        )?;

        let devices = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(devices)
    }

    /// Delete a device by name, returning whether it existed
    pub fn delete(conn: &Connection, name: &str) -> Result<bool> {
        let rows = conn.execute("DELETE FROM devices WHERE name = ?1", [name])?;
        Ok(rows > 0)
    }

    /// Convert a database row to a Device
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let kind_str: String = row.get(2)?;
        let kind = kind_str.parse::<DeviceKind>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            kind,
            host: row.get(3)?,
            port: row.get(4)?,
            user: row.get(5)?,
            key_path: row.get(6)?,
            managed_root: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

/// What a changeset did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangesetKind {
    Install,
    Remove,
    Cleanup,
    Backup,
    Restore,
}

impl ChangesetKind {
    pub fn as_str(&self) -> &str {
        match self {
            ChangesetKind::Install => "install",
            ChangesetKind::Remove => "remove",
            ChangesetKind::Cleanup => "cleanup",
            ChangesetKind::Backup => "backup",
            ChangesetKind::Restore => "restore",
        }
    }
}

impl FromStr for ChangesetKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "install" => Ok(ChangesetKind::Install),
            "remove" => Ok(ChangesetKind::Remove),
            "cleanup" => Ok(ChangesetKind::Cleanup),
            "backup" => Ok(ChangesetKind::Backup),
            "restore" => Ok(ChangesetKind::Restore),
            _ => Err(format!("Invalid changeset kind: {}", s)),
        }
    }
}

/// Changeset status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangesetStatus {
    Pending,
    Applied,
    Failed,
}

impl ChangesetStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ChangesetStatus::Pending => "pending",
            ChangesetStatus::Applied => "applied",
            ChangesetStatus::Failed => "failed",
        }
    }
}

impl FromStr for ChangesetStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChangesetStatus::Pending),
            "applied" => Ok(ChangesetStatus::Applied),
            "failed" => Ok(ChangesetStatus::Failed),
            _ => Err(format!("Invalid changeset status: {}", s)),
        }
    }
}

/// A Changeset records one device session and its outcome
#[derive(Debug, Clone)]
pub struct Changeset {
    pub id: Option<i64>,
    pub description: String,
    pub kind: ChangesetKind,
    pub device_name: Option<String>,
    pub status: ChangesetStatus,
    pub detail: Option<String>,
    pub created_at: Option<String>,
    pub applied_at: Option<String>,
    pub failed_at: Option<String>,
}

impl Changeset {
    /// Create a new Changeset
    pub fn new(kind: ChangesetKind, description: String, device_name: Option<String>) -> Self {
        Self {
            id: None,
            description,
            kind,
            device_name,
            status: ChangesetStatus::Pending,
            detail: None,
            created_at: None,
            applied_at: None,
            failed_at: None,
        }
    }

    /// Insert this changeset into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO changesets (description, kind, device_name, status, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &self.description,
                self.kind.as_str(),
                &self.device_name,
                self.status.as_str(),
                &self.detail,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a changeset by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, kind, device_name, status, detail, created_at, applied_at, failed_at
             FROM changesets WHERE id = ?1",
        )?;

        let changeset = stmt.query_row([id], Self::from_row).optional()?;

        Ok(changeset)
    }

    /// List all changesets, newest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, kind, device_name, status, detail, created_at, applied_at, failed_at
             FROM changesets ORDER BY id DESC",
        )?;

        let changesets = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(changesets)
    }

    /// List changesets of one device, newest first
    pub fn find_by_device(conn: &Connection, device_name: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, kind, device_name, status, detail, created_at, applied_at, failed_at
             FROM changesets WHERE device_name = ?1 ORDER BY id DESC",
        )?;

        let changesets = stmt
            .query_map([device_name], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(changesets)
    }

    /// Update changeset status, stamping the matching timestamp column
    pub fn update_status(
        &mut self,
        conn: &Connection,
        new_status: ChangesetStatus,
        detail: Option<String>,
    ) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InitError("Cannot update changeset without ID".to_string()))?;

        let timestamp_field = match new_status {
            ChangesetStatus::Applied => "applied_at",
            ChangesetStatus::Failed => "failed_at",
            ChangesetStatus::Pending => "",
        };

        if !timestamp_field.is_empty() {
            conn.execute(
                &format!(
                    "UPDATE changesets SET status = ?1, detail = ?2, {} = CURRENT_TIMESTAMP WHERE id = ?3",
                    timestamp_field
                ),
                params![new_status.as_str(), &detail, id],
            )?;
        } else {
            conn.execute(
                "UPDATE changesets SET status = ?1, detail = ?2 WHERE id = ?3",
                params![new_status.as_str(), &detail, id],
            )?;
        }

        self.status = new_status;
        self.detail = detail;
        Ok(())
    }

    /// Convert a database row to a Changeset
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let kind_str: String = row.get(2)?;
        let kind = kind_str.parse::<ChangesetKind>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;
        let status_str: String = row.get(4)?;
        let status = status_str.parse::<ChangesetStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        Ok(Self {
            id: Some(row.get(0)?),
            description: row.get(1)?,
            kind,
            device_name: row.get(3)?,
            status,
            detail: row.get(5)?,
            created_at: row.get(6)?,
            applied_at: row.get(7)?,
            failed_at: row.get(8)?,
        })
    }
}
