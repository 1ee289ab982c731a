// src/backup/mod.rs

//! Device backups
//!
//! A snapshot mirrors one device directory (the managed root, usually the
//! notebook store) into the host-side [`SnapshotStore`]. Snapshots are
//! built one verified file at a time and are immutable once committed.

pub mod engine;
pub mod identity;
pub mod snapshot;

pub use engine::{BackupReport, RestoreOptions, RestoreReport, VerifyReport, backup, restore, verify};
pub use identity::DeviceIdentity;
pub use snapshot::{FileRecord, Snapshot, SnapshotStore};
