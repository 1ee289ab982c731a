// src/lib.rs

//! tabsync
//!
//! Installs third-party packages onto an e-paper tablet and captures/restores
//! verified backups of its file tree, over SSH or a local directory shim.
//!
//! # Architecture
//!
//! - Self-describing archives: INFO / MANIFEST / PAYLOAD sections after an
//!   opaque shell preamble
//! - Registry on the device: written new-then-renamed, never edited in place
//! - Manifest conflicts: no two packages own the same absolute path
//! - Per-file commit: every transferred file is checksummed before it counts
//! - Host journal: every session is recorded as a changeset in SQLite

pub mod backup;
pub mod config;
pub mod db;
pub mod device;
mod error;
pub mod hash;
pub mod packages;
pub mod resolver;

pub use config::Config;
pub use error::{Error, FailedUnit, PackageConflict, Result};
