// src/device/testing.rs

//! Connection wrapper for exercising failure paths in unit tests

use super::{CommandOutput, Connection, FileStat, LocalConnection};
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A [`LocalConnection`] that counts transfers and fails chosen paths
pub struct FaultyConnection {
    inner: LocalConnection,
    /// Writes to these device paths (or their temporary siblings) fail
    pub fail_writes: BTreeSet<String>,
    /// Reads of these device paths fail
    pub fail_reads: BTreeSet<String>,
    /// Every call to `read_file`, shared with the test
    pub reads: Arc<AtomicUsize>,
}

impl FaultyConnection {
    pub fn new(inner: LocalConnection) -> Self {
        Self {
            inner,
            fail_writes: BTreeSet::new(),
            fail_reads: BTreeSet::new(),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fail_write(mut self, path: &str) -> Self {
        self.fail_writes.insert(path.to_string());
        self
    }

    pub fn fail_read(mut self, path: &str) -> Self {
        self.fail_reads.insert(path.to_string());
        self
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn write_fails(&self, path: &str) -> bool {
        self.fail_writes
            .iter()
            .any(|p| path == p || path == super::temp_sibling(p))
    }
}

impl Connection for FaultyConnection {
    fn describe(&self) -> String {
        format!("faulty {}", self.inner.describe())
    }

    fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        self.inner.exec(command)
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.contains(path) {
            return Err(Error::Connection(format!("injected read failure: {}", path)));
        }
        self.inner.read_file(path)
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        if self.write_fails(path) {
            return Err(Error::Connection(format!("injected write failure: {}", path)));
        }
        self.inner.write_file(path, data)
    }

    fn list_tree(&mut self, root: &str) -> Result<Vec<String>> {
        self.inner.list_tree(root)
    }

    fn stat(&mut self, path: &str) -> Result<Option<FileStat>> {
        self.inner.stat(path)
    }

    fn create_dir_all(&mut self, path: &str) -> Result<()> {
        self.inner.create_dir_all(path)
    }

    fn remove_file(&mut self, path: &str) -> Result<()> {
        self.inner.remove_file(path)
    }

    fn remove_dir(&mut self, path: &str) -> Result<()> {
        self.inner.remove_dir(path)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.inner.rename(from, to)
    }

    fn dir_exists(&mut self, path: &str) -> Result<bool> {
        self.inner.dir_exists(path)
    }

    fn set_permissions(&mut self, path: &str, mode: u32) -> Result<()> {
        self.inner.set_permissions(path, mode)
    }
}
