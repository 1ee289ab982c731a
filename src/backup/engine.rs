// src/backup/engine.rs

//! Backup, restore and verification of device file trees
//!
//! Every file is its own commit: it counts as backed up only once its stored
//! copy has been re-hashed and matches, and as restored only once the copy
//! written on the device has been re-hashed there and matches. A run that
//! stops halfway leaves every completed file valid.

use crate::backup::identity::DeviceIdentity;
use crate::backup::snapshot::{FileRecord, Snapshot, SnapshotStore};
use crate::device::path::{is_within, join, parent};
use crate::device::{CancelToken, Connection, temp_sibling};
use crate::error::{Error, FailedUnit, Result};
use crate::hash::{hash_file, hash_files, sha256_hex};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
    pub snapshot_id: String,
    /// Whether an interrupted snapshot was continued
    pub resumed: bool,
    pub files_total: usize,
    /// Files read from the device in this run
    pub transferred: usize,
    /// Files linked from the previous committed snapshot
    pub reused: usize,
    /// Files already stored by an earlier attempt of this snapshot
    pub already_stored: usize,
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub snapshot_id: String,
    pub restored: usize,
    /// Files whose device copy already matched
    pub unchanged: usize,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions<'a> {
    /// Restrict the restore to this subtree, matched on whole path components
    pub subtree: Option<&'a str>,
    /// Write a snapshot taken on a different hardware model
    pub allow_other_model: bool,
}

impl<'a> RestoreOptions<'a> {
    pub fn subtree(subtree: &'a str) -> Self {
        Self {
            subtree: Some(subtree),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub snapshot_id: String,
    pub verified: usize,
    pub mismatched: Vec<FailedUnit>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.mismatched.is_empty()
    }
}

enum BackupOutcome {
    AlreadyStored,
    Reused,
    Transferred(u64),
}

enum RestoreOutcome {
    Unchanged,
    Restored(u64),
}

/// Copy every file below `managed_root` on the device into the store
///
/// Continues the device's latest snapshot if it was never committed;
/// otherwise starts a new one, reusing unchanged files from the latest
/// committed snapshot.
pub fn backup(
    conn: &mut dyn Connection,
    store: &SnapshotStore,
    device_id: &str,
    managed_root: &str,
    cancel: &CancelToken,
) -> Result<BackupReport> {
    let listing = conn.list_tree(managed_root)?;
    info!("Backing up {} file(s) from {}:{}", listing.len(), device_id, managed_root);

    let (mut snapshot, resumed) = match store.latest(device_id)? {
        Some(latest) if !latest.committed && latest.managed_root == managed_root => {
            info!("Resuming interrupted snapshot {} ({} file(s) stored)", latest.id, latest.len());
            (latest, true)
        }
        _ => (store.create(device_id, managed_root)?, false),
    };
    if !snapshot.device_info.is_known() {
        snapshot.device_info = DeviceIdentity::read_from(conn)?;
        store.save(&snapshot)?;
    }
    let base = store
        .latest_committed(device_id)?
        .filter(|s| s.managed_root == managed_root);
    if let Some(base) = &base {
        debug!("Reusing unchanged files from {}", base.id);
    }

    let wanted: BTreeSet<&str> = listing.iter().map(String::as_str).collect();
    for gone in snapshot.retain_paths(&wanted) {
        let _ = fs::remove_file(store.stored_path(&snapshot.id, &gone));
    }

    let mut report = BackupReport {
        snapshot_id: snapshot.id.clone(),
        resumed,
        files_total: listing.len(),
        ..Default::default()
    };
    let mut failed = Vec::new();

    for relative in &listing {
        if cancel.is_cancelled() {
            store.save(&snapshot)?;
            return Err(Error::Cancelled);
        }
        match backup_file(conn, store, &mut snapshot, base.as_ref(), managed_root, relative) {
            Ok(BackupOutcome::AlreadyStored) => report.already_stored += 1,
            Ok(BackupOutcome::Reused) => {
                report.reused += 1;
                store.save(&snapshot)?;
            }
            Ok(BackupOutcome::Transferred(bytes)) => {
                report.transferred += 1;
                report.bytes_transferred += bytes;
                store.save(&snapshot)?;
            }
            Err(e) => {
                warn!("Failed to back up {}: {}", relative, e);
                failed.push(FailedUnit::new(relative, e));
            }
        }
    }

    if !failed.is_empty() {
        store.save(&snapshot)?;
        return Err(Error::PartialFailure(failed));
    }

    snapshot.committed = true;
    store.save(&snapshot)?;
    info!(
        "Committed snapshot {}: {} transferred, {} reused, {} bytes",
        snapshot.id, report.transferred, report.reused, report.bytes_transferred
    );
    Ok(report)
}

fn backup_file(
    conn: &mut dyn Connection,
    store: &SnapshotStore,
    snapshot: &mut Snapshot,
    base: Option<&Snapshot>,
    managed_root: &str,
    relative: &str,
) -> Result<BackupOutcome> {
    let remote = join(managed_root, relative);
    let stat = conn
        .stat(&remote)?
        .ok_or_else(|| Error::NotFound(format!("{} disappeared during backup", remote)))?;
    let dest = store.stored_path(&snapshot.id, relative);

    if let Some(sum) = &stat.checksum {
        if let Some(record) = snapshot.get(relative)
            && record.checksum == *sum
            && stored_size(&dest) == Some(record.size)
        {
            return Ok(BackupOutcome::AlreadyStored);
        }

        if let Some(base) = base
            && let Some(record) = base.get(relative)
            && record.checksum == *sum
        {
            let source = store.stored_path(&base.id, relative);
            match link_verified(&source, &dest, sum) {
                Ok(()) => {
                    snapshot.record(relative, record.clone());
                    return Ok(BackupOutcome::Reused);
                }
                Err(e) => warn!("Stored copy of {} in {} unusable: {}", relative, base.id, e),
            }
        }
    }

    let data = conn.read_file(&remote)?;
    let checksum = sha256_hex(&data);
    if let Some(remote_sum) = &stat.checksum
        && *remote_sum != checksum
    {
        return Err(Error::Verification(format!(
            "{} changed while it was being read",
            remote
        )));
    }

    store_verified(&dest, &data, &checksum)?;
    snapshot.record(
        relative,
        FileRecord {
            size: data.len() as u64,
            checksum,
        },
    );
    debug!("Stored {} ({} bytes)", relative, data.len());
    Ok(BackupOutcome::Transferred(data.len() as u64))
}

fn stored_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}

fn host_temp(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tabsync-tmp");
    PathBuf::from(name)
}

/// Write `data` beside `dest`, rename it into place and re-hash it
fn store_verified(dest: &Path, data: &[u8], checksum: &str) -> Result<()> {
    if let Some(dir) = dest.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = host_temp(dest);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, dest)?;
    check_stored(dest, checksum)
}

/// Hard-link (or copy) a stored file from another snapshot and re-hash it
fn link_verified(source: &Path, dest: &Path, checksum: &str) -> Result<()> {
    if let Some(dir) = dest.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = host_temp(dest);
    let _ = fs::remove_file(&tmp);
    if fs::hard_link(source, &tmp).is_err() {
        fs::copy(source, &tmp)?;
    }
    fs::rename(&tmp, dest)?;
    check_stored(dest, checksum)
}

fn check_stored(path: &Path, checksum: &str) -> Result<()> {
    let actual = hash_file(path)?;
    if actual != checksum {
        let _ = fs::remove_file(path);
        return Err(Error::Verification(format!(
            "stored copy {} hashes to {} instead of {}",
            path.display(),
            actual,
            checksum
        )));
    }
    Ok(())
}

/// Write a snapshot back onto the device
///
/// With a subtree selected, everything outside it is left untouched. A
/// snapshot recorded on another hardware model is refused unless
/// `allow_other_model` is set.
pub fn restore(
    conn: &mut dyn Connection,
    store: &SnapshotStore,
    snapshot: &Snapshot,
    target_root: &str,
    options: RestoreOptions<'_>,
    cancel: &CancelToken,
) -> Result<RestoreReport> {
    if !snapshot.committed {
        return Err(Error::Verification(format!(
            "snapshot {} was never committed",
            snapshot.id
        )));
    }
    check_identity(conn, snapshot, options.allow_other_model)?;
    let selector = options.subtree;

    let selected: Vec<(&str, &FileRecord)> = snapshot
        .entries()
        .filter(|(path, _)| selector.is_none_or(|s| is_within(path, s)))
        .collect();
    if let Some(subtree) = selector
        && selected.is_empty()
    {
        return Err(Error::NotFound(format!(
            "nothing under {} in snapshot {}",
            subtree, snapshot.id
        )));
    }

    // Stored copies are checked before anything is written to the device
    let stored: Vec<PathBuf> = selected
        .iter()
        .map(|(path, _)| store.stored_path(&snapshot.id, path))
        .collect();
    let sums = hash_files(&stored);

    let mut failed = Vec::new();
    let mut verified = Vec::new();
    for (((path, record), local), sum) in selected.iter().zip(&stored).zip(sums) {
        match sum {
            Ok(sum) if sum == record.checksum => verified.push((*path, *record, local)),
            Ok(sum) => failed.push(FailedUnit::new(
                *path,
                format!("stored copy hashes to {} instead of {}", sum, record.checksum),
            )),
            Err(e) => failed.push(FailedUnit::new(*path, e)),
        }
    }

    let mut report = RestoreReport {
        snapshot_id: snapshot.id.clone(),
        ..Default::default()
    };
    let mut pending = verified.into_iter();
    while let Some((path, record, local)) = pending.next() {
        if cancel.is_cancelled() {
            if failed.is_empty() {
                return Err(Error::Cancelled);
            }
            // Files never attempted are listed after the ones that failed
            warn!("Restore of {} cancelled after {} failure(s)", snapshot.id, failed.len());
            failed.extend(
                std::iter::once(path)
                    .chain(pending.map(|(path, _, _)| path))
                    .map(|path| FailedUnit::new(path, Error::Cancelled)),
            );
            return Err(Error::PartialFailure(failed));
        }
        match restore_file(conn, target_root, path, record, local) {
            Ok(RestoreOutcome::Unchanged) => report.unchanged += 1,
            Ok(RestoreOutcome::Restored(bytes)) => {
                debug!("Restored {} ({} bytes)", path, bytes);
                report.restored += 1;
                report.bytes_written += bytes;
            }
            Err(e) => {
                warn!("Failed to restore {}: {}", path, e);
                failed.push(FailedUnit::new(path, e));
            }
        }
    }

    if !failed.is_empty() {
        return Err(Error::PartialFailure(failed));
    }
    info!(
        "Restored snapshot {}: {} written, {} unchanged",
        snapshot.id, report.restored, report.unchanged
    );
    Ok(report)
}

fn check_identity(conn: &mut dyn Connection, snapshot: &Snapshot, allow_other_model: bool) -> Result<()> {
    if !snapshot.device_info.is_known() {
        return Ok(());
    }
    let current = DeviceIdentity::read_from(conn)?;
    for diff in snapshot.device_info.differences(&current) {
        if diff.field == "model" && !allow_other_model {
            return Err(Error::Verification(format!(
                "snapshot {} was taken on a {} but the device is a {}",
                snapshot.id, diff.recorded, diff.current
            )));
        }
        warn!(
            "Snapshot {} was taken with {} {}, the device reports {}",
            snapshot.id, diff.field, diff.recorded, diff.current
        );
    }
    Ok(())
}

fn restore_file(
    conn: &mut dyn Connection,
    target_root: &str,
    relative: &str,
    record: &FileRecord,
    local: &Path,
) -> Result<RestoreOutcome> {
    let dest = join(target_root, relative);

    if let Some(stat) = conn.stat(&dest)?
        && stat.size == record.size
    {
        let current = match stat.checksum {
            Some(sum) => sum,
            None => conn.checksum(&dest)?,
        };
        if current == record.checksum {
            return Ok(RestoreOutcome::Unchanged);
        }
    }

    let data = fs::read(local)?;
    if let Some(dir) = parent(&dest) {
        conn.create_dir_all(dir)?;
    }
    let tmp = temp_sibling(&dest);
    conn.write_file(&tmp, &data)?;
    let written = match conn.checksum(&tmp) {
        Ok(sum) => sum,
        Err(e) => {
            let _ = conn.remove_file(&tmp);
            return Err(e);
        }
    };
    if written != record.checksum {
        let _ = conn.remove_file(&tmp);
        return Err(Error::Verification(format!(
            "{} hashes to {} on the device instead of {}",
            dest, written, record.checksum
        )));
    }
    conn.rename(&tmp, &dest)?;
    Ok(RestoreOutcome::Restored(data.len() as u64))
}

/// Re-hash every stored file of a snapshot
pub fn verify(store: &SnapshotStore, snapshot: &Snapshot) -> VerifyReport {
    let entries: Vec<(&str, &FileRecord)> = snapshot.entries().collect();
    let paths: Vec<PathBuf> = entries
        .iter()
        .map(|(path, _)| store.stored_path(&snapshot.id, path))
        .collect();

    let mut report = VerifyReport {
        snapshot_id: snapshot.id.clone(),
        ..Default::default()
    };
    for ((path, record), sum) in entries.iter().zip(hash_files(&paths)) {
        match sum {
            Ok(sum) if sum == record.checksum => report.verified += 1,
            Ok(sum) => report.mismatched.push(FailedUnit::new(
                *path,
                format!("hashes to {} instead of {}", sum, record.checksum),
            )),
            Err(e) => report.mismatched.push(FailedUnit::new(*path, e)),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::identity::{IDENTITY_FILES, MODEL_FILE, SERIAL_FILE};
    use crate::device::LocalConnection;
    use crate::device::testing::FaultyConnection;
    use tempfile::TempDir;

    const ROOT: &str = "/data";

    struct Fixture {
        device: TempDir,
        _host: TempDir,
        store: SnapshotStore,
    }

    impl Fixture {
        fn new() -> Self {
            let device = TempDir::new().unwrap();
            let host = TempDir::new().unwrap();
            let store = SnapshotStore::new(host.path().join("backups"));
            let fixture = Self { device, _host: host, store };
            fixture.put("notebooks/n1.rm", b"\x00stroke\n\r");
            fixture.put("notebooks/n1.metadata", b"{\"visibleName\": \"n1\"}");
            fixture.put("templates/grid.png", b"\x89PNG\r\n");
            fixture.put("templates/templates.json", b"{}");
            fixture
        }

        fn conn(&self) -> LocalConnection {
            LocalConnection::new(self.device.path()).unwrap()
        }

        fn host(&self, relative: &str) -> PathBuf {
            self.device.path().join("data").join(relative)
        }

        fn put(&self, relative: &str, data: &[u8]) {
            let path = self.host(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }

        fn get(&self, relative: &str) -> Vec<u8> {
            fs::read(self.host(relative)).unwrap()
        }

        /// Write one of the device's identity files
        fn identify(&self, device_path: &str, value: &str) {
            let path = self.device.path().join(device_path.trim_start_matches('/'));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, format!("{}\n", value)).unwrap();
        }
    }

    #[test]
    fn test_backup_then_restore_reproduces_checksums() {
        let fx = Fixture::new();
        let report = backup(&mut fx.conn(), &fx.store, "tablet", ROOT, &CancelToken::new()).unwrap();
        assert_eq!(report.transferred, 4);

        let snapshot = fx.store.load(&report.snapshot_id).unwrap();
        assert!(snapshot.committed);
        assert!(verify(&fx.store, &snapshot).is_ok());

        let original = fx.get("notebooks/n1.rm");
        fx.put("notebooks/n1.rm", b"scribbled over");
        fs::remove_file(fx.host("templates/grid.png")).unwrap();

        let restored = restore(&mut fx.conn(), &fx.store, &snapshot, ROOT, RestoreOptions::default(), &CancelToken::new()).unwrap();
        assert_eq!(restored.restored, 2);
        assert_eq!(restored.unchanged, 2);
        assert_eq!(fx.get("notebooks/n1.rm"), original);
        assert_eq!(fx.get("templates/grid.png"), b"\x89PNG\r\n");

        for (path, record) in snapshot.entries() {
            assert_eq!(sha256_hex(&fx.get(path)), record.checksum);
        }
        assert!(!fx.host("notebooks/n1.rm.tabsync-tmp").exists());
    }

    #[test]
    fn test_subtree_restore_leaves_other_files_alone() {
        let fx = Fixture::new();
        let report = backup(&mut fx.conn(), &fx.store, "tablet", ROOT, &CancelToken::new()).unwrap();
        let snapshot = fx.store.load(&report.snapshot_id).unwrap();

        fx.put("templates/templates.json", b"{\"changed\": true}");
        fx.put("notebooks/n1.rm", b"edited");

        let restored =
            restore(&mut fx.conn(), &fx.store, &snapshot, ROOT, RestoreOptions::subtree("templates"), &CancelToken::new()).unwrap();
        assert_eq!(restored.restored, 1);
        assert_eq!(fx.get("templates/templates.json"), b"{}");
        assert_eq!(fx.get("notebooks/n1.rm"), b"edited");
    }

    #[test]
    fn test_selector_matching_nothing_is_not_found() {
        let fx = Fixture::new();
        let report = backup(&mut fx.conn(), &fx.store, "tablet", ROOT, &CancelToken::new()).unwrap();
        let snapshot = fx.store.load(&report.snapshot_id).unwrap();

        let err = restore(&mut fx.conn(), &fx.store, &snapshot, ROOT, RestoreOptions::subtree("templ"), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_uncommitted_snapshot_cannot_be_restored() {
        let fx = Fixture::new();
        let snapshot = fx.store.create("tablet", ROOT).unwrap();
        let err = restore(&mut fx.conn(), &fx.store, &snapshot, ROOT, RestoreOptions::default(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::Verification(_)));
    }

    #[test]
    fn test_interrupted_backup_resumes_and_reuses() {
        let fx = Fixture::new();

        let mut flaky = FaultyConnection::new(fx.conn()).fail_read("/data/templates/grid.png");
        let err = backup(&mut flaky, &fx.store, "tablet", ROOT, &CancelToken::new()).unwrap_err();
        assert!(matches!(&err, Error::PartialFailure(units) if units[0].path == "templates/grid.png"));

        let partial = fx.store.latest("tablet").unwrap().unwrap();
        assert!(!partial.committed);
        assert_eq!(partial.len(), 3);

        // The rerun picks up the same snapshot and only reads the missing file
        // (plus the identity files, which this device directory lacks)
        let mut counting = FaultyConnection::new(fx.conn());
        let report = backup(&mut counting, &fx.store, "tablet", ROOT, &CancelToken::new()).unwrap();
        assert!(report.resumed);
        assert_eq!(report.snapshot_id, partial.id);
        assert_eq!(report.transferred, 1);
        assert_eq!(report.already_stored, 3);
        assert_eq!(counting.read_count(), 1 + IDENTITY_FILES.len());

        // A fresh snapshot after one edit transfers only the edited file
        fx.put("notebooks/n1.rm", b"another stroke");
        let mut counting = FaultyConnection::new(fx.conn());
        let report = backup(&mut counting, &fx.store, "tablet", ROOT, &CancelToken::new()).unwrap();
        assert!(!report.resumed);
        assert_ne!(report.snapshot_id, partial.id);
        assert_eq!(report.transferred, 1);
        assert_eq!(report.reused, 3);
        assert_eq!(counting.read_count(), 1 + IDENTITY_FILES.len());

        let latest = fx.store.load(&report.snapshot_id).unwrap();
        assert!(verify(&fx.store, &latest).is_ok());
    }

    #[test]
    fn test_cancelled_backup_stays_uncommitted() {
        let fx = Fixture::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = backup(&mut fx.conn(), &fx.store, "tablet", ROOT, &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!fx.store.latest("tablet").unwrap().unwrap().committed);
    }

    #[test]
    fn test_corrupted_store_blocks_that_file_only() {
        let fx = Fixture::new();
        let report = backup(&mut fx.conn(), &fx.store, "tablet", ROOT, &CancelToken::new()).unwrap();
        let snapshot = fx.store.load(&report.snapshot_id).unwrap();

        fs::write(fx.store.stored_path(&snapshot.id, "templates/grid.png"), b"rot").unwrap();
        fx.put("templates/grid.png", b"device copy");
        fx.put("templates/templates.json", b"device copy");

        let verify_report = verify(&fx.store, &snapshot);
        assert_eq!(verify_report.mismatched.len(), 1);

        let err = restore(&mut fx.conn(), &fx.store, &snapshot, ROOT, RestoreOptions::default(), &CancelToken::new()).unwrap_err();
        match err {
            Error::PartialFailure(units) => {
                assert_eq!(units.len(), 1);
                assert_eq!(units[0].path, "templates/grid.png");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.get("templates/grid.png"), b"device copy");
        assert_eq!(fx.get("templates/templates.json"), b"{}");
    }

    #[test]
    fn test_failed_device_write_is_reported() {
        let fx = Fixture::new();
        let report = backup(&mut fx.conn(), &fx.store, "tablet", ROOT, &CancelToken::new()).unwrap();
        let snapshot = fx.store.load(&report.snapshot_id).unwrap();
        fx.put("notebooks/n1.metadata", b"changed");
        fx.put("notebooks/n1.rm", b"changed");

        let mut flaky = FaultyConnection::new(fx.conn()).fail_write("/data/notebooks/n1.rm");
        let err = restore(&mut flaky, &fx.store, &snapshot, ROOT, RestoreOptions::default(), &CancelToken::new()).unwrap_err();
        assert!(matches!(&err, Error::PartialFailure(units) if units.len() == 1));
        assert_eq!(fx.get("notebooks/n1.rm"), b"changed");
        assert_eq!(fx.get("notebooks/n1.metadata"), b"{\"visibleName\": \"n1\"}");
    }

    #[test]
    fn test_backup_records_device_identity() {
        let fx = Fixture::new();
        fx.identify(MODEL_FILE, "reMarkable 2.0");
        fx.identify(SERIAL_FILE, "RM110-000-00001");

        let report = backup(&mut fx.conn(), &fx.store, "tablet", ROOT, &CancelToken::new()).unwrap();
        let snapshot = fx.store.load(&report.snapshot_id).unwrap();
        assert_eq!(snapshot.device_info.model.as_deref(), Some("reMarkable 2.0"));
        assert_eq!(snapshot.device_info.serial.as_deref(), Some("RM110-000-00001"));
        assert_eq!(snapshot.device_info.osver, None);
    }

    #[test]
    fn test_restore_onto_other_model_is_refused() {
        let fx = Fixture::new();
        fx.identify(MODEL_FILE, "reMarkable 1.0");
        let report = backup(&mut fx.conn(), &fx.store, "tablet", ROOT, &CancelToken::new()).unwrap();
        let snapshot = fx.store.load(&report.snapshot_id).unwrap();

        fx.identify(MODEL_FILE, "reMarkable 2.0");
        fx.put("notebooks/n1.rm", b"edited");
        let err = restore(&mut fx.conn(), &fx.store, &snapshot, ROOT, RestoreOptions::default(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(&err, Error::Verification(msg) if msg.contains("reMarkable 1.0")));
        assert_eq!(fx.get("notebooks/n1.rm"), b"edited");

        let options = RestoreOptions {
            allow_other_model: true,
            ..RestoreOptions::default()
        };
        let restored = restore(&mut fx.conn(), &fx.store, &snapshot, ROOT, options, &CancelToken::new()).unwrap();
        assert_eq!(restored.restored, 1);
    }

    #[test]
    fn test_restore_onto_other_unit_of_same_model_proceeds() {
        let fx = Fixture::new();
        fx.identify(MODEL_FILE, "reMarkable 2.0");
        fx.identify(SERIAL_FILE, "RM110-000-00001");
        let report = backup(&mut fx.conn(), &fx.store, "tablet", ROOT, &CancelToken::new()).unwrap();
        let snapshot = fx.store.load(&report.snapshot_id).unwrap();

        fx.identify(SERIAL_FILE, "RM110-000-00002");
        fx.put("notebooks/n1.rm", b"edited");
        let restored =
            restore(&mut fx.conn(), &fx.store, &snapshot, ROOT, RestoreOptions::default(), &CancelToken::new()).unwrap();
        assert_eq!(restored.restored, 1);
    }

    #[test]
    fn test_cancelled_restore_keeps_earlier_failures() {
        let fx = Fixture::new();
        let report = backup(&mut fx.conn(), &fx.store, "tablet", ROOT, &CancelToken::new()).unwrap();
        let snapshot = fx.store.load(&report.snapshot_id).unwrap();
        fs::write(fx.store.stored_path(&snapshot.id, "templates/grid.png"), b"rot").unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = restore(&mut fx.conn(), &fx.store, &snapshot, ROOT, RestoreOptions::default(), &cancel).unwrap_err();
        let Error::PartialFailure(units) = err else {
            panic!("expected the damaged file to be reported");
        };
        assert_eq!(units.len(), 4);
        assert_eq!(units[0].path, "templates/grid.png");
        assert!(units[0].cause.contains("stored copy"));
        assert!(units[1..].iter().all(|u| u.cause == "Operation cancelled"));
    }

    #[test]
    fn test_cancelled_restore_without_failures_is_cancelled() {
        let fx = Fixture::new();
        let report = backup(&mut fx.conn(), &fx.store, "tablet", ROOT, &CancelToken::new()).unwrap();
        let snapshot = fx.store.load(&report.snapshot_id).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = restore(&mut fx.conn(), &fx.store, &snapshot, ROOT, RestoreOptions::default(), &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
