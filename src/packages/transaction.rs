// src/packages/transaction.rs

//! Install and uninstall against a device registry
//!
//! There is no transaction support on the device, so consistency comes from
//! ordering: every file is written (temporary sibling, then rename) before
//! the registry is replaced, and the registry is replaced in one rename.
//! A failed install therefore leaves the registry as it was and can simply
//! be re-run.

use crate::config::Config;
use crate::device::path::{depth, intermediate_dirs, parent, strip_root};
use crate::device::{CancelToken, Connection, temp_sibling};
use crate::error::{Error, FailedUnit, PackageConflict, Result};
use crate::packages::archive::PayloadEntry;
use crate::packages::registry::{Registry, RegistryEntry};
use crate::packages::{Manifest, Package};
use crate::resolver;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

/// Lifecycle of a package within one install or uninstall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Decoded,
    Verified,
    Installed,
    Rejected,
    Uninstalled,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Decoded => "decoded",
            TransactionState::Verified => "verified",
            TransactionState::Installed => "installed",
            TransactionState::Rejected => "rejected",
            TransactionState::Uninstalled => "uninstalled",
        };
        f.write_str(name)
    }
}

/// Tracks one package through its state transitions
#[derive(Debug)]
pub struct PackageTransaction<'a> {
    package: &'a Package,
    state: TransactionState,
}

impl<'a> PackageTransaction<'a> {
    pub fn new(package: &'a Package) -> Self {
        Self {
            package,
            state: TransactionState::Decoded,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn transition(&mut self, next: TransactionState) {
        info!(
            "{} {}: {} -> {}",
            self.package.id, self.package.version, self.state, next
        );
        self.state = next;
    }

    /// Check the manifest against the payload; only a verified package may
    /// touch the device
    pub fn verify(&mut self) -> Result<Vec<PayloadEntry>> {
        match self.package.verify() {
            Ok(entries) => {
                self.transition(TransactionState::Verified);
                Ok(entries)
            }
            Err(e) => {
                self.reject();
                Err(e)
            }
        }
    }

    pub fn reject(&mut self) {
        self.transition(TransactionState::Rejected);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    /// Take over paths owned by other packages, dropping their registry
    /// entries
    pub allow_overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub package_id: String,
    pub version: String,
    pub previous_version: Option<String>,
    pub files_written: usize,
    /// Directories created by this install, relative to the prefix
    pub created_dirs: Vec<String>,
    /// Packages whose registry entries were dropped by an overwrite
    pub overwritten: Vec<String>,
    /// Files of the previous version that the new version no longer ships
    pub removed_stale: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallReport {
    pub package_id: String,
    pub files_removed: usize,
    /// Manifest entries that were already gone
    pub missing: Vec<String>,
    pub dirs_removed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub files_removed: usize,
    pub missing: Vec<String>,
    /// Entries left alone because another package owns them
    pub skipped: Vec<String>,
}

/// Compare versions as semver when both parse, else as strings
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Install a package onto the device
pub fn install(
    conn: &mut dyn Connection,
    config: &Config,
    package: &Package,
    options: InstallOptions,
    cancel: &CancelToken,
) -> Result<InstallReport> {
    let mut tx = PackageTransaction::new(package);
    let entries = tx.verify()?;

    let mut registry = Registry::load(conn, config)?;
    let result = resolver::conflicts_for(&package.id, package.manifest(), &registry, &config.prefix);

    let mut overwritten = Vec::new();
    if !result.is_installable() {
        if !options.allow_overwrite {
            tx.reject();
            return Err(result.into_error(&package.id));
        }
        for conflict in &result.conflicts {
            warn!(
                "Overwriting {} path(s) owned by {}; its registry entry is dropped",
                conflict.paths.len(),
                conflict.package_id
            );
            registry.remove(&conflict.package_id);
            overwritten.push(conflict.package_id.clone());
        }
        registry.save(conn, config)?;
    }

    let previous = registry.get(&package.id).cloned();
    if let Some(prev) = &previous {
        match compare_versions(&package.version, &prev.version) {
            Ordering::Less => warn!(
                "Downgrading {} from {} to {}",
                package.id, prev.version, package.version
            ),
            Ordering::Equal => info!("Reinstalling {} {}", package.id, package.version),
            Ordering::Greater => info!(
                "Upgrading {} from {} to {}",
                package.id, prev.version, package.version
            ),
        }
    }

    let created_now = missing_dirs(conn, config, &entries)?;
    conn.create_dir_all(&config.prefix)?;

    let mut failed = Vec::new();
    let mut files_written = 0;
    for entry in &entries {
        cancel.check()?;
        let target = config.target_path(&entry.path);
        match write_entry(conn, &target, entry) {
            Ok(()) => {
                debug!("Wrote {} ({} bytes)", target, entry.data.len());
                files_written += 1;
            }
            Err(e) => {
                warn!("Failed to write {}: {}", target, e);
                failed.push(FailedUnit::new(&entry.path, e));
            }
        }
    }
    if !failed.is_empty() {
        tx.reject();
        return Err(Error::PartialFailure(failed));
    }

    let mut created_dirs = previous
        .as_ref()
        .map(|p| p.created_dirs.clone())
        .unwrap_or_default();
    for dir in &created_now {
        if !created_dirs.contains(dir) {
            created_dirs.push(dir.clone());
        }
    }

    registry.insert(
        package.id.clone(),
        RegistryEntry::new(&package.version, package.manifest().clone(), created_dirs),
    );
    registry.save(conn, config)?;
    tx.transition(TransactionState::Installed);

    let removed_stale = match &previous {
        Some(prev) => remove_stale(conn, config, &registry, &package.id, &prev.manifest),
        None => Vec::new(),
    };

    Ok(InstallReport {
        package_id: package.id.clone(),
        version: package.version.clone(),
        previous_version: previous.map(|p| p.version),
        files_written,
        created_dirs: created_now,
        overwritten,
        removed_stale,
    })
}

/// Directories below the prefix that the payload needs and that do not
/// exist yet, shallowest first
fn missing_dirs(conn: &mut dyn Connection, config: &Config, entries: &[PayloadEntry]) -> Result<Vec<String>> {
    let mut checked = BTreeSet::new();
    let mut missing = Vec::new();
    for entry in entries {
        for dir in intermediate_dirs(&config.prefix, &entry.path) {
            if !checked.insert(dir.clone()) {
                continue;
            }
            if !conn.dir_exists(&dir)? {
                if let Some(relative) = strip_root(&config.prefix, &dir) {
                    missing.push(relative.to_string());
                }
            }
        }
    }
    Ok(missing)
}

fn write_entry(conn: &mut dyn Connection, target: &str, entry: &PayloadEntry) -> Result<()> {
    if let Some(dir) = parent(target) {
        conn.create_dir_all(dir)?;
    }
    conn.write_file_atomic(target, &entry.data)?;
    conn.set_permissions(target, entry.mode)
}

/// Remove files of the previous version that are no longer shipped
fn remove_stale(
    conn: &mut dyn Connection,
    config: &Config,
    registry: &Registry,
    package_id: &str,
    previous: &Manifest,
) -> Vec<String> {
    let Some(current) = registry.get(package_id) else {
        return Vec::new();
    };
    let others = registry.paths_owned_by_others(package_id);
    let mut removed = Vec::new();
    for path in previous.removal_order() {
        if current.manifest.contains(path) || others.contains(path) {
            continue;
        }
        match conn.remove_file(&config.target_path(path)) {
            Ok(()) | Err(Error::NotFound(_)) => removed.push(path.to_string()),
            Err(e) => warn!("Could not remove stale file {}: {}", path, e),
        }
    }
    removed
}

/// Remove an installed package from the device
pub fn uninstall(
    conn: &mut dyn Connection,
    config: &Config,
    package_id: &str,
    cancel: &CancelToken,
) -> Result<UninstallReport> {
    let mut registry = Registry::load(conn, config)?;
    let Some(mut entry) = registry.get(package_id).cloned() else {
        return Err(Error::NotFound(format!("package {} is not installed", package_id)));
    };

    let mut report = UninstallReport {
        package_id: package_id.to_string(),
        ..Default::default()
    };
    let mut failed = Vec::new();
    let mut remaining: BTreeSet<String> = entry.manifest.iter().map(str::to_string).collect();

    for path in entry.manifest.removal_order() {
        if cancel.is_cancelled() {
            break;
        }
        let target = config.target_path(path);
        match conn.remove_file(&target) {
            Ok(()) => {
                debug!("Removed {}", target);
                report.files_removed += 1;
                remaining.remove(path);
            }
            Err(Error::NotFound(_)) => {
                warn!("{} was already missing", target);
                report.missing.push(path.to_string());
                remaining.remove(path);
            }
            Err(e) => {
                warn!("Failed to remove {}: {}", target, e);
                failed.push(FailedUnit::new(path, e));
            }
        }
    }

    let shared_dirs = registry.dirs_recorded_by_others(package_id);
    let mut dirs: Vec<String> = entry.created_dirs.clone();
    dirs.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| b.cmp(a)));
    for dir in &dirs {
        if shared_dirs.contains(dir.as_str()) {
            continue;
        }
        match conn.remove_dir(&config.target_path(dir)) {
            Ok(()) => report.dirs_removed.push(dir.clone()),
            Err(e) => debug!("Keeping directory {}: {}", dir, e),
        }
    }

    if remaining.is_empty() {
        registry.remove(package_id);
        registry.save(conn, config)?;
        info!("{}: {} -> {}", package_id, TransactionState::Installed, TransactionState::Uninstalled);
        return Ok(report);
    }

    // Keep only what is still on the device so a retry targets exactly that
    entry.manifest.retain(|p| remaining.contains(p));
    entry.created_dirs.retain(|d| !report.dirs_removed.contains(d));
    registry.insert(package_id, entry);
    registry.save(conn, config)?;

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Err(Error::PartialFailure(failed))
}

/// Remove leftovers of an install that never reached the registry
///
/// The archive's own manifest names the files. Paths owned by a registry
/// entry are left alone, and an installed package must be uninstalled
/// instead.
pub fn cleanup(conn: &mut dyn Connection, config: &Config, package: &Package) -> Result<CleanupReport> {
    let registry = Registry::load(conn, config)?;
    if let Some(entry) = registry.get(&package.id) {
        return Err(Error::Conflict {
            package: package.id.clone(),
            conflicts: vec![PackageConflict {
                package_id: package.id.clone(),
                paths: entry.manifest.absolute_paths(&config.prefix),
            }],
        });
    }

    let owned = registry.paths_owned_by_others(&package.id);
    let mut report = CleanupReport::default();
    let mut failed = Vec::new();

    for path in package.manifest().removal_order() {
        if owned.contains(path) {
            report.skipped.push(path.to_string());
            continue;
        }
        let target = config.target_path(path);
        match conn.remove_file(&temp_sibling(&target)) {
            Ok(()) => debug!("Removed partial write {}", temp_sibling(&target)),
            Err(Error::NotFound(_)) => {}
            Err(e) => warn!("Could not remove {}: {}", temp_sibling(&target), e),
        }
        match conn.remove_file(&target) {
            Ok(()) => report.files_removed += 1,
            Err(Error::NotFound(_)) => report.missing.push(path.to_string()),
            Err(e) => failed.push(FailedUnit::new(path, e)),
        }
    }

    if !failed.is_empty() {
        return Err(Error::PartialFailure(failed));
    }
    info!(
        "Cleaned up {}: {} file(s) removed, {} skipped",
        package.id,
        report.files_removed,
        report.skipped.len()
    );
    Ok(report)
}

/// Installed packages on the device
pub fn query(conn: &mut dyn Connection, config: &Config) -> Result<Registry> {
    Registry::load(conn, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LocalConnection;
    use crate::device::testing::FaultyConnection;
    use crate::packages::ArchiveBuilder;
    use crate::packages::archive::{Archive, tar_payload};
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalConnection, Config) {
        let dir = TempDir::new().unwrap();
        let conn = LocalConnection::new(dir.path()).unwrap();
        let config = Config::with_data_dir(dir.path().join("host")).with_prefix("/opt");
        (dir, conn, config)
    }

    fn package(id: &str, version: &str, files: &[(&str, &[u8])]) -> Package {
        let mut builder = ArchiveBuilder::new(id, version);
        for (path, data) in files {
            builder.add_file(path, 0o644, data.to_vec()).unwrap();
        }
        Package::from_archive(builder.build().unwrap(), id)
    }

    fn install_ok(conn: &mut dyn Connection, config: &Config, pkg: &Package) -> InstallReport {
        install(conn, config, pkg, InstallOptions::default(), &CancelToken::new()).unwrap()
    }

    #[test]
    fn test_install_writes_files_and_registry() {
        let (dir, mut conn, config) = setup();
        let pkg = package("calc", "1.0.0", &[("bin/calc", b"\x00\x01\n"), ("share/calc/db", b"db")]);

        let report = install_ok(&mut conn, &config, &pkg);
        assert_eq!(report.files_written, 2);
        assert_eq!(report.created_dirs, vec!["bin", "share", "share/calc"]);
        assert_eq!(fs::read(dir.path().join("opt/bin/calc")).unwrap(), b"\x00\x01\n");

        let registry = query(&mut conn, &config).unwrap();
        let entry = registry.get("calc").unwrap();
        assert_eq!(entry.version, "1.0.0");
        assert_eq!(entry.manifest.entries(), &["bin/calc", "share/calc/db"]);
    }

    #[test]
    fn test_conflict_blocks_install_without_changes() {
        let (dir, mut conn, config) = setup();
        install_ok(&mut conn, &config, &package("A", "1", &[("bin/x", b"a"), ("lib/y", b"a")]));
        let before = fs::read(dir.path().join("opt/share/tabsync/registry.json")).unwrap();

        let b = package("B", "1", &[("bin/x", b"b"), ("bin/z", b"b")]);
        let err = install(&mut conn, &config, &b, InstallOptions::default(), &CancelToken::new()).unwrap_err();
        match err {
            Error::Conflict { package, conflicts } => {
                assert_eq!(package, "B");
                assert_eq!(conflicts[0].package_id, "A");
                assert_eq!(conflicts[0].paths, vec!["/opt/bin/x"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read(dir.path().join("opt/bin/x")).unwrap(), b"a");
        assert!(!dir.path().join("opt/bin/z").exists());
        assert_eq!(fs::read(dir.path().join("opt/share/tabsync/registry.json")).unwrap(), before);

        install_ok(&mut conn, &config, &package("C", "1", &[("share/w", b"c")]));
    }

    #[test]
    fn test_overwrite_drops_conflicting_entry() {
        let (dir, mut conn, config) = setup();
        install_ok(&mut conn, &config, &package("A", "1", &[("bin/x", b"a")]));

        let b = package("B", "1", &[("bin/x", b"b")]);
        let options = InstallOptions { allow_overwrite: true };
        let report = install(&mut conn, &config, &b, options, &CancelToken::new()).unwrap();
        assert_eq!(report.overwritten, vec!["A"]);
        assert_eq!(fs::read(dir.path().join("opt/bin/x")).unwrap(), b"b");

        let registry = query(&mut conn, &config).unwrap();
        assert!(!registry.contains("A"));
        assert_eq!(registry.owner_of("bin/x"), Some("B"));
    }

    #[test]
    fn test_mismatched_payload_is_rejected_before_writing() {
        let (dir, mut conn, config) = setup();
        let payload = tar_payload(&[PayloadEntry {
            path: "bin/a".into(),
            mode: 0o644,
            data: b"a".to_vec(),
        }])
        .unwrap();
        let manifest = Manifest::from_entries(["bin/a", "bin/b"]).unwrap();
        let pkg = Package::from_archive(Archive::new(b"", "", manifest, payload).unwrap(), "bad");

        let err = install(&mut conn, &config, &pkg, InstallOptions::default(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        assert!(!dir.path().join("opt").exists());
    }

    #[test]
    fn test_failed_write_leaves_registry_and_rerun_succeeds() {
        let (dir, conn, config) = setup();
        install_ok(&mut LocalConnection::new(dir.path()).unwrap(), &config, &package("A", "1", &[("a", b"a")]));

        let pkg = package("calc", "1", &[("bin/one", b"1"), ("bin/two", b"2")]);
        let mut faulty = FaultyConnection::new(conn).fail_write("/opt/bin/two");
        let err = install(&mut faulty, &config, &pkg, InstallOptions::default(), &CancelToken::new()).unwrap_err();
        match err {
            Error::PartialFailure(units) => {
                assert_eq!(units.len(), 1);
                assert_eq!(units[0].path, "bin/two");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!query(&mut faulty, &config).unwrap().contains("calc"));

        let mut conn = LocalConnection::new(dir.path()).unwrap();
        let report = install_ok(&mut conn, &config, &pkg);
        assert_eq!(report.files_written, 2);
        assert!(query(&mut conn, &config).unwrap().contains("calc"));
    }

    #[test]
    fn test_cancel_before_first_file() {
        let (dir, mut conn, config) = setup();
        let cancel = CancelToken::new();
        cancel.cancel();
        let pkg = package("calc", "1", &[("bin/calc", b"x")]);
        let err = install(&mut conn, &config, &pkg, InstallOptions::default(), &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!dir.path().join("opt/bin/calc").exists());
        assert!(query(&mut conn, &config).unwrap().is_empty());
    }

    #[test]
    fn test_upgrade_removes_stale_files() {
        let (dir, mut conn, config) = setup();
        install_ok(&mut conn, &config, &package("calc", "1.0.0", &[("bin/calc", b"1"), ("bin/old", b"o")]));
        let report = install_ok(&mut conn, &config, &package("calc", "1.1.0", &[("bin/calc", b"2")]));

        assert_eq!(report.previous_version.as_deref(), Some("1.0.0"));
        assert_eq!(report.removed_stale, vec!["bin/old"]);
        assert!(!dir.path().join("opt/bin/old").exists());

        let entry = query(&mut conn, &config).unwrap().get("calc").cloned().unwrap();
        assert_eq!(entry.created_dirs, vec!["bin"]);
    }

    #[test]
    fn test_uninstall_round_trip() {
        let (dir, mut conn, config) = setup();
        fs::create_dir_all(dir.path().join("opt/bin")).unwrap();
        fs::write(dir.path().join("opt/bin/user-tool"), b"keep").unwrap();

        let pkg = package("calc", "1", &[("bin/calc", b"c"), ("share/calc/a/b", b"b")]);
        install_ok(&mut conn, &config, &pkg);

        let report = uninstall(&mut conn, &config, "calc", &CancelToken::new()).unwrap();
        assert_eq!(report.files_removed, 2);
        // share/ still holds the registry
        assert_eq!(report.dirs_removed, vec!["share/calc/a", "share/calc"]);
        assert!(!dir.path().join("opt/share/calc").exists());
        assert_eq!(fs::read(dir.path().join("opt/bin/user-tool")).unwrap(), b"keep");
        assert!(!query(&mut conn, &config).unwrap().contains("calc"));
    }

    #[test]
    fn test_uninstall_unknown_package() {
        let (_dir, mut conn, config) = setup();
        let err = uninstall(&mut conn, &config, "ghost", &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_uninstall_tolerates_missing_files() {
        let (dir, mut conn, config) = setup();
        install_ok(&mut conn, &config, &package("calc", "1", &[("bin/a", b"a"), ("bin/b", b"b")]));
        fs::remove_file(dir.path().join("opt/bin/a")).unwrap();

        let report = uninstall(&mut conn, &config, "calc", &CancelToken::new()).unwrap();
        assert_eq!(report.missing, vec!["bin/a"]);
        assert_eq!(report.files_removed, 1);
    }

    #[test]
    fn test_uninstall_partial_failure_keeps_failed_paths() {
        let (dir, mut conn, config) = setup();
        install_ok(&mut conn, &config, &package("calc", "1", &[("data/f", b"f"), ("data/g", b"g")]));

        // A directory where a file is expected cannot be unlinked
        fs::remove_file(dir.path().join("opt/data/f")).unwrap();
        fs::create_dir_all(dir.path().join("opt/data/f/inner")).unwrap();

        let err = uninstall(&mut conn, &config, "calc", &CancelToken::new()).unwrap_err();
        match err {
            Error::PartialFailure(units) => assert_eq!(units[0].path, "data/f"),
            other => panic!("unexpected error: {other}"),
        }
        let entry = query(&mut conn, &config).unwrap().get("calc").cloned().unwrap();
        assert_eq!(entry.manifest.entries(), &["data/f"]);
        assert!(!dir.path().join("opt/data/g").exists());
    }

    #[test]
    fn test_cleanup_after_interrupted_install() {
        let (dir, mut conn, config) = setup();
        install_ok(&mut conn, &config, &package("A", "1", &[("bin/shared", b"a")]));

        fs::write(dir.path().join("opt/bin/calc"), b"half").unwrap();
        fs::write(dir.path().join("opt/bin/calc-data.tabsync-tmp"), b"partial").unwrap();
        let pkg = package("calc", "1", &[("bin/calc", b"c"), ("bin/calc-data", b"d"), ("bin/shared", b"s")]);

        let report = cleanup(&mut conn, &config, &pkg).unwrap();
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.missing, vec!["bin/calc-data"]);
        assert_eq!(report.skipped, vec!["bin/shared"]);
        assert!(!dir.path().join("opt/bin/calc").exists());
        assert!(!dir.path().join("opt/bin/calc-data.tabsync-tmp").exists());
        assert_eq!(fs::read(dir.path().join("opt/bin/shared")).unwrap(), b"a");
    }

    #[test]
    fn test_cleanup_refuses_installed_package() {
        let (_dir, mut conn, config) = setup();
        let pkg = package("calc", "1", &[("bin/calc", b"c")]);
        install_ok(&mut conn, &config, &pkg);
        assert!(matches!(cleanup(&mut conn, &config, &pkg), Err(Error::Conflict { .. })));
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("2", "10"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0", "1.0.0"), Ordering::Equal);
    }
}
