// src/resolver.rs

//! Manifest conflict detection
//!
//! Packages have no dependencies; the only relation between them is path
//! ownership. A candidate conflicts with every installed package (other than
//! an earlier version of itself) whose manifest names one of the same
//! absolute paths under the install prefix.

use crate::device::path::join;
use crate::error::{Error, PackageConflict};
use crate::packages::manifest::Manifest;
use crate::packages::registry::Registry;
use std::collections::BTreeSet;

/// Installed packages overlapping a candidate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictResult {
    pub conflicts: Vec<PackageConflict>,
}

impl ConflictResult {
    /// Nothing overlaps: the candidate can be installed
    pub fn is_installable(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Identifiers of the conflicting packages
    pub fn package_ids(&self) -> Vec<&str> {
        self.conflicts.iter().map(|c| c.package_id.as_str()).collect()
    }

    pub fn into_error(self, package: &str) -> Error {
        Error::Conflict {
            package: package.to_string(),
            conflicts: self.conflicts,
        }
    }
}

/// Overlap of `candidate` with every registry entry
pub fn conflicts(candidate: &Manifest, registry: &Registry, prefix: &str) -> ConflictResult {
    find(candidate, registry, prefix, None)
}

/// Overlap of candidate `package_id` with every other registry entry;
/// the entry with the same identifier is an upgrade, not a conflict
pub fn conflicts_for(
    package_id: &str,
    candidate: &Manifest,
    registry: &Registry,
    prefix: &str,
) -> ConflictResult {
    find(candidate, registry, prefix, Some(package_id))
}

fn find(candidate: &Manifest, registry: &Registry, prefix: &str, skip: Option<&str>) -> ConflictResult {
    let wanted = candidate.absolute_paths(prefix);
    let mut result = ConflictResult::default();

    for (id, entry) in registry.iter() {
        if Some(id) == skip {
            continue;
        }
        let installed: BTreeSet<String> = entry.manifest.iter().map(|p| join(prefix, p)).collect();
        let paths: Vec<String> = wanted.iter().filter(|p| installed.contains(*p)).cloned().collect();
        if !paths.is_empty() {
            result.conflicts.push(PackageConflict {
                package_id: id.to_string(),
                paths,
            });
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::registry::RegistryEntry;

    fn registry(entries: &[(&str, &[&str])]) -> Registry {
        let mut registry = Registry::new();
        for (id, paths) in entries {
            let manifest = Manifest::from_entries(paths.iter()).unwrap();
            registry.insert(*id, RegistryEntry::new("1", manifest, Vec::new()));
        }
        registry
    }

    #[test]
    fn test_overlap_reports_only_shared_paths() {
        let installed = registry(&[("A", &["bin/x", "lib/y"])]);

        let b = Manifest::from_entries(["bin/x", "bin/z"]).unwrap();
        let result = conflicts(&b, &installed, "/opt");
        assert_eq!(
            result.conflicts,
            vec![PackageConflict {
                package_id: "A".into(),
                paths: vec!["/opt/bin/x".into()],
            }]
        );
        assert!(!result.is_installable());

        let c = Manifest::from_entries(["share/w"]).unwrap();
        assert!(conflicts(&c, &installed, "/opt").is_installable());
    }

    #[test]
    fn test_paths_follow_candidate_order() {
        let installed = registry(&[("A", &["a", "b", "c"]), ("B", &["d"])]);
        let candidate = Manifest::from_entries(["d", "c", "a"]).unwrap();
        let result = conflicts(&candidate, &installed, "/p");
        assert_eq!(result.package_ids(), vec!["A", "B"]);
        assert_eq!(result.conflicts[0].paths, vec!["/p/c", "/p/a"]);
    }

    #[test]
    fn test_same_identifier_is_an_upgrade() {
        let installed = registry(&[("A", &["bin/x"])]);
        let next = Manifest::from_entries(["bin/x", "bin/new"]).unwrap();
        assert!(conflicts_for("A", &next, &installed, "/opt").is_installable());
        assert!(!conflicts_for("B", &next, &installed, "/opt").is_installable());
    }

    #[test]
    fn test_into_error() {
        let installed = registry(&[("A", &["bin/x"])]);
        let candidate = Manifest::from_entries(["bin/x"]).unwrap();
        let err = conflicts(&candidate, &installed, "/opt").into_error("B");
        assert!(matches!(err, Error::Conflict { package, conflicts } if package == "B" && conflicts.len() == 1));
    }
}
