// src/packages/manifest.rs

//! Ordered, duplicate-free sets of relative file paths

use crate::device::path::{depth, join, normalize_relative};
use crate::error::{Error, Result};
use crate::packages::archive::is_sentinel;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Relative paths belonging to a package, in discovery order
///
/// Order is preserved exactly as read so that two manifests of the same
/// package diff cleanly. Serialized as a plain list of paths, which is
/// validated again on the way back in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Manifest {
    entries: Vec<String>,
    index: HashSet<String>,
}

impl TryFrom<Vec<String>> for Manifest {
    type Error = Error;

    fn try_from(paths: Vec<String>) -> Result<Self> {
        Self::from_entries(paths)
    }
}

impl From<Manifest> for Vec<String> {
    fn from(manifest: Manifest) -> Self {
        manifest.entries
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a manifest from untrusted paths
    pub fn from_entries<I, S>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut manifest = Self::new();
        for path in paths {
            manifest.push(path.as_ref())?;
        }
        Ok(manifest)
    }

    /// Parse the MANIFEST section: one path per line, blank lines ignored
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_entries(
            text.lines()
                .map(|l| l.trim_end_matches('\r'))
                .filter(|l| !l.trim().is_empty()),
        )
    }

    /// Append a path, rejecting duplicates and unsafe paths
    ///
    /// An entry must survive the MANIFEST section unchanged, so line
    /// breaks and sentinel-shaped names are refused.
    pub fn push(&mut self, path: &str) -> Result<()> {
        if path.contains(['\n', '\r']) {
            return Err(Error::Format(format!("manifest entry spans lines: {:?}", path)));
        }
        let normalized = normalize_relative(path)?;
        if is_sentinel(&normalized) {
            return Err(Error::Format(format!(
                "manifest entry looks like a section sentinel: {}",
                normalized
            )));
        }
        if !self.index.insert(normalized.clone()) {
            return Err(Error::Format(format!("duplicate manifest entry: {}", normalized)));
        }
        self.entries.push(normalized);
        Ok(())
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains(path)
    }

    /// Serialized MANIFEST section text, newline-terminated
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for entry in &self.entries {
            text.push_str(entry);
            text.push('\n');
        }
        text
    }

    /// Entries re-anchored under an install prefix
    pub fn absolute_paths(&self, prefix: &str) -> Vec<String> {
        self.entries.iter().map(|e| join(prefix, e)).collect()
    }

    pub fn to_set(&self) -> BTreeSet<&str> {
        self.iter().collect()
    }

    /// Entries ordered for removal: deepest first, then reverse
    /// lexicographic, so directories empty out before any rmdir
    pub fn removal_order(&self) -> Vec<&str> {
        let mut order: Vec<&str> = self.iter().collect();
        order.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| b.cmp(a)));
        order
    }

    /// Keep only entries accepted by `keep`, preserving order
    pub fn retain<F: FnMut(&str) -> bool>(&mut self, mut keep: F) {
        let index = &mut self.index;
        self.entries.retain(|e| {
            let kept = keep(e);
            if !kept {
                index.remove(e.as_str());
            }
            kept
        });
    }

    /// Require the payload to hold exactly the manifest's files
    pub fn verify_payload<'a, I>(&self, payload_paths: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let payload: BTreeSet<&str> = payload_paths.into_iter().collect();
        let manifest = self.to_set();

        let missing: Vec<&str> = manifest.difference(&payload).copied().collect();
        let extra: Vec<&str> = payload.difference(&manifest).copied().collect();

        if missing.is_empty() && extra.is_empty() {
            return Ok(());
        }

        let mut problems = Vec::new();
        if !missing.is_empty() {
            problems.push(format!("missing from payload: {}", missing.join(", ")));
        }
        if !extra.is_empty() {
            problems.push(format!("not in manifest: {}", extra.join(", ")));
        }
        Err(Error::Format(format!(
            "manifest and payload differ ({})",
            problems.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_order_and_normalizes() {
        let manifest = Manifest::parse("./bin/tool\r\n\nshare/doc/README\nbin/a\n").unwrap();
        assert_eq!(manifest.entries(), &["bin/tool", "share/doc/README", "bin/a"]);
        assert_eq!(manifest.to_text(), "bin/tool\nshare/doc/README\nbin/a\n");
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let result = Manifest::parse("a/x\n./a/x\n");
        assert!(matches!(result, Err(Error::Format(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn test_unsafe_paths_are_rejected() {
        assert!(Manifest::parse("/etc/passwd\n").is_err());
        assert!(Manifest::parse("a/../../etc\n").is_err());
    }

    #[test]
    fn test_removal_order_deepest_first() {
        let manifest = Manifest::from_entries(["a", "a2/b/c", "a2/b", "z/y", "a2/d"]).unwrap();
        assert_eq!(manifest.removal_order(), vec!["a2/b/c", "z/y", "a2/d", "a2/b", "a"]);
    }

    #[test]
    fn test_absolute_paths() {
        let manifest = Manifest::from_entries(["bin/x"]).unwrap();
        assert_eq!(manifest.absolute_paths("/opt/"), vec!["/opt/bin/x"]);
    }

    #[test]
    fn test_verify_payload() {
        let manifest = Manifest::from_entries(["a/x", "a/y"]).unwrap();
        assert!(manifest.verify_payload(["a/y", "a/x"]).is_ok());

        let err = manifest.verify_payload(["a/y"]).unwrap_err();
        assert!(matches!(&err, Error::Format(msg) if msg.contains("missing from payload: a/x")));

        let err = manifest.verify_payload(["a/x", "a/y", "b"]).unwrap_err();
        assert!(matches!(&err, Error::Format(msg) if msg.contains("not in manifest: b")));
    }

    #[test]
    fn test_serde_is_a_plain_list() {
        let manifest = Manifest::from_entries(["a", "b"]).unwrap();
        assert_eq!(serde_json::to_string(&manifest).unwrap(), r#"["a","b"]"#);

        let back: Manifest = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(back, manifest);
        assert!(back.contains("b"));
        assert!(serde_json::from_str::<Manifest>(r#"["a","./a"]"#).is_err());
    }

    #[test]
    fn test_sentinel_shaped_entries_are_rejected() {
        let result = Manifest::from_entries(["##### PAYLOAD #####", "bin/a"]);
        assert!(matches!(result, Err(Error::Format(msg)) if msg.contains("sentinel")));
        assert!(Manifest::from_entries(["### INFO ###"]).is_err());
        assert!(Manifest::from_entries(["bin/##### PAYLOAD #####"]).is_ok());
    }

    #[test]
    fn test_entries_with_line_breaks_are_rejected() {
        assert!(Manifest::from_entries(["bin/a\nbin/b"]).is_err());
        assert!(Manifest::from_entries(["bin/a\r"]).is_err());
    }

    #[test]
    fn test_retain_updates_membership() {
        let mut manifest = Manifest::from_entries(["a", "b", "c"]).unwrap();
        manifest.retain(|p| p != "b");
        assert_eq!(manifest.entries(), &["a", "c"]);
        assert!(!manifest.contains("b"));
        manifest.push("b").unwrap();
        assert_eq!(manifest.entries(), &["a", "c", "b"]);
    }

    #[test]
    fn test_large_manifest_builds() {
        let paths: Vec<String> = (0..20_000).map(|i| format!("share/data/{:05}", i)).collect();
        let manifest = Manifest::from_entries(&paths).unwrap();
        assert_eq!(manifest.len(), 20_000);
        assert!(manifest.contains("share/data/19999"));
    }
}
