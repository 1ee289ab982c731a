// src/device/path.rs

//! Device path handling
//!
//! Device paths are always Unix-style strings, whatever the host OS is, so
//! they are manipulated as `&str` rather than `std::path::Path`. Relative
//! paths coming from archives and snapshots are untrusted and must pass
//! [`normalize_relative`] before they are joined under a prefix.

use crate::error::{Error, Result};

/// Normalize an untrusted relative path
///
/// Strips `./` and empty components, rejects absolute paths and any `..`
/// component, and rejects paths that end up empty.
///
/// ```
/// use tabsync::device::path::normalize_relative;
///
/// assert_eq!(normalize_relative("./bin//tool").unwrap(), "bin/tool");
/// assert!(normalize_relative("/etc/passwd").is_err());
/// assert!(normalize_relative("bin/../../etc").is_err());
/// ```
pub fn normalize_relative(path: &str) -> Result<String> {
    if path.starts_with('/') {
        return Err(Error::Format(format!("absolute path not allowed: {}", path)));
    }

    let mut parts = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                return Err(Error::Format(format!("path traversal not allowed: {}", path)));
            }
            c => parts.push(c),
        }
    }

    if parts.is_empty() {
        return Err(Error::Format(format!("empty path: {:?}", path)));
    }
    Ok(parts.join("/"))
}

/// Join a normalized relative path under a device directory
pub fn join(base: &str, relative: &str) -> String {
    let base = base.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        if base.is_empty() { "/".to_string() } else { base.to_string() }
    } else {
        format!("{}/{}", base, relative)
    }
}

/// Parent directory of a device path, if it has one
pub fn parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

/// Number of components in a relative or absolute path
pub fn depth(path: &str) -> usize {
    path.split('/').filter(|c| !c.is_empty()).count()
}

/// Directories strictly between `prefix` and the file `relative`,
/// shallowest first
///
/// For `prefix = /opt` and `relative = bin/x/tool` this yields
/// `/opt/bin` and `/opt/bin/x`.
pub fn intermediate_dirs(prefix: &str, relative: &str) -> Vec<String> {
    let mut dirs = Vec::new();
    let mut current = prefix.trim_end_matches('/').to_string();
    let components: Vec<&str> = relative.split('/').filter(|c| !c.is_empty()).collect();
    if components.len() < 2 {
        return dirs;
    }
    for component in &components[..components.len() - 1] {
        current = join(&current, component);
        dirs.push(current.clone());
    }
    dirs
}

/// Whether `path` equals `subtree` or lies below it, compared by whole
/// components (`templates` matches `templates/a` but not `templates2/a`)
pub fn is_within(path: &str, subtree: &str) -> bool {
    let subtree = subtree.trim_matches('/');
    if subtree.is_empty() {
        return true;
    }
    let path = path.trim_start_matches('/');
    path == subtree
        || (path.starts_with(subtree) && path.as_bytes().get(subtree.len()) == Some(&b'/'))
}

/// Express an absolute device path relative to `root`
pub fn strip_root<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    let root = root.trim_end_matches('/');
    let rest = path.strip_prefix(root)?;
    if rest.is_empty() {
        return None;
    }
    rest.strip_prefix('/')
}

/// Quote a string for the device's POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_relative("a/b").unwrap(), "a/b");
        assert_eq!(normalize_relative("./a/./b/").unwrap(), "a/b");
        assert!(matches!(normalize_relative("/a"), Err(Error::Format(_))));
        assert!(matches!(normalize_relative("a/../b"), Err(Error::Format(_))));
        assert!(matches!(normalize_relative("./"), Err(Error::Format(_))));
    }

    #[test]
    fn test_join_and_parent() {
        assert_eq!(join("/opt/", "bin/x"), "/opt/bin/x");
        assert_eq!(join("", "bin"), "/bin");
        assert_eq!(join("/", "bin"), "/bin");
        assert_eq!(parent("/opt/bin/x"), Some("/opt/bin"));
        assert_eq!(parent("/opt"), Some("/"));
        assert_eq!(parent("opt"), None);
    }

    #[test]
    fn test_intermediate_dirs() {
        assert_eq!(
            intermediate_dirs("/opt", "bin/x/tool"),
            vec!["/opt/bin".to_string(), "/opt/bin/x".to_string()]
        );
        assert!(intermediate_dirs("/opt", "tool").is_empty());
    }

    #[test]
    fn test_is_within_matches_whole_components() {
        assert!(is_within("templates/a.png", "templates/"));
        assert!(is_within("templates", "templates"));
        assert!(!is_within("templates2/a.png", "templates"));
        assert!(!is_within("notebooks/x", "templates"));
        assert!(is_within("anything", ""));
    }

    #[test]
    fn test_strip_root() {
        assert_eq!(strip_root("/home/root/", "/home/root/a/b"), Some("a/b"));
        assert_eq!(strip_root("/home/root", "/home/rootx/a"), None);
        assert_eq!(strip_root("/home/root", "/home/root"), None);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
