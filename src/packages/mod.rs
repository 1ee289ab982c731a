// src/packages/mod.rs

//! Package archives and their installation onto a device
//!
//! An archive file is decoded by [`archive`], checked by [`Package::verify`]
//! and applied by [`transaction`]. What is installed lives in the device-side
//! [`registry`].

pub mod archive;
pub mod builder;
pub mod manifest;
pub mod registry;
pub mod transaction;

pub use archive::{Archive, PayloadEntry};
pub use builder::ArchiveBuilder;
pub use manifest::Manifest;
pub use registry::{Registry, RegistryEntry};
pub use transaction::{InstallOptions, TransactionState};

use crate::error::Result;
use std::path::Path;

/// Version assigned when the INFO section carries no `Version:` header
pub const UNKNOWN_VERSION: &str = "0";

/// A decoded archive with its identity resolved
#[derive(Debug, Clone)]
pub struct Package {
    pub id: String,
    pub version: String,
    pub archive: Archive,
}

impl Package {
    /// Resolve identifier and version from INFO headers, falling back to
    /// `fallback_id` and [`UNKNOWN_VERSION`]
    pub fn from_archive(archive: Archive, fallback_id: &str) -> Self {
        let headers = InfoHeaders::parse(archive.info());
        Self {
            id: headers.package.unwrap_or_else(|| fallback_id.to_string()),
            version: headers.version.unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
            archive,
        }
    }

    /// Decode an archive file; its stem names the package when INFO does not
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let archive = Archive::open(path)?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "package".to_string());
        Ok(Self::from_archive(archive, &stem))
    }

    pub fn manifest(&self) -> &Manifest {
        self.archive.manifest()
    }

    /// Unpack the payload and require it to hold exactly the manifest's
    /// files
    pub fn verify(&self) -> Result<Vec<PayloadEntry>> {
        let entries = self.archive.payload_entries()?;
        self.manifest()
            .verify_payload(entries.iter().map(|e| e.path.as_str()))?;
        Ok(entries)
    }
}

/// `Key: value` headers found in INFO text
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InfoHeaders {
    pub package: Option<String>,
    pub version: Option<String>,
}

impl InfoHeaders {
    /// Keys are case-insensitive; the first occurrence of a key wins
    pub fn parse(info: &str) -> Self {
        let mut headers = Self::default();
        for line in info.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let slot = match key.trim().to_ascii_lowercase().as_str() {
                "package" => &mut headers.package,
                "version" => &mut headers.version,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.to_string());
            }
        }
        headers
    }

    /// Header block written by the builder
    pub fn render(package: &str, version: &str) -> String {
        format!("Package: {}\nVersion: {}", package, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::packages::archive::tar_payload;

    #[test]
    fn test_info_headers() {
        let headers = InfoHeaders::parse("package: calc\nVERSION: 1.2.0\nVersion: 9\nnotes: x");
        assert_eq!(headers.package.as_deref(), Some("calc"));
        assert_eq!(headers.version.as_deref(), Some("1.2.0"));
    }

    #[test]
    fn test_identity_falls_back_to_stem() {
        let archive = Archive::new(b"", "A free-form description", Manifest::new(), Vec::new()).unwrap();
        let package = Package::from_archive(archive, "calc");
        assert_eq!(package.id, "calc");
        assert_eq!(package.version, UNKNOWN_VERSION);
    }

    #[test]
    fn test_verify_rejects_manifest_payload_mismatch() {
        let payload = tar_payload(&[PayloadEntry {
            path: "bin/a".into(),
            mode: 0o755,
            data: b"a".to_vec(),
        }])
        .unwrap();
        let manifest = Manifest::from_entries(["bin/a", "bin/b"]).unwrap();
        let package = Package::from_archive(Archive::new(b"", "", manifest, payload).unwrap(), "p");
        assert!(matches!(package.verify(), Err(Error::Format(_))));
    }
}
