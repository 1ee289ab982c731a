// src/packages/builder.rs

//! Packing a staged directory into an archive

use crate::error::{Error, Result};
use crate::packages::InfoHeaders;
use crate::packages::archive::{Archive, PayloadCompression, PayloadEntry, tar_payload};
use crate::packages::manifest::Manifest;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;
use xz2::write::XzEncoder;

/// Preamble embedded by default: a POSIX sh script that understands the
/// legacy `--info`, `--manifest`, `--install` and `--uninstall` flags when
/// the archive itself is executed on the device
pub const DEFAULT_PREAMBLE: &str = r######"#!/bin/sh
# Self-extracting tabsync package
archive="$0"
prefix="${PREFIX:-$HOME/.local}"

section() {
    awk -v start="##### $1 #####" -v stop="##### $2 #####" \
        '$0 == stop { exit } on { print } $0 == start { on = 1 }' "$archive"
}

manifest() {
    section MANIFEST PAYLOAD | while IFS= read -r entry; do
        if [ -n "$entry" ]; then printf '%s\n' "$1$entry"; fi
    done
}

case "$1" in
    --info)
        section INFO MANIFEST
        ;;
    --manifest)
        manifest "$prefix/"
        ;;
    --install)
        line=$(grep -a -n -m1 '^##### PAYLOAD #####$' "$archive" | cut -d: -f1)
        [ -n "$line" ] || exit 1
        mkdir -p "$prefix" || exit 1
        tail -n +"$((line + 1))" "$archive" | tar -xf - -C "$prefix" || exit 1
        ;;
    --uninstall)
        manifest "$prefix/" | while IFS= read -r path; do rm -f "$path"; done
        ;;
    *)
        echo "usage: $0 --info|--manifest|--install|--uninstall" >&2
        ;;
esac
exit 0
"######;

/// Assembles an archive from files added one by one or from a staged tree
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    name: String,
    version: String,
    description: Option<String>,
    preamble: Vec<u8>,
    compression: PayloadCompression,
    entries: Vec<PayloadEntry>,
}

impl ArchiveBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            preamble: DEFAULT_PREAMBLE.as_bytes().to_vec(),
            compression: PayloadCompression::None,
            entries: Vec::new(),
        }
    }

    /// Free-form text appended to INFO after the headers
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn preamble(mut self, preamble: impl Into<Vec<u8>>) -> Self {
        self.preamble = preamble.into();
        self
    }

    pub fn compression(mut self, compression: PayloadCompression) -> Self {
        self.compression = compression;
        self
    }

    /// Add one file; the path is relative to the install prefix
    pub fn add_file(&mut self, path: &str, mode: u32, data: Vec<u8>) -> Result<()> {
        let path = crate::device::path::normalize_relative(path)?;
        if self.entries.iter().any(|e| e.path == path) {
            return Err(Error::Format(format!("duplicate package file: {}", path)));
        }
        self.entries.push(PayloadEntry { path, mode, data });
        Ok(())
    }

    /// Add every regular file below `root`, in sorted traversal order
    pub fn add_dir(&mut self, root: &Path) -> Result<()> {
        if !root.is_dir() {
            return Err(Error::NotFound(format!("staging directory {}", root.display())));
        }

        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !file_type.is_file() {
                return Err(Error::Format(format!(
                    "only regular files can be packaged: {}",
                    relative
                )));
            }

            let data = fs::read(entry.path())?;
            let mode = file_mode(&entry.metadata().map_err(|e| Error::Io(e.into()))?);
            debug!("Packing {} ({} bytes, mode {:o})", relative, data.len(), mode);
            self.add_file(&relative, mode, data)?;
        }
        Ok(())
    }

    pub fn build(self) -> Result<Archive> {
        let manifest = Manifest::from_entries(self.entries.iter().map(|e| e.path.as_str()))?;
        let tar = tar_payload(&self.entries)?;
        let payload = compress(tar, self.compression)?;

        let mut info = InfoHeaders::render(&self.name, &self.version);
        if let Some(description) = &self.description {
            info.push_str("\n\n");
            info.push_str(description.trim_end_matches('\n'));
        }

        let archive = Archive::new(&self.preamble, &info, manifest, payload)?;
        info!(
            "Built archive {} {}: {} file(s), {} payload bytes",
            self.name,
            self.version,
            archive.manifest().len(),
            archive.payload().len()
        );
        Ok(archive)
    }

    /// Build and write the archive to `path`, marking it executable
    pub fn write(self, path: &Path) -> Result<Archive> {
        let archive = self.build()?;
        let mut file = fs::File::create(path)?;
        archive.write_to(&mut file)?;
        make_executable(path)?;
        Ok(archive)
    }
}

fn compress(tar: Vec<u8>, compression: PayloadCompression) -> Result<Vec<u8>> {
    Ok(match compression {
        PayloadCompression::None => tar,
        PayloadCompression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&tar)?;
            encoder.finish()?
        }
        PayloadCompression::Zstd => zstd::encode_all(tar.as_slice(), 3)?,
        PayloadCompression::Xz => {
            let mut encoder = XzEncoder::new(Vec::new(), 6);
            encoder.write_all(&tar)?;
            encoder.finish()?
        }
    })
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::Package;
    use tempfile::TempDir;

    fn staged() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::create_dir_all(dir.path().join("share/calc")).unwrap();
        fs::write(dir.path().join("bin/calc"), b"\x7fELF\n\r\n").unwrap();
        fs::write(dir.path().join("share/calc/README"), b"readme").unwrap();
        fs::write(dir.path().join("a.conf"), b"k=v").unwrap();
        dir
    }

    #[test]
    fn test_add_dir_discovery_order() {
        let dir = staged();
        let mut builder = ArchiveBuilder::new("calc", "1.0.0");
        builder.add_dir(dir.path()).unwrap();
        let archive = builder.build().unwrap();

        assert_eq!(
            archive.manifest().entries(),
            &["a.conf", "bin/calc", "share/calc/README"]
        );
        assert!(archive.preamble().starts_with(b"#!/bin/sh\n"));
    }

    #[test]
    fn test_built_archive_verifies() {
        let dir = staged();
        let mut builder = ArchiveBuilder::new("calc", "1.0.0")
            .description("A calculator")
            .compression(PayloadCompression::Gzip);
        builder.add_dir(dir.path()).unwrap();
        let bytes = builder.build().unwrap().to_bytes();

        let package = Package::from_archive(Archive::from_bytes(&bytes).unwrap(), "fallback");
        assert_eq!(package.id, "calc");
        assert_eq!(package.version, "1.0.0");
        assert!(package.archive.info().ends_with("A calculator"));

        let entries = package.verify().unwrap();
        let calc = entries.iter().find(|e| e.path == "bin/calc").unwrap();
        assert_eq!(calc.data, b"\x7fELF\n\r\n");
    }

    #[test]
    fn test_default_preamble_is_kept_verbatim() {
        let mut builder = ArchiveBuilder::new("calc", "1.0.0");
        builder.add_file("bin/calc", 0o755, b"x".to_vec()).unwrap();
        let bytes = builder.build().unwrap().to_bytes();

        let decoded = Archive::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.preamble(), DEFAULT_PREAMBLE.as_bytes());
        assert!(DEFAULT_PREAMBLE.contains("start=\"##### $1 #####\""));
        assert!(DEFAULT_PREAMBLE.ends_with("esac\nexit 0\n"));
    }

    #[test]
    fn test_description_with_sentinel_line_is_rejected() {
        let builder = ArchiveBuilder::new("calc", "1.0.0").description("notes\n##### PAYLOAD #####");
        assert!(matches!(builder.build(), Err(Error::Format(_))));
    }

    #[test]
    fn test_duplicate_file_is_rejected() {
        let mut builder = ArchiveBuilder::new("x", "1");
        builder.add_file("bin/x", 0o755, b"1".to_vec()).unwrap();
        assert!(builder.add_file("./bin/x", 0o755, b"2".to_vec()).is_err());
    }

    #[test]
    fn test_write_marks_executable() {
        let out = TempDir::new().unwrap();
        let path = out.path().join("calc.sh");
        let mut builder = ArchiveBuilder::new("calc", "1");
        builder.add_file("bin/calc", 0o755, b"x".to_vec()).unwrap();
        let archive = builder.write(&path).unwrap();

        assert_eq!(Archive::open(&path).unwrap(), archive);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}
