// src/packages/archive.rs

//! Self-describing package archive codec
//!
//! ```text
//! <executable preamble text>
//! ##### INFO #####
//! <free-form info text>
//! ##### MANIFEST #####
//! <one relative path per line>
//! ##### PAYLOAD #####
//! <raw binary tar-compatible stream, to end of file>
//! ```
//!
//! The file is text up to the PAYLOAD sentinel and binary after it. Decoding
//! runs two ordered passes over the same source: a line scan that stops at
//! the PAYLOAD sentinel and counts the lines before it, then a seek back to
//! the start that skips exactly that many lines and takes the rest as opaque
//! bytes. The payload never goes through a line-oriented API.

use crate::device::path::normalize_relative;
use crate::error::{Error, Result};
use crate::packages::manifest::Manifest;
use flate2::read::GzDecoder;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;
use xz2::read::XzDecoder;

/// The three archive sections, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Info,
    Manifest,
    Payload,
}

impl Section {
    pub fn name(&self) -> &'static str {
        match self {
            Section::Info => "INFO",
            Section::Manifest => "MANIFEST",
            Section::Payload => "PAYLOAD",
        }
    }

    fn index(&self) -> usize {
        match self {
            Section::Info => 0,
            Section::Manifest => 1,
            Section::Payload => 2,
        }
    }

    /// Sentinel line as written by the encoder
    pub fn sentinel(&self) -> String {
        format!("##### {} #####\n", self.name())
    }

    const ALL: [Section; 3] = [Section::Info, Section::Manifest, Section::Payload];
}

/// Recognize a sentinel line: at least three `#`, a space, the section
/// name, a space, at least three `#`
fn parse_sentinel(line: &[u8]) -> Option<Section> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let text = std::str::from_utf8(line).ok()?;

    let rest = text.trim_start_matches('#');
    if text.len() - rest.len() < 3 {
        return None;
    }
    let inner = rest.trim_end_matches('#');
    if rest.len() - inner.len() < 3 {
        return None;
    }
    let name = inner.strip_prefix(' ')?.strip_suffix(' ')?;
    Section::ALL.into_iter().find(|s| s.name() == name)
}

/// Whether a line of text would be read back as a section boundary
pub(crate) fn is_sentinel(line: &str) -> bool {
    parse_sentinel(line.as_bytes()).is_some()
}

/// Reject text regions that would split differently when decoded
fn check_region(region: &str, text: &[u8]) -> Result<()> {
    for (index, line) in text.split(|b| *b == b'\n').enumerate() {
        if let Some(section) = parse_sentinel(line) {
            return Err(Error::Format(format!(
                "{} line {} looks like the {} sentinel",
                region,
                index + 1,
                section.name()
            )));
        }
    }
    Ok(())
}

/// Compression of the tar payload, detected from magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadCompression {
    None,
    Gzip,
    Zstd,
    Xz,
}

impl PayloadCompression {
    pub fn detect(payload: &[u8]) -> Self {
        if payload.starts_with(&[0x1F, 0x8B]) {
            PayloadCompression::Gzip
        } else if payload.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
            PayloadCompression::Zstd
        } else if payload.starts_with(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]) {
            PayloadCompression::Xz
        } else {
            PayloadCompression::None
        }
    }
}

/// A regular file carried in the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEntry {
    pub path: String,
    pub mode: u32,
    pub data: Vec<u8>,
}

/// A decoded (or about to be encoded) package archive
///
/// The three text regions are kept exactly as they appear on the wire, so
/// re-encoding a decoded archive reproduces its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    preamble: Vec<u8>,
    info_raw: String,
    manifest_raw: String,
    manifest: Manifest,
    payload: Vec<u8>,
}

impl Archive {
    /// Assemble an archive from its parts
    ///
    /// `info` becomes newline-terminated lines; an empty `info` is an empty
    /// section. A preamble that does not end in a newline gets one. A
    /// preamble or INFO line shaped like a sentinel is a format error, since
    /// the result would not decode back into the same parts.
    pub fn new(preamble: &[u8], info: &str, manifest: Manifest, payload: Vec<u8>) -> Result<Self> {
        check_region("preamble", preamble)?;
        check_region("INFO", info.as_bytes())?;

        let mut preamble = preamble.to_vec();
        if !preamble.is_empty() && !preamble.ends_with(b"\n") {
            preamble.push(b'\n');
        }
        let info_raw = if info.is_empty() {
            String::new()
        } else {
            format!("{}\n", info)
        };
        Ok(Self {
            preamble,
            info_raw,
            manifest_raw: manifest.to_text(),
            manifest,
            payload,
        })
    }

    /// Decode an archive from a seekable source
    pub fn decode<R: Read + Seek>(mut source: R) -> Result<Self> {
        // Pass 1: text scan up to the PAYLOAD sentinel
        let mut regions: [Vec<u8>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        let mut seen = [false; 3];
        let mut current = 0usize;
        let mut lines_before_payload = None;
        let mut text_bytes = 0u64;

        {
            let mut reader = BufReader::new(source.by_ref());
            let mut line = Vec::new();
            let mut index = 0usize;

            loop {
                line.clear();
                let n = reader.read_until(b'\n', &mut line)?;
                if n == 0 {
                    break;
                }
                text_bytes += n as u64;
                index += 1;

                let Some(section) = parse_sentinel(&line) else {
                    regions[current].extend_from_slice(&line);
                    continue;
                };

                if seen[section.index()] {
                    return Err(Error::Format(format!(
                        "duplicate {} sentinel at line {}",
                        section.name(),
                        index
                    )));
                }
                if section.index() != current {
                    let expected = Section::ALL[current].name();
                    return Err(Error::Format(format!(
                        "{} sentinel at line {} but {} sentinel is missing",
                        section.name(),
                        index,
                        expected
                    )));
                }
                seen[section.index()] = true;
                current += 1;

                if section == Section::Payload {
                    lines_before_payload = Some(index);
                    break;
                }
            }
        }

        let Some(line_count) = lines_before_payload else {
            let missing = Section::ALL[current.min(2)].name();
            return Err(Error::Format(format!("missing {} sentinel", missing)));
        };

        // Pass 2: skip exactly `line_count` lines of bytes, keep the rest raw
        source.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(source);
        let mut skipped = 0u64;
        let mut scratch = Vec::new();
        for _ in 0..line_count {
            scratch.clear();
            skipped += reader.read_until(b'\n', &mut scratch)? as u64;
        }
        if skipped != text_bytes {
            return Err(Error::Format(
                "archive changed between scan and payload read".to_string(),
            ));
        }
        let mut payload = Vec::new();
        reader.read_to_end(&mut payload)?;

        let [preamble, info, manifest] = regions;
        let info_raw = String::from_utf8(info)
            .map_err(|_| Error::Format("INFO section is not valid UTF-8".to_string()))?;
        let manifest_raw = String::from_utf8(manifest)
            .map_err(|_| Error::Format("MANIFEST section is not valid UTF-8".to_string()))?;
        let manifest = Manifest::parse(&manifest_raw)?;

        debug!(
            "Decoded archive: {} preamble bytes, {} manifest entries, {} payload bytes",
            preamble.len(),
            manifest.len(),
            payload.len()
        );

        Ok(Self {
            preamble,
            info_raw,
            manifest_raw,
            manifest,
            payload,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(Cursor::new(bytes))
    }

    /// Decode an archive file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            _ => Error::Io(e),
        })?;
        Self::decode(file)
    }

    /// Write the wire form
    pub fn write_to<W: Write>(&self, mut out: W) -> Result<()> {
        out.write_all(&self.preamble)?;
        out.write_all(Section::Info.sentinel().as_bytes())?;
        out.write_all(self.info_raw.as_bytes())?;
        out.write_all(Section::Manifest.sentinel().as_bytes())?;
        out.write_all(self.manifest_raw.as_bytes())?;
        out.write_all(Section::Payload.sentinel().as_bytes())?;
        out.write_all(&self.payload)?;
        out.flush()?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.preamble.len() + self.info_raw.len() + self.manifest_raw.len() + self.payload.len() + 64,
        );
        out.extend_from_slice(&self.preamble);
        out.extend_from_slice(Section::Info.sentinel().as_bytes());
        out.extend_from_slice(self.info_raw.as_bytes());
        out.extend_from_slice(Section::Manifest.sentinel().as_bytes());
        out.extend_from_slice(self.manifest_raw.as_bytes());
        out.extend_from_slice(Section::Payload.sentinel().as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn preamble(&self) -> &[u8] {
        &self.preamble
    }

    /// INFO text without the final line terminator
    pub fn info(&self) -> &str {
        self.info_raw.strip_suffix('\n').unwrap_or(&self.info_raw)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Manifest entries as absolute paths under `prefix`
    pub fn prefixed_manifest(&self, prefix: &str) -> Vec<String> {
        self.manifest.absolute_paths(prefix)
    }

    /// Raw payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Unpack the payload's regular files
    pub fn payload_entries(&self) -> Result<Vec<PayloadEntry>> {
        let compression = PayloadCompression::detect(&self.payload);
        debug!("Payload compression: {:?}", compression);

        let bytes = Cursor::new(self.payload.as_slice());
        let reader: Box<dyn Read + '_> = match compression {
            PayloadCompression::None => Box::new(bytes),
            PayloadCompression::Gzip => Box::new(GzDecoder::new(bytes)),
            PayloadCompression::Xz => Box::new(XzDecoder::new(bytes)),
            PayloadCompression::Zstd => Box::new(
                zstd::Decoder::new(bytes)
                    .map_err(|e| Error::Format(format!("invalid zstd payload: {}", e)))?,
            ),
        };

        let mut tar = tar::Archive::new(reader);
        let mut entries = Vec::new();
        let mut seen = BTreeSet::new();

        let iter = tar
            .entries()
            .map_err(|e| Error::Format(format!("unreadable payload: {}", e)))?;
        for entry in iter {
            let mut entry = entry.map_err(|e| Error::Format(format!("unreadable payload entry: {}", e)))?;
            let raw_path = entry
                .path()
                .map_err(|e| Error::Format(format!("invalid payload path: {}", e)))?
                .to_string_lossy()
                .into_owned();
            let entry_type = entry.header().entry_type();

            if entry_type.is_dir() {
                continue;
            }
            if !entry_type.is_file() {
                return Err(Error::Format(format!(
                    "unsupported payload entry type {:?}: {}",
                    entry_type, raw_path
                )));
            }

            let path = normalize_relative(&raw_path)?;
            if !seen.insert(path.clone()) {
                return Err(Error::Format(format!("duplicate payload entry: {}", path)));
            }
            let mode = entry.header().mode().unwrap_or(0o644);
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| Error::Format(format!("truncated payload entry {}: {}", path, e)))?;

            entries.push(PayloadEntry { path, mode, data });
        }

        Ok(entries)
    }
}

/// Encode `(preamble, info, manifest, payload)` to archive bytes
pub fn encode(preamble: &[u8], info: &str, manifest: &Manifest, payload: &[u8]) -> Result<Vec<u8>> {
    Ok(Archive::new(preamble, info, manifest.clone(), payload.to_vec())?.to_bytes())
}

/// Decode archive bytes
pub fn decode(bytes: &[u8]) -> Result<Archive> {
    Archive::from_bytes(bytes)
}

/// Build an uncompressed tar stream from payload entries
pub fn tar_payload(entries: &[PayloadEntry]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(entry.data.len() as u64);
        header.set_mode(entry.mode);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, &entry.path, entry.data.as_slice())?;
    }
    Ok(builder.into_inner()?)
}
