// src/hash.rs

//! SHA-256 helpers for file integrity
//!
//! Every checksum in tabsync is a lowercase hex SHA-256 digest, so values
//! computed here compare directly against `sha256sum` output on the device.
//! Batch hashing of files already on the host runs on the rayon pool, which
//! is sized to the number of CPU cores.

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const CHUNK_SIZE: usize = 64 * 1024;

/// Hash an in-memory buffer
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Hash everything a reader yields, in fixed-size chunks
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash a host file without loading it into memory
pub fn hash_file(path: &Path) -> io::Result<String> {
    hash_reader(File::open(path)?)
}

/// Hash many host files in parallel, preserving input order
pub fn hash_files(paths: &[PathBuf]) -> Vec<io::Result<String>> {
    paths.par_iter().map(|p| hash_file(p)).collect()
}

/// Check that a checksum string looks like a SHA-256 hex digest
pub fn is_valid_checksum(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}
