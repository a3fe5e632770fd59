//! Checksum utilities for stored content
//!
//! SHA-256 is used throughout: for per-file checksums reported to the
//! registry, for directory-tree fingerprints, and for deriving the
//! content-addressed shard of a data set code.

use crate::error::{DssError, Result};
use crate::types::FileMetadata;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use walkdir::WalkDir;

/// Compute the SHA-256 checksum of a file
pub fn compute_file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file)
}

/// Compute the SHA-256 checksum of any readable source
pub fn compute_checksum<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of a string, hex encoded
pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Verify the checksum of a file
pub fn verify_file_checksum(path: impl AsRef<Path>, expected: &str) -> Result<bool> {
    let actual = compute_file_checksum(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(true)
    } else {
        Err(DssError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Fingerprint a file or directory tree.
///
/// Relative paths, entry kinds and file contents all feed the digest, so two
/// trees hash equal only when they are byte-identical. Entries are visited in
/// sorted order.
pub fn compute_tree_checksum(root: impl AsRef<Path>) -> Result<String> {
    let root = root.as_ref();
    let mut hasher = Sha256::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| DssError::Io(std::io::Error::other(e.to_string())))?;
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        hasher.update(relative.to_string_lossy().as_bytes());

        if entry.file_type().is_dir() {
            hasher.update(b"/d\0");
        } else {
            hasher.update(b"/f\0");
            let mut file = std::fs::File::open(entry.path())?;
            hasher.update(compute_checksum(&mut file)?.as_bytes());
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Describe every regular file below `root` with its checksum and size.
///
/// Paths are relative to `root`, using `/` as separator.
pub fn describe_files(root: impl AsRef<Path>) -> Result<Vec<FileMetadata>> {
    let root = root.as_ref();
    let mut files = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| DssError::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push(FileMetadata {
            path,
            checksum: compute_file_checksum(entry.path())?,
            size: entry.metadata().map_err(|e| DssError::Io(std::io::Error::other(e.to_string())))?.len(),
        });
    }

    Ok(files)
}
