//! Filesystem primitives shared by the storage steps and their inverses

use crate::error::{RegistrationError, Result};
use std::path::Path;
use walkdir::WalkDir;

/// Move a file or directory, falling back to copy-and-delete when a plain
/// rename is not possible (e.g. across volumes).
pub fn move_path(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        create_dir_all(parent)?;
    }

    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }

    copy_path(from, to)?;
    remove_path(from)
}

/// Recursively copy a file or directory
pub fn copy_path(from: &Path, to: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(from)
        .map_err(|e| RegistrationError::io("Failed to read", from, e))?;

    if !metadata.is_dir() {
        if let Some(parent) = to.parent() {
            create_dir_all(parent)?;
        }
        std::fs::copy(from, to).map_err(|e| RegistrationError::io("Failed to copy", from, e))?;
        return Ok(());
    }

    for entry in WalkDir::new(from).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            RegistrationError::io("Failed to walk", from, std::io::Error::other(e.to_string()))
        })?;
        let relative = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .map_err(|e| RegistrationError::io("Failed to copy", entry.path(), e))?;
        }
    }

    Ok(())
}

/// Delete a file or directory tree; a missing path is not an error
pub fn remove_path(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(RegistrationError::io("Failed to read", path, e)),
    };

    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(|e| RegistrationError::io("Failed to delete", path, e))
}

pub fn create_dir_all(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| RegistrationError::io("Failed to create directory", path, e))
}

/// Final path component as a string, or an invalid-argument error
pub fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            RegistrationError::invalid_argument(format!("'{}' has no file name", path.display()))
        })
}
