//! Is-finished marker files
//!
//! In marker mode a delivery `<name>` is only picked up once
//! `.MARKER_is_finished_<name>` appears next to it. The marker is deleted as
//! the delivery's clean-up action.

use crate::error::{RegistrationError, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const IS_FINISHED_PREFIX: &str = ".MARKER_is_finished_";

pub fn is_marker(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with(IS_FINISHED_PREFIX))
        .unwrap_or(false)
}

/// Content path a marker stands for
pub fn incoming_path_from_marker(marker: &Path) -> Result<PathBuf> {
    let name = marker
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target = name
        .strip_prefix(IS_FINISHED_PREFIX)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            RegistrationError::invalid_argument(format!(
                "'{}' is not an is-finished marker file",
                marker.display()
            ))
        })?;
    Ok(marker.with_file_name(target))
}

pub fn marker_for(incoming: &Path) -> PathBuf {
    let name = incoming
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    incoming.with_file_name(format!("{}{}", IS_FINISHED_PREFIX, name))
}

/// Delete a marker, logging instead of failing. Returns whether it is gone.
pub fn delete_marker(marker: &Path) -> bool {
    match std::fs::remove_file(marker) {
        Ok(()) => {
            info!(marker = %marker.display(), "Deleted is-finished marker");
            true
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(marker = %marker.display(), error = %e, "Failed to delete is-finished marker");
            false
        },
    }
}
