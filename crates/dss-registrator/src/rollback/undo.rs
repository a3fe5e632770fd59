//! Applies an undo decision to the original incoming content

use crate::error::{RegistrationError, Result};
use crate::fs_ops;
use crate::policy::{UndoAction, UndoRecord};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Suffix of the file written next to content moved to the error area
pub const ERROR_REPORT_SUFFIX: &str = ".error.json";

#[derive(Serialize)]
struct ErrorReport<'a> {
    timestamp: String,
    incoming: String,
    classification: &'a str,
    reason: &'a str,
}

pub struct UndoExecutor<'a> {
    error_dir: &'a Path,
}

impl<'a> UndoExecutor<'a> {
    pub fn new(error_dir: &'a Path) -> Self {
        Self { error_dir }
    }

    /// Resolve the incoming content per `record`.
    ///
    /// Returns the new location for `MoveToError`. Content that is already
    /// gone (an earlier rollback of the same delivery handled it) is skipped.
    pub fn apply(&self, record: &UndoRecord, incoming: &Path) -> Result<Option<PathBuf>> {
        if record.action != UndoAction::None && !incoming.exists() {
            warn!(incoming = %incoming.display(), action = %record.action, "Incoming content is gone, nothing to undo");
            return Ok(None);
        }

        match record.action {
            UndoAction::None => {
                info!(incoming = %incoming.display(), class = %record.classification, "Leaving incoming content in place");
                Ok(None)
            },
            UndoAction::Delete => {
                fs_ops::remove_path(incoming)?;
                info!(incoming = %incoming.display(), class = %record.classification, "Deleted incoming content");
                Ok(None)
            },
            UndoAction::MoveToError => {
                let target = self.error_target(incoming)?;
                fs_ops::move_path(incoming, &target)?;
                self.write_report(record, incoming, &target)?;
                info!(
                    incoming = %incoming.display(),
                    target = %target.display(),
                    class = %record.classification,
                    "Moved incoming content to the error area"
                );
                Ok(Some(target))
            },
        }
    }

    fn error_target(&self, incoming: &Path) -> Result<PathBuf> {
        let name = fs_ops::file_name(incoming)?;
        let candidate = self.error_dir.join(&name);
        if !candidate.exists() {
            return Ok(candidate);
        }
        let stamped = format!("{}_{}", name, Utc::now().format("%Y%m%d%H%M%S%3f"));
        Ok(self.error_dir.join(stamped))
    }

    fn write_report(&self, record: &UndoRecord, incoming: &Path, target: &Path) -> Result<()> {
        let report = ErrorReport {
            timestamp: Utc::now().to_rfc3339(),
            incoming: incoming.display().to_string(),
            classification: record.classification.as_str(),
            reason: &record.reason,
        };
        let mut report_path = target.as_os_str().to_owned();
        report_path.push(ERROR_REPORT_SUFFIX);
        let report_path = PathBuf::from(report_path);

        let json = serde_json::to_string_pretty(&report).map_err(dss_common::DssError::from)?;
        std::fs::write(&report_path, json)
            .map_err(|e| RegistrationError::io("Failed to write error report", &report_path, e))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use dss_common::ErrorClass;

    fn record(action: UndoAction) -> UndoRecord {
        UndoRecord {
            action,
            reason: "bad content".to_string(),
            classification: ErrorClass::Content,
        }
    }

    #[test]
    fn test_move_to_error_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let incoming = dir.path().join("incoming/NEMO.EXP1==S1");
        std::fs::create_dir_all(&incoming).unwrap();
        std::fs::write(incoming.join("f.txt"), b"x").unwrap();
        let error_dir = dir.path().join("error");

        let target = UndoExecutor::new(&error_dir)
            .apply(&record(UndoAction::MoveToError), &incoming)
            .unwrap()
            .unwrap();

        assert!(!incoming.exists());
        assert_eq!(target, error_dir.join("NEMO.EXP1==S1"));
        assert!(target.join("f.txt").exists());
        let report = std::fs::read_to_string(error_dir.join("NEMO.EXP1==S1.error.json")).unwrap();
        assert!(report.contains("bad content"));
        assert!(report.contains("\"content\""));
    }

    #[test]
    fn test_second_move_gets_unique_name() {
        let dir = tempfile::tempdir().unwrap();
        let error_dir = dir.path().join("error");
        std::fs::create_dir_all(error_dir.join("data.txt")).unwrap();
        let incoming = dir.path().join("data.txt");
        std::fs::write(&incoming, b"x").unwrap();

        let target = UndoExecutor::new(&error_dir)
            .apply(&record(UndoAction::MoveToError), &incoming)
            .unwrap()
            .unwrap();
        assert_ne!(target, error_dir.join("data.txt"));
        assert!(target.is_file());
    }

    #[test]
    fn test_none_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let incoming = dir.path().join("data.txt");
        std::fs::write(&incoming, b"x").unwrap();
        let executor = UndoExecutor::new(dir.path());

        executor.apply(&record(UndoAction::None), &incoming).unwrap();
        assert!(incoming.exists());
        executor.apply(&record(UndoAction::Delete), &incoming).unwrap();
        assert!(!incoming.exists());
        assert_eq!(executor.apply(&record(UndoAction::Delete), &incoming).unwrap(), None);
    }
}
