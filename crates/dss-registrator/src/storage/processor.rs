//! Storage processor plugin boundary
//!
//! A processor turns staged content into what gets stored. It must write its
//! result to `<precommit_dir>/<code>` (the engine records that location for
//! rollback before calling `store`) and must accept `unstore` on a location
//! that was never written.

use crate::details::RegistrationDetails;
use crate::error::{RegistrationError, Result};
use crate::fs_ops;
use crate::notify::{LogNotifier, Notification, Notifier};
use dss_common::checksum;
use dss_common::types::{DataSetCode, FileMetadata};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Directory inside a stored data set holding the delivered content
pub const ORIGINAL_DIR: &str = "original";

/// Result of [`StorageProcessor::store`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLocation {
    pub path: PathBuf,
    pub files: Vec<FileMetadata>,
}

pub trait StorageProcessor: Send + Sync {
    fn store(
        &self,
        staged: &Path,
        details: &RegistrationDetails,
        code: &DataSetCode,
        precommit_dir: &Path,
    ) -> Result<StoredLocation>;

    fn unstore(&self, location: &Path) -> Result<()>;

    /// Validate the processor's own configuration without side effects
    fn check(&self) -> Result<()>;
}

const KNOWN_PROPERTIES: [&str; 3] = ["required_files", "allow_empty", "compute_checksums"];

/// Copies staged content to `<precommit>/<code>/original/<name>`.
///
/// Recognised properties:
/// - `required_files`: comma-separated relative paths that must be present
/// - `allow_empty`: accept deliveries without any file (default `false`)
/// - `compute_checksums`: attach SHA-256 per file (default `true`)
pub struct DefaultStorageProcessor {
    required_files: Vec<String>,
    allow_empty: bool,
    compute_checksums: bool,
    unknown_properties: Vec<String>,
    notifier: Arc<dyn Notifier>,
    recipient: Option<String>,
}

impl Default for DefaultStorageProcessor {
    fn default() -> Self {
        Self {
            required_files: Vec::new(),
            allow_empty: false,
            compute_checksums: true,
            unknown_properties: Vec::new(),
            notifier: Arc::new(LogNotifier),
            recipient: None,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RegistrationError::config(format!(
            "processor property '{}' must be a boolean, got '{}'",
            key, value
        ))),
    }
}

impl DefaultStorageProcessor {
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Result<Self> {
        let mut processor = Self::default();

        if let Some(files) = properties.get("required_files") {
            processor.required_files = files
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
        }
        if let Some(value) = properties.get("allow_empty") {
            processor.allow_empty = parse_bool("allow_empty", value)?;
        }
        if let Some(value) = properties.get("compute_checksums") {
            processor.compute_checksums = parse_bool("compute_checksums", value)?;
        }
        processor.unknown_properties = properties
            .keys()
            .filter(|k| !KNOWN_PROPERTIES.contains(&k.as_str()))
            .cloned()
            .collect();

        Ok(processor)
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>, recipient: Option<String>) -> Self {
        self.notifier = notifier;
        self.recipient = recipient;
        self
    }

    fn validate_content(&self, staged: &Path, code: &DataSetCode) -> Result<()> {
        let missing: Vec<&str> = self
            .required_files
            .iter()
            .map(String::as_str)
            .filter(|required| {
                // A plain file delivery satisfies a requirement naming it.
                let in_dir = staged.is_dir() && staged.join(required).exists();
                let is_file = staged.is_file() && staged.file_name().is_some_and(|n| n == *required);
                !in_dir && !is_file
            })
            .collect();

        if !missing.is_empty() {
            let message = format!(
                "Data set {} is incomplete, missing: {}",
                code,
                missing.join(", ")
            );
            self.notifier.notify(Notification {
                recipient: self.recipient.clone(),
                subject: format!("Incomplete data set {}", code),
                body: format!("{} (staged at {})", message, staged.display()),
            });
            return Err(RegistrationError::invalid_content(message));
        }

        if !self.allow_empty && staged.is_dir() {
            let has_file = walkdir::WalkDir::new(staged)
                .into_iter()
                .filter_map(|e| e.ok())
                .any(|e| e.file_type().is_file());
            if !has_file {
                return Err(RegistrationError::invalid_content(format!(
                    "Data set {} contains no files",
                    code
                )));
            }
        }

        Ok(())
    }
}

impl StorageProcessor for DefaultStorageProcessor {
    fn store(
        &self,
        staged: &Path,
        _details: &RegistrationDetails,
        code: &DataSetCode,
        precommit_dir: &Path,
    ) -> Result<StoredLocation> {
        self.validate_content(staged, code)?;

        let location = precommit_dir.join(code.as_str());
        let target = location.join(ORIGINAL_DIR).join(fs_ops::file_name(staged)?);
        fs_ops::copy_path(staged, &target)?;

        let files = if self.compute_checksums {
            checksum::describe_files(&location)?
        } else {
            Vec::new()
        };

        debug!(code = %code, location = %location.display(), files = files.len(), "Processed staged content");
        Ok(StoredLocation { path: location, files })
    }

    fn unstore(&self, location: &Path) -> Result<()> {
        fs_ops::remove_path(location)
    }

    fn check(&self) -> Result<()> {
        for key in &self.unknown_properties {
            warn!(property = %key, "Ignoring unknown storage processor property");
        }
        if self.required_files.iter().any(|f| Path::new(f).is_absolute() || f.contains("..")) {
            return Err(RegistrationError::config(
                "required_files entries must be relative paths inside the data set",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;

    fn details() -> RegistrationDetails {
        RegistrationDetails::new("RAW")
    }

    #[test]
    fn test_store_copies_into_original_with_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staging/run1");
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join("a.csv"), b"1,2").unwrap();
        let code = DataSetCode::new("DS-1").unwrap();

        let stored = DefaultStorageProcessor::default()
            .store(&staged, &details(), &code, &dir.path().join("precommit"))
            .unwrap();

        assert_eq!(stored.path, dir.path().join("precommit/DS-1"));
        assert_eq!(stored.files.len(), 1);
        assert_eq!(stored.files[0].path, "original/run1/a.csv");
        assert!(staged.join("a.csv").exists());
    }

    #[test]
    fn test_missing_required_file_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("run1");
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join("a.csv"), b"1,2").unwrap();

        let notifier = Arc::new(MemoryNotifier::default());
        let mut properties = BTreeMap::new();
        properties.insert("required_files".to_string(), "a.csv, metadata.json".to_string());
        let processor = DefaultStorageProcessor::from_properties(&properties)
            .unwrap()
            .with_notifier(notifier.clone(), Some("ops@example.org".to_string()));

        let err = processor
            .store(&staged, &details(), &DataSetCode::new("DS-2").unwrap(), dir.path())
            .unwrap_err();
        assert_eq!(err.class(), dss_common::ErrorClass::Content);
        assert!(!dir.path().join("DS-2").exists());

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient.as_deref(), Some("ops@example.org"));
        assert!(sent[0].body.contains("metadata.json"));
        assert!(!sent[0].body.contains("a.csv,"));
    }

    #[test]
    fn test_empty_directory_is_rejected_unless_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("empty");
        std::fs::create_dir_all(&staged).unwrap();
        let code = DataSetCode::new("DS-3").unwrap();

        assert!(DefaultStorageProcessor::default()
            .store(&staged, &details(), &code, dir.path())
            .is_err());

        let mut properties = BTreeMap::new();
        properties.insert("allow_empty".to_string(), "true".to_string());
        assert!(DefaultStorageProcessor::from_properties(&properties)
            .unwrap()
            .store(&staged, &details(), &code, dir.path())
            .is_ok());
    }

    #[test]
    fn test_bad_properties() {
        let mut properties = BTreeMap::new();
        properties.insert("allow_empty".to_string(), "perhaps".to_string());
        assert!(DefaultStorageProcessor::from_properties(&properties).is_err());

        let mut properties = BTreeMap::new();
        properties.insert("required_files".to_string(), "../etc/passwd".to_string());
        let processor = DefaultStorageProcessor::from_properties(&properties).unwrap();
        assert!(processor.check().is_err());
    }
}
