//! Per-delivery registration log
//!
//! One JSON-lines file per delivery, written to `in-process/` while the
//! delivery runs and moved to `succeeded/` or `failed/` when it finishes.
//! The last line carries the outcome and every error the delivery hit.

use crate::error::{RegistrationError, Result};
use crate::fs_ops;
use crate::outcome::{EncounteredError, SecondaryFailure};
use chrono::Utc;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const IN_PROCESS_DIR: &str = "in-process";
pub const SUCCEEDED_DIR: &str = "succeeded";
pub const FAILED_DIR: &str = "failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Serialize)]
struct LogLine<'a> {
    timestamp: String,
    level: LogLevel,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<&'a [EncounteredError]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    secondary_errors: Option<&'a [SecondaryFailure]>,
}

#[derive(Debug)]
pub struct RegistrationLog {
    root: PathBuf,
    path: PathBuf,
    finished: bool,
}

impl RegistrationLog {
    /// Start a log for the delivery named `incoming_name` below `root`
    pub fn create(root: &Path, incoming_name: &str) -> Result<Self> {
        let dir = root.join(IN_PROCESS_DIR);
        fs_ops::create_dir_all(&dir)?;

        let file_name = format!("{}_{}.log", Utc::now().format("%Y-%m-%d_%H-%M-%S-%3f"), incoming_name);
        let path = dir.join(file_name);
        std::fs::File::create(&path).map_err(|e| RegistrationError::io("Failed to create registration log", &path, e))?;

        Ok(Self {
            root: root.to_path_buf(),
            path,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn info(&self, message: &str) -> Result<()> {
        self.append(LogLevel::Info, message, None, None, None)
    }

    pub fn warn(&self, message: &str) -> Result<()> {
        self.append(LogLevel::Warn, message, None, None, None)
    }

    pub fn error(&self, message: &str) -> Result<()> {
        self.append(LogLevel::Error, message, None, None, None)
    }

    fn append(
        &self,
        level: LogLevel,
        message: &str,
        outcome: Option<&str>,
        errors: Option<&[EncounteredError]>,
        secondary_errors: Option<&[SecondaryFailure]>,
    ) -> Result<()> {
        let line = LogLine {
            timestamp: Utc::now().to_rfc3339(),
            level,
            message,
            outcome,
            errors,
            secondary_errors,
        };
        let mut json = serde_json::to_string(&line).map_err(dss_common::DssError::from)?;
        json.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| RegistrationError::io("Failed to open registration log", &self.path, e))?;
        file.write_all(json.as_bytes())
            .map_err(|e| RegistrationError::io("Failed to write registration log", &self.path, e))
    }

    /// Write the outcome line and move the file out of `in-process/`.
    /// Later calls return the final path without writing anything.
    pub fn finish(
        &mut self,
        succeeded: bool,
        errors: &[EncounteredError],
        secondary_errors: &[SecondaryFailure],
    ) -> Result<PathBuf> {
        if self.finished {
            return Ok(self.path.clone());
        }

        let (level, outcome, dir) = if succeeded {
            (LogLevel::Info, "success", SUCCEEDED_DIR)
        } else {
            (LogLevel::Error, "failure", FAILED_DIR)
        };
        self.append(
            level,
            "Registration finished",
            Some(outcome),
            Some(errors),
            (!secondary_errors.is_empty()).then_some(secondary_errors),
        )?;

        let target = self.root.join(dir).join(fs_ops::file_name(&self.path)?);
        fs_ops::move_path(&self.path, &target)?;
        self.path = target;
        self.finished = true;
        Ok(self.path.clone())
    }
}
