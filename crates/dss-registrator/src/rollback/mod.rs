//! Persisted rollback stack
//!
//! Each transaction records the inverse of every filesystem step *before*
//! performing the step. Entries are plain data and are appended to
//! `<staging>/.rollback-stacks/<transaction-id>.jsonl`, so a crashed process
//! leaves behind everything the next start needs to unwind it.
//!
//! Rolling back replays the entries in LIFO order. Every inverse tolerates
//! having already been applied, and the file is rewritten after each step,
//! so an interrupted rollback can simply be run again.

pub mod undo;

use crate::error::{RegistrationError, Result};
use crate::fs_ops;
use crate::storage::processor::StorageProcessor;
use crate::transaction::TransactionId;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub use undo::UndoExecutor;

/// Directory below the staging root holding the persisted stacks
pub const STACKS_DIR_NAME: &str = ".rollback-stacks";

const STACK_FILE_EXTENSION: &str = "jsonl";

/// Inverse of one step a transaction performed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RollbackCommand {
    /// A directory was created; undo deletes it
    CreateDirectory { path: PathBuf },
    /// A file was created; undo deletes it
    CreateFile { path: PathBuf },
    /// Content moved from `from` to `to`; undo moves it back
    MoveFile { from: PathBuf, to: PathBuf },
    /// The storage processor wrote `location`; undo asks it to unstore
    StorageProcessorStore { location: PathBuf },
    /// The registry call with this id was about to be made
    RegistrationAttempted { registration_id: String },
}

impl RollbackCommand {
    /// Apply the inverse. Safe to call again after a partial or complete run.
    pub fn undo(&self, processor: &dyn StorageProcessor) -> Result<()> {
        match self {
            RollbackCommand::CreateDirectory { path } | RollbackCommand::CreateFile { path } => {
                fs_ops::remove_path(path)
            },
            RollbackCommand::MoveFile { from, to } => {
                if to.exists() {
                    if from.exists() {
                        // Already moved back by an earlier, interrupted run.
                        warn!(from = %from.display(), to = %to.display(), "Both ends of a move exist, keeping source");
                        return Ok(());
                    }
                    fs_ops::move_path(to, from)
                } else {
                    Ok(())
                }
            },
            RollbackCommand::StorageProcessorStore { location } => processor.unstore(location),
            RollbackCommand::RegistrationAttempted { .. } => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub transaction_id: TransactionId,
    pub sequence: u64,
    #[serde(flatten)]
    pub command: RollbackCommand,
}

#[derive(Debug)]
pub struct RollbackStack {
    transaction_id: TransactionId,
    path: PathBuf,
    entries: Vec<RollbackEntry>,
    next_sequence: u64,
}

impl RollbackStack {
    pub fn stacks_dir(staging_root: &Path) -> PathBuf {
        staging_root.join(STACKS_DIR_NAME)
    }

    /// Empty stack; nothing is written until the first push
    pub fn new(staging_root: &Path, transaction_id: TransactionId) -> Self {
        let path = Self::stacks_dir(staging_root)
            .join(format!("{}.{}", transaction_id, STACK_FILE_EXTENSION));
        Self {
            transaction_id,
            path,
            entries: Vec::new(),
            next_sequence: 0,
        }
    }

    /// Read a stack left behind by an earlier process
    pub fn load(path: &Path) -> Result<Self> {
        let corrupt = |message: String| RegistrationError::CorruptRollbackStack {
            path: path.to_path_buf(),
            message,
        };

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| corrupt("missing file name".to_string()))?;
        let transaction_id: TransactionId = stem
            .parse()
            .map_err(|_| corrupt(format!("'{}' is not a transaction id", stem)))?;

        let content = std::fs::read_to_string(path)
            .map_err(|e| RegistrationError::io("Failed to read rollback stack", path, e))?;

        let mut entries = Vec::new();
        for (line_no, line) in content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
            let entry: RollbackEntry = serde_json::from_str(line)
                .map_err(|e| corrupt(format!("line {}: {}", line_no + 1, e)))?;
            if entry.transaction_id != transaction_id {
                return Err(corrupt(format!(
                    "line {} belongs to transaction {}",
                    line_no + 1,
                    entry.transaction_id
                )));
            }
            entries.push(entry);
        }

        let next_sequence = entries.last().map(|e| e.sequence + 1).unwrap_or(0);
        Ok(Self {
            transaction_id,
            path: path.to_path_buf(),
            entries,
            next_sequence,
        })
    }

    /// All persisted stack files below a staging root, oldest first
    pub fn list_persisted(staging_root: &Path) -> Result<Vec<PathBuf>> {
        let dir = Self::stacks_dir(staging_root);
        let read_dir = match std::fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RegistrationError::io("Failed to list rollback stacks", &dir, e)),
        };

        let mut stacks = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| RegistrationError::io("Failed to list rollback stacks", &dir, e))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == STACK_FILE_EXTENSION) {
                let modified = entry.metadata().and_then(|m| m.modified()).ok();
                stacks.push((modified, path));
            }
        }
        stacks.sort();

        Ok(stacks.into_iter().map(|(_, p)| p).collect())
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[RollbackEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registration id of the remote call this transaction attempted, if any
    pub fn registration_attempt(&self) -> Option<&str> {
        self.entries.iter().rev().find_map(|e| match &e.command {
            RollbackCommand::RegistrationAttempted { registration_id } => Some(registration_id.as_str()),
            _ => None,
        })
    }

    /// Persist an entry. Callers push before performing the step it undoes.
    pub fn push(&mut self, command: RollbackCommand) -> Result<()> {
        let entry = RollbackEntry {
            transaction_id: self.transaction_id,
            sequence: self.next_sequence,
            command,
        };

        if let Some(parent) = self.path.parent() {
            fs_ops::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(&entry).map_err(dss_common::DssError::from)?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| RegistrationError::io("Failed to open rollback stack", &self.path, e))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| RegistrationError::io("Failed to write rollback stack", &self.path, e))?;

        debug!(transaction_id = %self.transaction_id, sequence = entry.sequence, command = ?entry.command, "Pushed rollback entry");
        self.entries.push(entry);
        self.next_sequence += 1;
        Ok(())
    }

    /// Undo every entry, newest first. Returns how many entries were undone.
    ///
    /// On failure the failing entry and everything below it stay on the stack
    /// (and on disk).
    pub fn rollback(&mut self, processor: &dyn StorageProcessor) -> Result<usize> {
        let mut undone = 0;

        while let Some(entry) = self.entries.last() {
            entry.command.undo(processor)?;
            debug!(transaction_id = %self.transaction_id, sequence = entry.sequence, "Undid rollback entry");
            self.entries.pop();
            self.persist()?;
            undone += 1;
        }

        self.discard()?;
        Ok(undone)
    }

    /// Forget the stack and delete its file
    pub fn discard(&mut self) -> Result<()> {
        self.entries.clear();
        fs_ops::remove_path(&self.path)
    }

    fn persist(&self) -> Result<()> {
        if self.entries.is_empty() {
            return fs_ops::remove_path(&self.path);
        }

        let mut content = String::new();
        for entry in &self.entries {
            content.push_str(&serde_json::to_string(entry).map_err(dss_common::DssError::from)?);
            content.push('\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| RegistrationError::io("Failed to write rollback stack", &tmp, e))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| RegistrationError::io("Failed to replace rollback stack", &self.path, e))
    }
}
