//! Undo-action decision
//!
//! [`RollbackPolicy::decide`] is a pure lookup from the failure classification
//! and the progress the transaction had made to what happens to the original
//! incoming content. Deployments may override individual cells of the default
//! table, except the interruption rows: those always map to
//! [`UndoAction::None`] so crash recovery can finish the transaction.

use crate::error::{RegistrationError, Result};
use dss_common::ErrorClass;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What to do with the original incoming content after a rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndoAction {
    /// Leave it where it is
    None,
    Delete,
    MoveToError,
}

impl UndoAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            UndoAction::None => "none",
            UndoAction::Delete => "delete",
            UndoAction::MoveToError => "move_to_error",
        }
    }
}

impl std::str::FromStr for UndoAction {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "none" => Ok(UndoAction::None),
            "delete" => Ok(UndoAction::Delete),
            "move_to_error" => Ok(UndoAction::MoveToError),
            other => Err(RegistrationError::config(format!("unknown undo action '{}'", other))),
        }
    }
}

impl std::fmt::Display for UndoAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Furthest storage step a transaction completed before it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    Initial,
    Staged,
    Precommitted,
    Stored,
}

impl Progress {
    pub const ALL: [Progress; 4] = [
        Progress::Initial,
        Progress::Staged,
        Progress::Precommitted,
        Progress::Stored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Progress::Initial => "initial",
            Progress::Staged => "staged",
            Progress::Precommitted => "precommitted",
            Progress::Stored => "stored",
        }
    }
}

impl std::str::FromStr for Progress {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self> {
        Progress::ALL
            .into_iter()
            .find(|p| p.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| RegistrationError::config(format!("unknown progress state '{}'", s)))
    }
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision taken for one failed attempt; kept in the delivery outcome and
/// written to the registration log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoRecord {
    pub action: UndoAction,
    pub reason: String,
    pub classification: ErrorClass,
}

#[derive(Debug, Clone, Default)]
pub struct RollbackPolicy {
    overrides: HashMap<(ErrorClass, Progress), UndoAction>,
}

impl RollbackPolicy {
    /// Built-in row for a classification, identical for every progress state
    pub fn default_action(class: ErrorClass) -> UndoAction {
        match class {
            ErrorClass::Interruption => UndoAction::None,
            ErrorClass::Content => UndoAction::MoveToError,
            ErrorClass::Environment => UndoAction::None,
            ErrorClass::Configuration => UndoAction::MoveToError,
            ErrorClass::Secondary => UndoAction::None,
        }
    }

    /// Override one cell, or a whole row when `progress` is `None`
    pub fn with_override(
        mut self,
        class: ErrorClass,
        progress: Option<Progress>,
        action: UndoAction,
    ) -> Result<Self> {
        if class == ErrorClass::Interruption {
            return Err(RegistrationError::config(
                "the undo action for interruptions cannot be overridden",
            ));
        }
        match progress {
            Some(progress) => {
                self.overrides.insert((class, progress), action);
            },
            None => {
                for progress in Progress::ALL {
                    self.overrides.insert((class, progress), action);
                }
            },
        }
        Ok(self)
    }

    /// Parse `class@progress=action` entries separated by commas;
    /// `class@*` covers every progress state.
    ///
    /// ```
    /// use dss_registrator::policy::{Progress, RollbackPolicy, UndoAction};
    /// use dss_common::ErrorClass;
    ///
    /// let policy = RollbackPolicy::from_overrides("content@initial=delete").unwrap();
    /// assert_eq!(policy.decide(ErrorClass::Content, Progress::Initial), UndoAction::Delete);
    /// assert_eq!(policy.decide(ErrorClass::Content, Progress::Stored), UndoAction::MoveToError);
    /// ```
    pub fn from_overrides(overrides: &str) -> Result<Self> {
        let mut policy = Self::default();

        for entry in overrides.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (cell, action) = entry.split_once('=').ok_or_else(|| {
                RegistrationError::config(format!("override '{}' is missing '=<action>'", entry))
            })?;
            let (class, progress) = cell.split_once('@').ok_or_else(|| {
                RegistrationError::config(format!("override '{}' is missing '@<progress>'", entry))
            })?;

            let class: ErrorClass = class
                .parse()
                .map_err(|e: dss_common::DssError| RegistrationError::config(e.to_string()))?;
            let progress = match progress.trim() {
                "*" => None,
                other => Some(other.parse()?),
            };
            policy = policy.with_override(class, progress, action.parse()?)?;
        }

        Ok(policy)
    }

    pub fn decide(&self, class: ErrorClass, progress: Progress) -> UndoAction {
        self.overrides
            .get(&(class, progress))
            .copied()
            .unwrap_or_else(|| Self::default_action(class))
    }

    pub fn undo_record(&self, error: &RegistrationError, progress: Progress) -> UndoRecord {
        let classification = error.class();
        UndoRecord {
            action: self.decide(classification, progress),
            reason: error.to_string(),
            classification,
        }
    }
}
