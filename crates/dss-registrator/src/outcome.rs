//! What a delivery produced

use crate::error::RegistrationError;
use crate::policy::UndoRecord;
use crate::transaction::{TransactionId, TransactionStatus};
use dss_common::types::DataSetCode;
use dss_common::ErrorClass;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// An error that counted against the delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncounteredError {
    pub classification: ErrorClass,
    pub message: String,
}

impl From<&RegistrationError> for EncounteredError {
    fn from(err: &RegistrationError) -> Self {
        Self {
            classification: err.class(),
            message: err.to_string(),
        }
    }
}

/// A failure after content was already stored and registered. Reported but
/// never undone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryFailure {
    pub description: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReport {
    pub id: TransactionId,
    pub status: TransactionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub succeeded: bool,
    pub errors: Vec<EncounteredError>,
    pub secondary_errors: Vec<SecondaryFailure>,
    pub undo_records: Vec<UndoRecord>,
    pub data_set_codes: Vec<DataSetCode>,
    pub transactions: Vec<TransactionReport>,
    /// Registration was cut short by shutdown
    pub interrupted: bool,
    /// A transaction was left for recovery because its registry outcome was
    /// unknown
    #[serde(default)]
    pub recovery_pending: bool,
    /// Final location of the registration log file
    pub log_file: Option<PathBuf>,
}

impl DeliveryOutcome {
    pub fn outcome_label(&self) -> &'static str {
        if self.succeeded {
            "success"
        } else {
            "failure"
        }
    }
}
