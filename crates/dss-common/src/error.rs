//! Error types shared by the DSS crates

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for DSS common operations
pub type Result<T> = std::result::Result<T, DssError>;

/// Classification every registration failure is reduced to before an undo
/// decision is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed or missing settings; fatal to the attempt, never retried
    Configuration,
    /// Transient infrastructure problem (filesystem, registry unreachable)
    Environment,
    /// The delivered content itself is invalid
    Content,
    /// The process is shutting down
    Interruption,
    /// A side effect outside the filesystem and the registry failed
    Secondary,
}

impl ErrorClass {
    /// All classifications, in declaration order.
    pub const ALL: [ErrorClass; 5] = [
        ErrorClass::Configuration,
        ErrorClass::Environment,
        ErrorClass::Content,
        ErrorClass::Interruption,
        ErrorClass::Secondary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Configuration => "configuration",
            ErrorClass::Environment => "environment",
            ErrorClass::Content => "content",
            ErrorClass::Interruption => "interruption",
            ErrorClass::Secondary => "secondary",
        }
    }

    /// Whether re-delivering the same content may succeed later.
    pub fn is_retry_eligible(&self) -> bool {
        matches!(self, ErrorClass::Environment)
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = DssError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "configuration" | "config" => Ok(ErrorClass::Configuration),
            "environment" | "env" => Ok(ErrorClass::Environment),
            "content" | "user" => Ok(ErrorClass::Content),
            "interruption" | "interrupted" => Ok(ErrorClass::Interruption),
            "secondary" => Ok(ErrorClass::Secondary),
            other => Err(DssError::Parse(format!("unknown error classification '{}'", other))),
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for DSS common utilities
#[derive(Error, Debug)]
pub enum DssError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid data set code: {0}")]
    InvalidCode(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl DssError {
    /// Classification used when this error aborts a registration.
    pub fn class(&self) -> ErrorClass {
        match self {
            DssError::Io(_) => ErrorClass::Environment,
            DssError::Serialization(_) => ErrorClass::Environment,
            DssError::ChecksumMismatch { .. } => ErrorClass::Content,
            DssError::InvalidCode(_) | DssError::InvalidIdentifier(_) => ErrorClass::Content,
            DssError::Config(_) | DssError::Parse(_) => ErrorClass::Configuration,
        }
    }
}
