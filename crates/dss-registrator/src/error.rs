//! Error types for the registration engine
//!
//! Every failure that can abort a registration carries an [`ErrorClass`];
//! the rollback policy looks the class up to decide what happens to the
//! incoming content.

use dss_common::{DssError, ErrorClass};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for registration operations
pub type Result<T> = std::result::Result<T, RegistrationError>;

#[derive(Error, Debug)]
pub enum RegistrationError {
    /// Filesystem operation failed
    #[error("{context} '{}': {source}", path.display())]
    Io {
        context: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration is missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// A caller passed an impossible combination of arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The delivered content cannot be registered as is
    #[error("Invalid content: {0}")]
    InvalidContent(String),

    /// The owner named by the registration details is not known to the registry
    #[error("Owner '{0}' does not exist in the registry")]
    OwnerNotFound(String),

    /// The registry was unreachable or answered with a server error
    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// The registry rejected the request
    #[error("Registry rejected the request: {0}")]
    RegistryRejected(String),

    /// An external hook script failed
    #[error("{hook} script failed: {message}")]
    Hook { hook: String, message: String },

    /// The engine is shutting down
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// A persisted rollback stack cannot be read back
    #[error("Corrupt rollback stack '{}': {message}", path.display())]
    CorruptRollbackStack { path: PathBuf, message: String },

    #[error(transparent)]
    Common(#[from] DssError),
}

impl RegistrationError {
    /// Wrap an IO error with the operation and path it concerns
    pub fn io(context: impl Into<String>, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn invalid_content(msg: impl Into<String>) -> Self {
        Self::InvalidContent(msg.into())
    }

    pub fn interrupted(msg: impl Into<String>) -> Self {
        Self::Interrupted(msg.into())
    }

    pub fn hook(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook {
            hook: hook.into(),
            message: message.into(),
        }
    }

    /// Classification that drives the undo decision
    pub fn class(&self) -> ErrorClass {
        match self {
            RegistrationError::Io { .. } => ErrorClass::Environment,
            RegistrationError::Config(_) => ErrorClass::Configuration,
            RegistrationError::InvalidArgument(_) => ErrorClass::Configuration,
            RegistrationError::InvalidContent(_) => ErrorClass::Content,
            RegistrationError::OwnerNotFound(_) => ErrorClass::Content,
            RegistrationError::RegistryUnavailable(_) => ErrorClass::Environment,
            RegistrationError::RegistryRejected(_) => ErrorClass::Content,
            RegistrationError::Hook { .. } => ErrorClass::Secondary,
            RegistrationError::Interrupted(_) => ErrorClass::Interruption,
            RegistrationError::CorruptRollbackStack { .. } => ErrorClass::Configuration,
            RegistrationError::Common(e) => e.class(),
        }
    }

    pub fn is_interruption(&self) -> bool {
        self.class() == ErrorClass::Interruption
    }
}

impl From<reqwest::Error> for RegistrationError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.is_client_error() => {
                RegistrationError::RegistryRejected(err.to_string())
            },
            _ => RegistrationError::RegistryUnavailable(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            RegistrationError::io("Failed to move", "/tmp/x", std::io::Error::other("boom")).class(),
            ErrorClass::Environment
        );
        assert_eq!(RegistrationError::OwnerNotFound("/S/P/E".into()).class(), ErrorClass::Content);
        assert_eq!(RegistrationError::hook("post-registration", "exit 1").class(), ErrorClass::Secondary);
        assert!(RegistrationError::interrupted("ctrl-c").is_interruption());
        assert_eq!(
            RegistrationError::from(DssError::InvalidCode("".into())).class(),
            ErrorClass::Content
        );
    }

    #[test]
    fn test_io_message_names_path() {
        let err = RegistrationError::io(
            "Failed to create directory",
            "/data/staging",
            std::io::Error::other("denied"),
        );
        assert_eq!(err.to_string(), "Failed to create directory '/data/staging': denied");
    }
}
