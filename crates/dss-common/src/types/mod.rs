//! Common types used across DSS

use crate::checksum::sha256_hex;
use crate::error::DssError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Registry-assigned data set code, e.g. `20240118093012345-42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataSetCode(String);

impl DataSetCode {
    pub fn new(code: impl Into<String>) -> Result<Self, DssError> {
        let code = code.into();
        let valid = !code.is_empty()
            && code
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !code.starts_with('.');
        if valid {
            Ok(Self(code))
        } else {
            Err(DssError::InvalidCode(code))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Location of this code below a store root: `<h0h1>/<h2h3>/<code>`
    /// where `h` is the hex SHA-256 of the code.
    pub fn store_path(&self) -> PathBuf {
        let digest = sha256_hex(&self.0);
        PathBuf::from(&digest[0..2]).join(&digest[2..4]).join(&self.0)
    }
}

impl TryFrom<String> for DataSetCode {
    type Error = DssError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DataSetCode> for String {
    fn from(code: DataSetCode) -> Self {
        code.0
    }
}

impl std::fmt::Display for DataSetCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn valid_code_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn segments(identifier: &str, expected: usize) -> Result<Vec<String>, DssError> {
    let rest = identifier
        .strip_prefix('/')
        .ok_or_else(|| DssError::InvalidIdentifier(identifier.to_string()))?;
    let parts: Vec<String> = rest.split('/').map(|p| p.to_uppercase()).collect();
    if parts.len() != expected || !parts.iter().all(|p| valid_code_segment(p)) {
        return Err(DssError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(parts)
}

/// `/SPACE/PROJECT/EXPERIMENT`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExperimentIdentifier {
    pub space: String,
    pub project: String,
    pub code: String,
}

impl ExperimentIdentifier {
    pub fn new(space: &str, project: &str, code: &str) -> Result<Self, DssError> {
        format!("/{}/{}/{}", space, project, code).parse()
    }
}

impl std::str::FromStr for ExperimentIdentifier {
    type Err = DssError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = segments(s.trim(), 3)?.into_iter();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(space), Some(project), Some(code)) => Ok(Self { space, project, code }),
            _ => Err(DssError::InvalidIdentifier(s.to_string())),
        }
    }
}

impl std::fmt::Display for ExperimentIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}/{}/{}", self.space, self.project, self.code)
    }
}

/// `/SPACE/SAMPLE`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleIdentifier {
    pub space: String,
    pub code: String,
}

impl SampleIdentifier {
    pub fn new(space: &str, code: &str) -> Result<Self, DssError> {
        format!("/{}/{}", space, code).parse()
    }
}

impl std::str::FromStr for SampleIdentifier {
    type Err = DssError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = segments(s.trim(), 2)?.into_iter();
        match (parts.next(), parts.next()) {
            (Some(space), Some(code)) => Ok(Self { space, code }),
            _ => Err(DssError::InvalidIdentifier(s.to_string())),
        }
    }
}

impl std::fmt::Display for SampleIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}/{}", self.space, self.code)
    }
}

/// Metadata for one stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Path relative to the data set root, `/`-separated
    pub path: String,
    /// Hex SHA-256
    pub checksum: String,
    pub size: u64,
}
