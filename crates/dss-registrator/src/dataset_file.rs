use std::path::{Path, PathBuf};

/// One delivery as seen by the engine.
///
/// The logical path is where the delivery appeared in the drop box; the real
/// path is the content the engine works on. Callers that register a copy of
/// a delivery pass both, everything else uses [`DataSetFile::direct`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSetFile {
    logical_incoming_path: PathBuf,
    real_incoming_path: PathBuf,
}

impl DataSetFile {
    pub fn new(logical_incoming_path: impl Into<PathBuf>, real_incoming_path: impl Into<PathBuf>) -> Self {
        Self {
            logical_incoming_path: logical_incoming_path.into(),
            real_incoming_path: real_incoming_path.into(),
        }
    }

    /// Delivery without marker indirection
    pub fn direct(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::new(path.clone(), path)
    }

    pub fn logical_incoming_path(&self) -> &Path {
        &self.logical_incoming_path
    }

    pub fn real_incoming_path(&self) -> &Path {
        &self.real_incoming_path
    }

    /// File name of the real content, used to name logs and error entries
    pub fn name(&self) -> String {
        self.real_incoming_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
