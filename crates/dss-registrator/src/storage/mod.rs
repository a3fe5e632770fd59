//! Staged storage of one data set
//!
//! ```text
//! INITIAL ──stage──▶ STAGED ──precommit──▶ PRECOMMITTED ──store──▶ STORED
//!    └──────────────────┴──────────────────────┴────────────────────┴──▶ FAILED
//! ```
//!
//! Each step pushes its inverse onto the transaction's rollback stack before
//! touching the filesystem, so unwinding is done by the stack and `fail` only
//! records the outcome. Plain and container algorithms share the state
//! machine; only the step bodies differ.

pub mod processor;
pub mod strategy;

use crate::details::RegistrationDetails;
use crate::error::{RegistrationError, Result};
use crate::fs_ops;
use crate::registry::NewDataSet;
use crate::rollback::{RollbackCommand, RollbackStack};
use dss_common::types::{DataSetCode, FileMetadata};
use processor::StorageProcessor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub use strategy::StorageStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmState {
    Initial,
    Staged,
    Precommitted,
    Stored,
    Failed,
}

/// Directories one transaction stores through
#[derive(Debug, Clone)]
pub struct StoragePaths {
    /// The transaction's private staging workspace
    pub workspace: PathBuf,
    pub precommit: PathBuf,
    pub store: PathBuf,
}

#[derive(Debug)]
pub enum AlgorithmKind {
    Plain {
        source: PathBuf,
        staged: Option<PathBuf>,
        precommitted: Option<PathBuf>,
        files: Vec<FileMetadata>,
    },
    Container {
        children: Vec<StorageAlgorithm>,
    },
}

#[derive(Debug)]
pub struct StorageAlgorithm {
    code: DataSetCode,
    details: RegistrationDetails,
    strategy: StorageStrategy,
    state: AlgorithmState,
    stored: Option<PathBuf>,
    kind: AlgorithmKind,
}

impl StorageAlgorithm {
    /// Choose the variant from `details.is_container`.
    ///
    /// A container never has a file of its own and a plain data set always
    /// has one; anything else is rejected here rather than at storage time.
    pub fn create(
        code: DataSetCode,
        file: Option<&Path>,
        details: RegistrationDetails,
        strategy: StorageStrategy,
    ) -> Result<Self> {
        let kind = match (details.is_container, file) {
            (true, Some(file)) => {
                return Err(RegistrationError::invalid_argument(format!(
                    "A data set can contain files or other data sets, but not both (container {} was given '{}')",
                    code,
                    file.display()
                )))
            },
            (true, None) => AlgorithmKind::Container { children: Vec::new() },
            (false, Some(file)) => AlgorithmKind::Plain {
                source: file.to_path_buf(),
                staged: None,
                precommitted: None,
                files: Vec::new(),
            },
            (false, None) => {
                return Err(RegistrationError::invalid_argument(format!(
                    "Data set {} is not a container and needs a file",
                    code
                )))
            },
        };

        Ok(Self {
            code,
            details,
            strategy,
            state: AlgorithmState::Initial,
            stored: None,
            kind,
        })
    }

    pub fn code(&self) -> &DataSetCode {
        &self.code
    }

    pub fn details(&self) -> &RegistrationDetails {
        &self.details
    }

    pub fn strategy(&self) -> StorageStrategy {
        self.strategy
    }

    pub fn state(&self) -> AlgorithmState {
        self.state
    }

    pub fn is_container(&self) -> bool {
        matches!(self.kind, AlgorithmKind::Container { .. })
    }

    /// Source content; always `None` for containers
    pub fn source(&self) -> Option<&Path> {
        match &self.kind {
            AlgorithmKind::Plain { source, .. } => Some(source),
            AlgorithmKind::Container { .. } => None,
        }
    }

    pub fn children(&self) -> &[StorageAlgorithm] {
        match &self.kind {
            AlgorithmKind::Container { children } => children,
            AlgorithmKind::Plain { .. } => &[],
        }
    }

    /// Codes of the contained data sets, in creation order
    pub fn child_codes(&self) -> Vec<DataSetCode> {
        self.children().iter().map(|c| c.code.clone()).collect()
    }

    pub fn files(&self) -> &[FileMetadata] {
        match &self.kind {
            AlgorithmKind::Plain { files, .. } => files,
            AlgorithmKind::Container { .. } => &[],
        }
    }

    /// Final location once STORED; `None` for containers
    pub fn stored_path(&self) -> Option<&Path> {
        self.stored.as_deref()
    }

    pub fn add_child(&mut self, child: StorageAlgorithm) -> Result<()> {
        if self.state != AlgorithmState::Initial {
            return Err(RegistrationError::invalid_argument(format!(
                "Container {} has already been staged",
                self.code
            )));
        }
        match &mut self.kind {
            AlgorithmKind::Container { children } => {
                children.push(child);
                Ok(())
            },
            AlgorithmKind::Plain { .. } => Err(RegistrationError::invalid_argument(format!(
                "Data set {} is not a container",
                self.code
            ))),
        }
    }

    /// This algorithm or one of its descendants with the given code
    pub fn find_mut(&mut self, code: &DataSetCode) -> Option<&mut StorageAlgorithm> {
        if &self.code == code {
            return Some(self);
        }
        match &mut self.kind {
            AlgorithmKind::Container { children } => children.iter_mut().find_map(|c| c.find_mut(code)),
            AlgorithmKind::Plain { .. } => None,
        }
    }

    /// Every (strategy, owner) pair the registry must confirm before staging
    pub fn owner_checks(&self) -> Vec<(StorageStrategy, Option<String>)> {
        let mut checks = vec![(self.strategy, self.details.owner_identifier())];
        for child in self.children() {
            checks.extend(child.owner_checks());
        }
        checks
    }

    fn expect_state(&self, expected: AlgorithmState, step: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RegistrationError::invalid_argument(format!(
                "Cannot {} data set {} in state {:?}",
                step, self.code, self.state
            )))
        }
    }

    /// INITIAL → STAGED: move the source into the private workspace
    pub fn stage(&mut self, paths: &StoragePaths, stack: &mut RollbackStack) -> Result<()> {
        self.expect_state(AlgorithmState::Initial, "stage")?;

        match &mut self.kind {
            AlgorithmKind::Plain { source, staged, .. } => {
                if !source.exists() {
                    return Err(RegistrationError::invalid_content(format!(
                        "Content '{}' of data set {} does not exist",
                        source.display(),
                        self.code
                    )));
                }
                let dir = paths.workspace.join(self.code.as_str());
                stack.push(RollbackCommand::CreateDirectory { path: dir.clone() })?;
                fs_ops::create_dir_all(&dir)?;

                let target = dir.join(fs_ops::file_name(source)?);
                stack.push(RollbackCommand::MoveFile {
                    from: source.clone(),
                    to: target.clone(),
                })?;
                fs_ops::move_path(source, &target)?;
                *staged = Some(target);
            },
            AlgorithmKind::Container { children } => {
                for child in children.iter_mut() {
                    child.stage(paths, stack)?;
                }
            },
        }

        debug!(code = %self.code, "Staged");
        self.state = AlgorithmState::Staged;
        Ok(())
    }

    /// STAGED → PRECOMMITTED: run the storage processor
    pub fn precommit(
        &mut self,
        paths: &StoragePaths,
        processor: &dyn StorageProcessor,
        stack: &mut RollbackStack,
    ) -> Result<()> {
        self.expect_state(AlgorithmState::Staged, "precommit")?;

        match &mut self.kind {
            AlgorithmKind::Plain {
                staged,
                precommitted,
                files,
                ..
            } => {
                let staged = staged.as_ref().ok_or_else(|| {
                    RegistrationError::invalid_argument(format!("Data set {} has no staged content", self.code))
                })?;
                let expected = paths.precommit.join(self.code.as_str());
                stack.push(RollbackCommand::StorageProcessorStore { location: expected.clone() })?;

                let location = processor.store(staged, &self.details, &self.code, &paths.precommit)?;
                if location.path != expected {
                    return Err(RegistrationError::config(format!(
                        "Storage processor wrote data set {} to '{}' instead of '{}'",
                        self.code,
                        location.path.display(),
                        expected.display()
                    )));
                }
                *precommitted = Some(location.path);
                *files = location.files;
            },
            AlgorithmKind::Container { children } => {
                for child in children.iter_mut() {
                    child.precommit(paths, processor, stack)?;
                }
            },
        }

        debug!(code = %self.code, "Precommitted");
        self.state = AlgorithmState::Precommitted;
        Ok(())
    }

    /// PRECOMMITTED → STORED: rename into `<store>/<h0h1>/<h2h3>/<code>`.
    /// Shard directories created here are removed again on rollback.
    pub fn store(&mut self, paths: &StoragePaths, stack: &mut RollbackStack) -> Result<()> {
        self.expect_state(AlgorithmState::Precommitted, "store")?;

        match &mut self.kind {
            AlgorithmKind::Plain { precommitted, .. } => {
                let from = precommitted.as_ref().ok_or_else(|| {
                    RegistrationError::invalid_argument(format!("Data set {} has no precommitted content", self.code))
                })?;
                let target = paths.store.join(self.code.store_path());
                if target.exists() {
                    return Err(RegistrationError::io(
                        "Store location already taken",
                        &target,
                        std::io::Error::from(std::io::ErrorKind::AlreadyExists),
                    ));
                }
                // Outermost shard directory this step creates, if any
                let created_shard = target
                    .ancestors()
                    .skip(1)
                    .take_while(|p| *p != paths.store.as_path() && !p.exists())
                    .last()
                    .map(Path::to_path_buf);
                if let Some(shard) = created_shard {
                    stack.push(RollbackCommand::CreateDirectory { path: shard })?;
                }
                stack.push(RollbackCommand::MoveFile {
                    from: from.clone(),
                    to: target.clone(),
                })?;
                fs_ops::move_path(from, &target)?;
                self.stored = Some(target);
            },
            AlgorithmKind::Container { children } => {
                for child in children.iter_mut() {
                    child.store(paths, stack)?;
                }
            },
        }

        debug!(code = %self.code, "Stored");
        self.state = AlgorithmState::Stored;
        Ok(())
    }

    /// Mark this algorithm and its children FAILED
    pub fn fail(&mut self) {
        if let AlgorithmKind::Container { children } = &mut self.kind {
            for child in children.iter_mut() {
                child.fail();
            }
        }
        self.state = AlgorithmState::Failed;
    }

    /// Registry records for this data set, children before their container
    pub fn new_data_sets(&self) -> Vec<NewDataSet> {
        let mut data_sets: Vec<NewDataSet> = self
            .children()
            .iter()
            .flat_map(StorageAlgorithm::new_data_sets)
            .collect();

        let location = match &self.kind {
            AlgorithmKind::Plain { .. } => self.code.store_path().to_string_lossy().replace('\\', "/"),
            AlgorithmKind::Container { .. } => String::new(),
        };

        data_sets.push(NewDataSet {
            code: self.code.clone(),
            data_set_type: self.details.data_set_type.clone(),
            experiment: self.details.experiment.clone(),
            sample: self.details.sample.clone(),
            properties: self.details.properties.clone(),
            parent_codes: self.details.parent_codes.clone(),
            contained_codes: self.child_codes(),
            is_container: self.is_container(),
            location,
            files: self.files().to_vec(),
        });
        data_sets
    }

    /// Codes of this algorithm and all descendants
    pub fn all_codes(&self) -> Vec<DataSetCode> {
        let mut codes = vec![self.code.clone()];
        for child in self.children() {
            codes.extend(child.all_codes());
        }
        codes
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::processor::DefaultStorageProcessor;
    use crate::transaction::TransactionId;

    struct Fixture {
        _dir: tempfile::TempDir,
        incoming: PathBuf,
        paths: StoragePaths,
        stack: RollbackStack,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let incoming = dir.path().join("incoming");
        std::fs::create_dir_all(&incoming).unwrap();
        let staging = dir.path().join("staging");
        let id = TransactionId::new();
        let paths = StoragePaths {
            workspace: staging.join(id.to_string()),
            precommit: dir.path().join("precommit"),
            store: dir.path().join("store"),
        };
        let stack = RollbackStack::new(&staging, id);
        Fixture {
            _dir: dir,
            incoming,
            paths,
            stack,
        }
    }

    fn code(c: &str) -> DataSetCode {
        DataSetCode::new(c).unwrap()
    }

    #[test]
    fn test_container_with_file_is_rejected() {
        let err = StorageAlgorithm::create(
            code("C-1"),
            Some(Path::new("/incoming/x")),
            RegistrationDetails::new("T").container(),
            StorageStrategy::OwnerExists,
        )
        .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidArgument(_)));
        assert!(err.to_string().contains("not both"));

        assert!(StorageAlgorithm::create(
            code("P-1"),
            None,
            RegistrationDetails::new("T"),
            StorageStrategy::OwnerExists
        )
        .is_err());
    }

    #[test]
    fn test_plain_algorithm_walks_states_into_sharded_store() {
        let mut f = fixture();
        let file = f.incoming.join("data.txt");
        std::fs::write(&file, b"hello").unwrap();
        let mut alg = StorageAlgorithm::create(
            code("DS-1"),
            Some(&file),
            RegistrationDetails::new("RAW"),
            StorageStrategy::OwnerExists,
        )
        .unwrap();
        let processor = DefaultStorageProcessor::default();

        alg.stage(&f.paths, &mut f.stack).unwrap();
        assert_eq!(alg.state(), AlgorithmState::Staged);
        assert!(!file.exists());

        alg.precommit(&f.paths, &processor, &mut f.stack).unwrap();
        assert_eq!(alg.state(), AlgorithmState::Precommitted);
        assert_eq!(alg.files().len(), 1);

        alg.store(&f.paths, &mut f.stack).unwrap();
        assert_eq!(alg.state(), AlgorithmState::Stored);
        let stored = alg.stored_path().unwrap().to_path_buf();
        assert_eq!(stored, f.paths.store.join(code("DS-1").store_path()));
        assert_eq!(std::fs::read(stored.join("original/data.txt")).unwrap(), b"hello");

        // Unwinding through the stack restores the incoming file.
        f.stack.rollback(&processor).unwrap();
        alg.fail();
        assert_eq!(alg.state(), AlgorithmState::Failed);
        assert_eq!(std::fs::read(&file).unwrap(), b"hello");
        assert!(!stored.exists());
        assert_eq!(std::fs::read_dir(&f.paths.store).unwrap().count(), 0);
        assert!(!f.paths.precommit.join("DS-1").exists());
        assert!(!f.paths.workspace.join("DS-1").exists());
    }

    #[test]
    fn test_container_records_children_and_has_no_content() {
        let mut f = fixture();
        let mut container = StorageAlgorithm::create(
            code("C-1"),
            None,
            RegistrationDetails::new("HCS").container(),
            StorageStrategy::OwnerExists,
        )
        .unwrap();
        for name in ["thumb-a.png", "thumb-b.png"] {
            let file = f.incoming.join(name);
            std::fs::write(&file, name.as_bytes()).unwrap();
            let child = StorageAlgorithm::create(
                code(&format!("T-{}", &name[6..7])),
                Some(&file),
                RegistrationDetails::new("THUMB"),
                StorageStrategy::OwnerExists,
            )
            .unwrap();
            container.add_child(child).unwrap();
        }
        let processor = DefaultStorageProcessor::default();

        container.stage(&f.paths, &mut f.stack).unwrap();
        container.precommit(&f.paths, &processor, &mut f.stack).unwrap();
        container.store(&f.paths, &mut f.stack).unwrap();

        assert_eq!(container.child_codes(), vec![code("T-a"), code("T-b")]);
        assert!(container.stored_path().is_none());
        assert!(container.source().is_none());
        assert!(container.children().iter().all(|c| c.state() == AlgorithmState::Stored));

        let records = container.new_data_sets();
        assert_eq!(records.len(), 3);
        let last = records.last().unwrap();
        assert!(last.is_container);
        assert!(last.files.is_empty());
        assert_eq!(last.contained_codes, vec![code("T-a"), code("T-b")]);

        container.fail();
        assert!(container.children().iter().all(|c| c.state() == AlgorithmState::Failed));
    }

    #[test]
    fn test_steps_out_of_order_are_refused() {
        let mut f = fixture();
        let file = f.incoming.join("x");
        std::fs::write(&file, b"x").unwrap();
        let mut alg = StorageAlgorithm::create(
            code("DS-9"),
            Some(&file),
            RegistrationDetails::new("RAW"),
            StorageStrategy::OwnerExists,
        )
        .unwrap();
        assert!(alg.store(&f.paths, &mut f.stack).is_err());
        assert!(f.stack.is_empty());
    }
}
