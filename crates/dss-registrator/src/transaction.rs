//! Registration transactions
//!
//! A transaction is bound to one physical incoming path. It accumulates data
//! sets (as storage algorithms), experiments and samples, and file operations
//! inside a private staging workspace. Every filesystem step pushes its
//! inverse onto a persisted rollback stack first.
//!
//! `commit` drives the algorithms through stage, precommit and store, then
//! registers everything with the registry in one atomic call. Failure before
//! that call unwinds the stack. When the call itself fails the registry is
//! asked what became of the batch: a batch it applied is committed, one it
//! never saw is unwound, and anything undecided is left to recovery. The
//! transaction never decides what happens to the incoming content; it
//! reports to a [`TransactionListener`] and the registration service applies
//! the undo policy.

use crate::context::EngineContext;
use crate::details::{DetailsFactory, RegistrationDetails};
use crate::error::{RegistrationError, Result};
use crate::fs_ops;
use crate::hooks::HookKind;
use crate::outcome::SecondaryFailure;
use crate::policy::Progress;
use crate::registry::{EntityOperationService, EntityOperationsState, NewExperiment, NewSample};
use crate::rollback::{RollbackCommand, RollbackStack};
use crate::storage::{StorageAlgorithm, StorageStrategy};
use dss_common::types::DataSetCode;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

// ============================================================================
// Identity and status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Status never changes once it leaves `Open`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Open,
    Committed,
    RolledBack,
}

/// Receives the result of each transaction
pub trait TransactionListener {
    fn did_commit_transaction(&mut self, id: TransactionId, data_set_codes: &[DataSetCode]);

    fn did_rollback_transaction(&mut self, id: TransactionId, error: &RegistrationError, progress: Progress);

    /// The registry outcome is unknown; the transaction's stack stays on disk
    /// and recovery settles it. Nothing may touch the incoming content.
    fn did_defer_transaction(&mut self, id: TransactionId, error: &RegistrationError, progress: Progress);

    fn did_encounter_secondary_failure(&mut self, id: TransactionId, failure: SecondaryFailure);
}

// ============================================================================
// Transaction
// ============================================================================

pub struct Transaction {
    id: TransactionId,
    ctx: Arc<EngineContext>,
    incoming: PathBuf,
    working_dir: PathBuf,
    details_factory: Arc<dyn DetailsFactory>,
    stack: RollbackStack,
    algorithms: Vec<StorageAlgorithm>,
    experiments: Vec<NewExperiment>,
    samples: Vec<NewSample>,
    /// (origin, workspace entry) of every `move_file`
    moved_in: Vec<(PathBuf, PathBuf)>,
    status: TransactionStatus,
    progress: Progress,
    registration_undecided: bool,
    deferred_to_recovery: bool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("incoming", &self.incoming)
            .field("status", &self.status)
            .field("progress", &self.progress)
            .field("algorithms", &self.algorithms.len())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Open a transaction for `incoming`. Its working directory is the parent
    /// of `incoming`; relative paths handed to it resolve there.
    pub fn new(ctx: Arc<EngineContext>, incoming: impl Into<PathBuf>, details_factory: Arc<dyn DetailsFactory>) -> Self {
        let incoming = incoming.into();
        let working_dir = incoming
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| incoming.clone());
        let id = TransactionId::new();
        let stack = RollbackStack::new(&ctx.config.directories.staging, id);

        debug!(transaction_id = %id, incoming = %incoming.display(), "Opened transaction");

        Self {
            id,
            ctx,
            incoming,
            working_dir,
            details_factory,
            stack,
            algorithms: Vec::new(),
            experiments: Vec::new(),
            samples: Vec::new(),
            moved_in: Vec::new(),
            status: TransactionStatus::Open,
            progress: Progress::Initial,
            registration_undecided: false,
            deferred_to_recovery: false,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Furthest storage step reached by the last commit attempt
    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn incoming(&self) -> &Path {
        &self.incoming
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Private staging area of this transaction
    pub fn workspace(&self) -> PathBuf {
        self.ctx.workspace(self.id)
    }

    pub fn details_factory(&self) -> &Arc<dyn DetailsFactory> {
        &self.details_factory
    }

    pub fn algorithms(&self) -> &[StorageAlgorithm] {
        &self.algorithms
    }

    pub fn rollback_stack(&self) -> &RollbackStack {
        &self.stack
    }

    /// Codes of every data set in this transaction, contained ones included
    pub fn data_set_codes(&self) -> Vec<DataSetCode> {
        self.algorithms.iter().flat_map(StorageAlgorithm::all_codes).collect()
    }

    pub fn is_committed_or_rolled_back(&self) -> bool {
        self.status != TransactionStatus::Open
    }

    pub fn is_rolled_back(&self) -> bool {
        self.status == TransactionStatus::RolledBack
    }

    /// The registry outcome was unknown when this transaction failed; the
    /// persisted stack was left for startup recovery.
    pub fn is_deferred_to_recovery(&self) -> bool {
        self.deferred_to_recovery
    }

    fn ensure_open(&self) -> Result<()> {
        if self.status == TransactionStatus::Open {
            Ok(())
        } else {
            Err(RegistrationError::invalid_argument(format!(
                "Transaction {} is already {:?}",
                self.id, self.status
            )))
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }

    fn check_shutdown(&self, step: &str) -> Result<()> {
        if self.ctx.is_shutting_down() {
            Err(RegistrationError::interrupted(format!(
                "shutdown requested before {} of transaction {}",
                step, self.id
            )))
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------------
    // Data sets
    // ------------------------------------------------------------------------

    /// Whether `owner` is an experiment or sample created by this transaction
    pub fn creates_owner(&self, owner: &str) -> bool {
        self.experiments.iter().any(|e| e.identifier.to_string() == owner)
            || self.samples.iter().any(|s| s.identifier.to_string() == owner)
    }

    fn strategy_for(&self, details: &RegistrationDetails) -> StorageStrategy {
        match details.owner_identifier() {
            Some(owner) if self.creates_owner(&owner) => StorageStrategy::IdentifiedOwner,
            _ => StorageStrategy::OwnerExists,
        }
    }

    async fn new_algorithm(&self, details: RegistrationDetails, file: Option<&Path>) -> Result<StorageAlgorithm> {
        if let (true, Some(file)) = (details.is_container, file) {
            return Err(RegistrationError::invalid_argument(format!(
                "A data set can contain files or other data sets, but not both (container given '{}')",
                file.display()
            )));
        }
        let file = file.map(|f| self.resolve(f));
        let strategy = self.strategy_for(&details);
        let code = self.ctx.registry.create_data_set_code().await?;
        StorageAlgorithm::create(code, file.as_deref(), details, strategy)
    }

    /// New data set; a container when `details.is_container` is set, in which
    /// case `file` must be `None`.
    pub async fn create_new_data_set(
        &mut self,
        details: RegistrationDetails,
        file: Option<&Path>,
    ) -> Result<DataSetCode> {
        self.ensure_open()?;
        let algorithm = self.new_algorithm(details, file).await?;
        let code = algorithm.code().clone();
        info!(
            transaction_id = %self.id,
            code = %code,
            container = algorithm.is_container(),
            strategy = ?algorithm.strategy(),
            "Created data set"
        );
        self.algorithms.push(algorithm);
        Ok(code)
    }

    /// New plain data set from `file`, with details from the transaction's factory
    pub async fn create_new_data_set_from_file(&mut self, file: &Path) -> Result<DataSetCode> {
        let resolved = self.resolve(file);
        let details = self.details_factory.create_details(&resolved)?;
        self.create_new_data_set(details, Some(&resolved)).await
    }

    /// Attach a new data set to a container created earlier in this transaction
    pub async fn add_contained_data_set(
        &mut self,
        container: &DataSetCode,
        details: RegistrationDetails,
        file: &Path,
    ) -> Result<DataSetCode> {
        self.ensure_open()?;
        let known_container = self
            .algorithms
            .iter()
            .any(|a| a.code() == container && a.is_container());
        if !known_container {
            return Err(RegistrationError::invalid_argument(format!(
                "{} is not a container of transaction {}",
                container, self.id
            )));
        }

        let child = self.new_algorithm(details, Some(file)).await?;
        let code = child.code().clone();
        let parent = self
            .algorithms
            .iter_mut()
            .find_map(|a| a.find_mut(container))
            .ok_or_else(|| RegistrationError::invalid_argument(format!("Unknown container {}", container)))?;
        parent.add_child(child)?;

        debug!(transaction_id = %self.id, container = %container, code = %code, "Added contained data set");
        Ok(code)
    }

    /// Adopt an algorithm built outside the transaction
    pub fn add_data_set(&mut self, algorithm: StorageAlgorithm) -> Result<()> {
        self.ensure_open()?;
        if self.data_set_codes().contains(algorithm.code()) {
            return Err(RegistrationError::invalid_argument(format!(
                "Data set {} is already part of transaction {}",
                algorithm.code(),
                self.id
            )));
        }
        self.algorithms.push(algorithm);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------------

    pub fn create_new_experiment(&mut self, experiment: NewExperiment) -> Result<()> {
        self.ensure_open()?;
        if self.experiments.iter().any(|e| e.identifier == experiment.identifier) {
            return Err(RegistrationError::invalid_argument(format!(
                "Experiment {} is already created by this transaction",
                experiment.identifier
            )));
        }
        debug!(transaction_id = %self.id, experiment = %experiment.identifier, "Created experiment");
        self.experiments.push(experiment);
        Ok(())
    }

    pub fn create_new_sample(&mut self, sample: NewSample) -> Result<()> {
        self.ensure_open()?;
        if self.samples.iter().any(|s| s.identifier == sample.identifier) {
            return Err(RegistrationError::invalid_argument(format!(
                "Sample {} is already created by this transaction",
                sample.identifier
            )));
        }
        debug!(transaction_id = %self.id, sample = %sample.identifier, "Created sample");
        self.samples.push(sample);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Workspace file operations
    // ------------------------------------------------------------------------

    fn workspace_entry(&self, name: &str) -> Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.workspace().join(name)),
            _ => Err(RegistrationError::invalid_argument(format!(
                "'{}' must be a plain name inside the transaction workspace",
                name
            ))),
        }
    }

    fn ensure_workspace(&mut self) -> Result<PathBuf> {
        let workspace = self.workspace();
        if !workspace.exists() {
            self.stack.push(RollbackCommand::CreateDirectory { path: workspace.clone() })?;
            fs_ops::create_dir_all(&workspace)?;
        }
        Ok(workspace)
    }

    /// Move `source` into the workspace as `name`
    pub fn move_file(&mut self, source: &Path, name: &str) -> Result<PathBuf> {
        self.ensure_open()?;
        let source = self.resolve(source);
        let target = self.workspace_entry(name)?;
        if target.exists() {
            return Err(RegistrationError::invalid_argument(format!(
                "'{}' already exists in the workspace",
                name
            )));
        }
        self.ensure_workspace()?;
        self.stack.push(RollbackCommand::MoveFile {
            from: source.clone(),
            to: target.clone(),
        })?;
        fs_ops::move_path(&source, &target)?;
        self.moved_in.push((source, target.clone()));
        Ok(target)
    }

    /// Create an empty file in the workspace
    pub fn create_new_file(&mut self, name: &str) -> Result<PathBuf> {
        self.ensure_open()?;
        let path = self.workspace_entry(name)?;
        self.ensure_workspace()?;
        self.stack.push(RollbackCommand::CreateFile { path: path.clone() })?;
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| RegistrationError::io("Failed to create file", &path, e))?;
        Ok(path)
    }

    /// Create a directory in the workspace
    pub fn create_new_directory(&mut self, name: &str) -> Result<PathBuf> {
        self.ensure_open()?;
        let path = self.workspace_entry(name)?;
        self.ensure_workspace()?;
        self.stack.push(RollbackCommand::CreateDirectory { path: path.clone() })?;
        fs_ops::create_dir_all(&path)?;
        Ok(path)
    }

    // ------------------------------------------------------------------------
    // Commit / rollback
    // ------------------------------------------------------------------------

    fn hook_env(&self) -> Vec<(String, String)> {
        let codes: Vec<String> = self.data_set_codes().iter().map(ToString::to_string).collect();
        vec![
            ("DSS_TRANSACTION_ID".to_string(), self.id.to_string()),
            ("DSS_DATA_SET_CODES".to_string(), codes.join(",")),
            (
                "DSS_STORE_DIR".to_string(),
                self.ctx.config.directories.store.display().to_string(),
            ),
        ]
    }

    async fn run_storage(&mut self) -> Result<Vec<DataSetCode>> {
        self.check_shutdown("owner checks")?;
        let checks: Vec<_> = self.algorithms.iter().flat_map(StorageAlgorithm::owner_checks).collect();
        for (strategy, owner) in checks {
            strategy.verify_owner(owner.as_deref(), self.ctx.registry.as_ref()).await?;
        }

        let paths = self.ctx.storage_paths(self.id);
        if !self.algorithms.is_empty() {
            self.ensure_workspace()?;
        }

        self.check_shutdown("staging")?;
        for algorithm in &mut self.algorithms {
            algorithm.stage(&paths, &mut self.stack)?;
        }
        self.progress = Progress::Staged;

        self.check_shutdown("precommit")?;
        let processor = Arc::clone(&self.ctx.processor);
        for algorithm in &mut self.algorithms {
            algorithm.precommit(&paths, processor.as_ref(), &mut self.stack)?;
        }
        self.progress = Progress::Precommitted;

        self.check_shutdown("store")?;
        for algorithm in &mut self.algorithms {
            algorithm.store(&paths, &mut self.stack)?;
        }
        self.progress = Progress::Stored;

        self.ctx
            .hooks
            .run(HookKind::PreRegistration, &self.incoming, &self.hook_env())
            .await?;

        let operations = EntityOperationService::prepare(
            self.id.to_string(),
            &self.experiments,
            &self.samples,
            &self.algorithms,
        );
        if !operations.is_empty() {
            self.stack.push(RollbackCommand::RegistrationAttempted {
                registration_id: operations.registration_id.clone(),
            })?;
            let performed = EntityOperationService::new(self.ctx.registry.as_ref())
                .perform(&operations, &self.ctx.shutdown)
                .await;
            match performed {
                Ok(_) => {},
                Err(err) if err.is_interruption() => return Err(err),
                Err(err) => self.settle_failed_registration(&operations.registration_id, err).await?,
            }
        }

        Ok(self.data_set_codes())
    }

    /// The registration call failed, possibly after the registry applied the
    /// batch. Only a batch the registry never saw may be unwound.
    async fn settle_failed_registration(&mut self, registration_id: &str, err: RegistrationError) -> Result<()> {
        match self.ctx.registry.entity_operations_state(registration_id).await {
            Ok(EntityOperationsState::Succeeded) => {
                warn!(
                    transaction_id = %self.id,
                    registration_id,
                    error = %err,
                    "Registry answered with an error but applied the batch"
                );
                Ok(())
            },
            Ok(EntityOperationsState::NoOperation) => Err(err),
            Ok(EntityOperationsState::InProgress) => {
                warn!(transaction_id = %self.id, registration_id, error = %err, "Registration still in progress");
                self.registration_undecided = true;
                Err(err)
            },
            Err(state_err) => {
                warn!(
                    transaction_id = %self.id,
                    registration_id,
                    error = %err,
                    state_error = %state_err,
                    "Cannot tell whether the registration went through"
                );
                self.registration_undecided = true;
                Err(err)
            },
        }
    }

    /// Commit and report the result to `listener`. A no-op once the
    /// transaction has left `Open`.
    pub async fn commit(&mut self, listener: &mut (dyn TransactionListener + Send)) -> TransactionStatus {
        if self.is_committed_or_rolled_back() {
            return self.status;
        }

        match self.run_storage().await {
            Ok(codes) => {
                self.status = TransactionStatus::Committed;
                info!(transaction_id = %self.id, data_sets = codes.len(), "Transaction committed");
                listener.did_commit_transaction(self.id, &codes);

                if let Err(err) = self.finish_committed() {
                    listener.did_encounter_secondary_failure(
                        self.id,
                        SecondaryFailure {
                            description: "Cleaning the transaction workspace".to_string(),
                            message: err.to_string(),
                        },
                    );
                }

                if let Err(err) = self
                    .ctx
                    .hooks
                    .run(HookKind::PostRegistration, &self.incoming, &self.hook_env())
                    .await
                {
                    warn!(transaction_id = %self.id, error = %err, "Post-registration script failed");
                    listener.did_encounter_secondary_failure(
                        self.id,
                        SecondaryFailure {
                            description: format!("{} script", HookKind::PostRegistration),
                            message: err.to_string(),
                        },
                    );
                }
            },
            Err(err) => {
                self.fail(&err);
                if self.deferred_to_recovery {
                    listener.did_defer_transaction(self.id, &err, self.progress);
                } else {
                    listener.did_rollback_transaction(self.id, &err, self.progress);
                }
            },
        }

        self.status
    }

    /// Return moved-in content that no data set consumed, remove the
    /// workspace, then forget the stack
    fn finish_committed(&mut self) -> Result<()> {
        for (origin, entry) in self.moved_in.iter().rev() {
            if holds_content(entry) && !origin.exists() {
                fs_ops::move_path(entry, origin)?;
                warn!(
                    transaction_id = %self.id,
                    path = %origin.display(),
                    "Content was not registered by the transaction, returned it"
                );
            }
        }
        fs_ops::remove_path(&self.workspace())?;
        self.stack.discard()
    }

    fn fail(&mut self, err: &RegistrationError) {
        let undecided = self.registration_undecided || err.is_interruption();
        if undecided && self.stack.registration_attempt().is_some() {
            warn!(
                transaction_id = %self.id,
                stack = %self.stack.path().display(),
                error = %err,
                "Registration outcome unknown, leaving rollback to recovery"
            );
            self.deferred_to_recovery = true;
            self.mark_rolled_back();
            return;
        }

        warn!(transaction_id = %self.id, error = %err, progress = %self.progress, "Transaction failed, rolling back");
        if let Err(rollback_err) = self.rollback() {
            error!(
                transaction_id = %self.id,
                error = %rollback_err,
                "Rollback failed; the persisted stack will be replayed on the next start"
            );
        }
    }

    fn mark_rolled_back(&mut self) {
        for algorithm in &mut self.algorithms {
            algorithm.fail();
        }
        self.status = TransactionStatus::RolledBack;
    }

    /// Replay the rollback stack. Idempotent; the transaction ends up rolled
    /// back even when replaying fails, with the remaining entries kept on disk.
    pub fn rollback(&mut self) -> Result<()> {
        if self.is_committed_or_rolled_back() {
            return Ok(());
        }
        self.mark_rolled_back();

        let undone = self.stack.rollback(self.ctx.processor.as_ref())?;
        info!(transaction_id = %self.id, undone, "Transaction rolled back");
        Ok(())
    }
}

/// A file, or a directory with at least one file below it
fn holds_content(path: &Path) -> bool {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| e.file_type().is_file())
}
