//! Per-delivery registration service
//!
//! Owns every transaction opened for one delivery and the ledger their
//! results are reported to. The service alone decides whether the delivery
//! succeeded. It applies the undo policy to the incoming content when a
//! transaction rolls back, writes the registration log, and fires the
//! clean-up action exactly once.

use crate::context::EngineContext;
use crate::dataset_file::DataSetFile;
use crate::details::{DetailsFactory, RegistrationDetails};
use crate::error::{RegistrationError, Result};
use crate::outcome::{DeliveryOutcome, EncounteredError, SecondaryFailure, TransactionReport};
use crate::policy::{Progress, UndoRecord};
use crate::registration_log::RegistrationLog;
use crate::rollback::UndoExecutor;
use crate::storage::{StorageAlgorithm, StorageStrategy};
use crate::transaction::{Transaction, TransactionId, TransactionListener};
use dss_common::types::DataSetCode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Runs once per delivery with `true` when the delivery succeeded
pub type CleanAction = Box<dyn FnOnce(bool) + Send>;

/// Accumulates what the transactions of one delivery report
struct RegistrationLedger {
    ctx: Arc<EngineContext>,
    incoming: PathBuf,
    errors: Vec<EncounteredError>,
    secondary_errors: Vec<SecondaryFailure>,
    undo_records: Vec<UndoRecord>,
    data_set_codes: Vec<DataSetCode>,
    any_rolled_back: bool,
    interrupted: bool,
    recovery_pending: bool,
    log: Option<RegistrationLog>,
}

impl RegistrationLedger {
    fn log_info(&self, message: &str) {
        if let Some(log) = &self.log {
            if let Err(err) = log.info(message) {
                warn!(error = %err, "Failed to write registration log");
            }
        }
    }

    fn log_warn(&self, message: &str) {
        if let Some(log) = &self.log {
            if let Err(err) = log.warn(message) {
                warn!(error = %err, "Failed to write registration log");
            }
        }
    }

    fn log_error(&self, message: &str) {
        if let Some(log) = &self.log {
            if let Err(err) = log.error(message) {
                warn!(error = %err, "Failed to write registration log");
            }
        }
    }

    fn record_error(&mut self, err: &RegistrationError) {
        self.log_error(&format!("[{}] {}", err.class(), err));
        if err.is_interruption() {
            self.interrupted = true;
        }
        self.errors.push(EncounteredError::from(err));
    }

    /// Resolve the incoming content as the policy says. Interruptions leave
    /// it untouched so it can be picked up again.
    fn apply_undo(&mut self, err: &RegistrationError, progress: Progress) {
        if err.is_interruption() {
            return;
        }

        let record = self.ctx.policy.undo_record(err, progress);
        let executor = UndoExecutor::new(&self.ctx.config.directories.error);
        match executor.apply(&record, &self.incoming) {
            Ok(Some(target)) => {
                self.log_info(&format!("Moved {} to {}", self.incoming.display(), target.display()))
            },
            Ok(None) => {},
            Err(undo_err) => {
                error!(incoming = %self.incoming.display(), error = %undo_err, "Failed to apply undo action");
                self.record_error(&undo_err);
            },
        }
        self.undo_records.push(record);
    }
}

impl TransactionListener for RegistrationLedger {
    fn did_commit_transaction(&mut self, id: TransactionId, data_set_codes: &[DataSetCode]) {
        let codes: Vec<String> = data_set_codes.iter().map(ToString::to_string).collect();
        self.log_info(&format!("Transaction {} registered data sets [{}]", id, codes.join(", ")));
        self.data_set_codes.extend_from_slice(data_set_codes);
    }

    fn did_rollback_transaction(&mut self, id: TransactionId, error: &RegistrationError, progress: Progress) {
        self.any_rolled_back = true;
        self.log_warn(&format!("Transaction {} rolled back at {}", id, progress));
        self.record_error(error);
        self.apply_undo(error, progress);
    }

    fn did_defer_transaction(&mut self, id: TransactionId, error: &RegistrationError, progress: Progress) {
        self.any_rolled_back = true;
        self.recovery_pending = true;
        self.log_warn(&format!("Transaction {} left for recovery at {}", id, progress));
        self.record_error(error);
    }

    fn did_encounter_secondary_failure(&mut self, id: TransactionId, failure: SecondaryFailure) {
        warn!(transaction_id = %id, description = %failure.description, error = %failure.message, "Secondary failure");
        self.log_warn(&format!("{} failed: {}", failure.description, failure.message));
        self.secondary_errors.push(failure);
    }
}

pub struct RegistrationService {
    ctx: Arc<EngineContext>,
    file: DataSetFile,
    transactions: Vec<Transaction>,
    ledger: RegistrationLedger,
    clean_action: Option<CleanAction>,
    clean_action_executed: bool,
    succeeded: Option<bool>,
}

impl RegistrationService {
    pub fn new(ctx: Arc<EngineContext>, file: DataSetFile, clean_action: CleanAction) -> Self {
        let log = match RegistrationLog::create(&ctx.config.directories.registration_log, &file.name()) {
            Ok(log) => Some(log),
            Err(err) => {
                warn!(incoming = %file.real_incoming_path().display(), error = %err, "Registration log unavailable");
                None
            },
        };

        let ledger = RegistrationLedger {
            ctx: Arc::clone(&ctx),
            incoming: file.real_incoming_path().to_path_buf(),
            errors: Vec::new(),
            secondary_errors: Vec::new(),
            undo_records: Vec::new(),
            data_set_codes: Vec::new(),
            any_rolled_back: false,
            interrupted: false,
            recovery_pending: false,
            log,
        };
        ledger.log_info(&format!("Start registering {}", file.real_incoming_path().display()));

        Self {
            ctx,
            file,
            transactions: Vec::new(),
            ledger,
            clean_action: Some(clean_action),
            clean_action_executed: false,
            succeeded: None,
        }
    }

    pub fn data_set_file(&self) -> &DataSetFile {
        &self.file
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Open a transaction for `file` (default: the delivery's logical path),
    /// building details with `factory` (default: the engine's factory)
    pub fn transaction(
        &mut self,
        file: Option<&Path>,
        factory: Option<Arc<dyn DetailsFactory>>,
    ) -> Result<TransactionId> {
        if self.succeeded.is_some() {
            return Err(RegistrationError::invalid_argument(
                "The registration service has already finished",
            ));
        }

        let file = file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.file.logical_incoming_path().to_path_buf());
        let factory = factory.unwrap_or_else(|| Arc::clone(&self.ctx.details_factory));
        let transaction = Transaction::new(Arc::clone(&self.ctx), file, factory);
        let id = transaction.id();
        self.transactions.push(transaction);
        Ok(id)
    }

    pub fn transaction_mut(&mut self, id: TransactionId) -> Option<&mut Transaction> {
        self.transactions.iter_mut().find(|t| t.id() == id)
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Commit every open transaction in creation order and finish the delivery
    pub async fn commit(&mut self) -> DeliveryOutcome {
        if self.succeeded.is_some() {
            return self.outcome();
        }

        for transaction in self.transactions.iter_mut() {
            if !transaction.is_committed_or_rolled_back() {
                transaction.commit(&mut self.ledger).await;
            }
        }

        let success = self.ledger.errors.is_empty() && !self.ledger.any_rolled_back;
        self.finish(success)
    }

    /// Roll back every open transaction in creation order and fail the delivery
    pub fn abort(&mut self, error: RegistrationError) -> DeliveryOutcome {
        if self.succeeded.is_some() {
            return self.outcome();
        }

        warn!(incoming = %self.file.real_incoming_path().display(), error = %error, "Aborting registration");
        self.ledger.record_error(&error);

        for transaction in self.transactions.iter_mut() {
            if transaction.is_committed_or_rolled_back() {
                continue;
            }
            if let Err(rollback_err) = transaction.rollback() {
                error!(transaction_id = %transaction.id(), error = %rollback_err, "Rollback failed");
                self.ledger.record_error(&rollback_err);
            }
        }
        self.ledger.apply_undo(&error, Progress::Initial);

        self.finish(false)
    }

    /// Report a failure outside the registration itself
    pub fn record_secondary_failure(&mut self, description: impl Into<String>, message: impl Into<String>) {
        let failure = SecondaryFailure {
            description: description.into(),
            message: message.into(),
        };
        self.ledger.log_warn(&format!("{} failed: {}", failure.description, failure.message));
        self.ledger.secondary_errors.push(failure);
    }

    /// Fire the clean-up action with `false` unless it already ran
    pub fn clean_after_registration_if_necessary(&mut self) {
        self.run_clean_action(false);
    }

    pub fn is_clean_action_executed(&self) -> bool {
        self.clean_action_executed
    }

    fn run_clean_action(&mut self, success: bool) {
        if self.clean_action_executed {
            return;
        }
        self.clean_action_executed = true;
        if let Some(action) = self.clean_action.take() {
            action(success);
        }
    }

    fn finish(&mut self, success: bool) -> DeliveryOutcome {
        self.succeeded = Some(success);

        if let Some(log) = self.ledger.log.as_mut() {
            if let Err(err) = log.finish(success, &self.ledger.errors, &self.ledger.secondary_errors) {
                warn!(error = %err, "Failed to finish registration log");
            }
        }

        self.run_clean_action(success);

        let outcome = self.outcome();
        if success {
            info!(
                incoming = %self.file.real_incoming_path().display(),
                data_sets = outcome.data_set_codes.len(),
                secondary_errors = outcome.secondary_errors.len(),
                "Delivery registered"
            );
        } else {
            warn!(
                incoming = %self.file.real_incoming_path().display(),
                errors = outcome.errors.len(),
                interrupted = outcome.interrupted,
                "Delivery failed"
            );
        }
        outcome
    }

    // ------------------------------------------------------------------------
    // Algorithm factories
    // ------------------------------------------------------------------------

    /// Storage algorithm whose owner must already exist in the registry
    pub async fn create_storage_algorithm(
        &self,
        file: Option<&Path>,
        details: RegistrationDetails,
    ) -> Result<StorageAlgorithm> {
        self.new_algorithm(file, details, StorageStrategy::OwnerExists).await
    }

    /// Storage algorithm whose owner is created alongside it
    pub async fn create_storage_algorithm_with_identified_owner(
        &self,
        file: Option<&Path>,
        details: RegistrationDetails,
    ) -> Result<StorageAlgorithm> {
        self.new_algorithm(file, details, StorageStrategy::IdentifiedOwner).await
    }

    async fn new_algorithm(
        &self,
        file: Option<&Path>,
        details: RegistrationDetails,
        strategy: StorageStrategy,
    ) -> Result<StorageAlgorithm> {
        if let (true, Some(file)) = (details.is_container, file) {
            return Err(RegistrationError::invalid_argument(format!(
                "A data set can contain files or other data sets, but not both (container given '{}')",
                file.display()
            )));
        }
        let code = self.ctx.registry.create_data_set_code().await?;
        StorageAlgorithm::create(code, file, details, strategy)
    }

    // ------------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------------

    pub fn encountered_errors(&self) -> &[EncounteredError] {
        &self.ledger.errors
    }

    pub fn secondary_errors(&self) -> &[SecondaryFailure] {
        &self.ledger.secondary_errors
    }

    /// Snapshot of the delivery so far
    pub fn outcome(&self) -> DeliveryOutcome {
        DeliveryOutcome {
            succeeded: self.succeeded.unwrap_or(false),
            errors: self.ledger.errors.clone(),
            secondary_errors: self.ledger.secondary_errors.clone(),
            undo_records: self.ledger.undo_records.clone(),
            data_set_codes: self.ledger.data_set_codes.clone(),
            transactions: self
                .transactions
                .iter()
                .map(|t| TransactionReport {
                    id: t.id(),
                    status: t.status(),
                })
                .collect(),
            interrupted: self.ledger.interrupted,
            recovery_pending: self.ledger.recovery_pending,
            log_file: self.ledger.log.as_ref().map(|l| l.path().to_path_buf()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{RegistratorConfig, RegistryMode};
    use crate::policy::UndoAction;
    use crate::registry::InMemoryRegistry;
    use dss_common::ErrorClass;
    use std::sync::Mutex;

    struct Fixture {
        dir: tempfile::TempDir,
        ctx: Arc<EngineContext>,
        cleaned: Arc<Mutex<Vec<bool>>>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RegistratorConfig::for_root(dir.path());
        config.registry.mode = RegistryMode::Memory;
        config.details.space = "TEST".to_string();
        let registry = Arc::new(InMemoryRegistry::with_owners(["/TEST/S1"]));
        let ctx = EngineContext::builder(config).registry(registry).build().unwrap();
        ctx.ensure_directories().unwrap();
        Fixture {
            dir,
            ctx,
            cleaned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn service(f: &Fixture, name: &str) -> RegistrationService {
        let incoming = f.dir.path().join("incoming").join(name);
        std::fs::write(&incoming, b"content").unwrap();
        let cleaned = Arc::clone(&f.cleaned);
        RegistrationService::new(
            Arc::clone(&f.ctx),
            DataSetFile::direct(incoming),
            Box::new(move |success| cleaned.lock().unwrap().push(success)),
        )
    }

    #[tokio::test]
    async fn test_commit_success_cleans_once() {
        let f = fixture();
        let mut service = service(&f, "NEMO.EXP1==S1");
        let id = service.transaction(None, None).unwrap();
        let incoming = service.data_set_file().real_incoming_path().to_path_buf();
        service
            .transaction_mut(id)
            .unwrap()
            .create_new_data_set_from_file(&incoming)
            .await
            .unwrap();

        let outcome = service.commit().await;
        assert!(outcome.succeeded);
        assert_eq!(outcome.data_set_codes.len(), 1);
        assert!(outcome.log_file.unwrap().starts_with(f.dir.path().join("registration-log/succeeded")));

        service.clean_after_registration_if_necessary();
        assert_eq!(*f.cleaned.lock().unwrap(), vec![true]);
        assert!(service.is_clean_action_executed());
    }

    #[tokio::test]
    async fn test_content_failure_moves_delivery_to_error() {
        let f = fixture();
        let mut service = service(&f, "NEMO.EXP1==S9");
        let id = service.transaction(None, None).unwrap();
        let incoming = service.data_set_file().real_incoming_path().to_path_buf();
        service
            .transaction_mut(id)
            .unwrap()
            .create_new_data_set_from_file(&incoming)
            .await
            .unwrap();

        let outcome = service.commit().await;
        assert!(!outcome.succeeded);
        assert_eq!(outcome.errors[0].classification, ErrorClass::Content);
        assert_eq!(outcome.undo_records[0].action, UndoAction::MoveToError);
        assert!(!incoming.exists());
        assert!(f.dir.path().join("error/NEMO.EXP1==S9").exists());
        assert_eq!(*f.cleaned.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_abort_rolls_back_open_transactions() {
        let f = fixture();
        let mut service = service(&f, "bundle");
        let incoming = service.data_set_file().real_incoming_path().to_path_buf();
        let id = service.transaction(None, None).unwrap();
        service.transaction_mut(id).unwrap().move_file(&incoming, "bundle").unwrap();
        assert!(!incoming.exists());

        let outcome = service.abort(RegistrationError::RegistryUnavailable("down".into()));
        assert!(!outcome.succeeded);
        assert_eq!(outcome.undo_records[0].action, UndoAction::None);
        assert!(service.transactions()[0].is_rolled_back());
        assert_eq!(std::fs::read(&incoming).unwrap(), b"content");

        // Finished services stay finished.
        assert!(service.transaction(None, None).is_err());
        assert!(!service.commit().await.succeeded);
        assert_eq!(*f.cleaned.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_interruption_leaves_content_alone() {
        let f = fixture();
        let mut service = service(&f, "NEMO.EXP1==S1");
        let incoming = service.data_set_file().real_incoming_path().to_path_buf();

        let outcome = service.abort(RegistrationError::interrupted("ctrl-c"));
        assert!(outcome.interrupted);
        assert!(outcome.undo_records.is_empty());
        assert!(incoming.exists());
    }

    #[tokio::test]
    async fn test_container_with_file_is_rejected_immediately() {
        let f = fixture();
        let service = service(&f, "x");
        let err = service
            .create_storage_algorithm(Some(Path::new("/incoming/x")), RegistrationDetails::new("HCS").container())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidArgument(_)));

        let algorithm = service
            .create_storage_algorithm_with_identified_owner(None, RegistrationDetails::new("HCS").container())
            .await
            .unwrap();
        assert!(algorithm.is_container());
        assert_eq!(algorithm.strategy(), StorageStrategy::IdentifiedOwner);
    }

    #[tokio::test]
    async fn test_transaction_working_dir_follows_file() {
        let f = fixture();
        let mut service = service(&f, "x");
        let nested = f.dir.path().join("incoming/sub/file.txt");
        let id = service.transaction(Some(&nested), None).unwrap();
        assert_eq!(
            service.transaction_mut(id).unwrap().working_dir(),
            f.dir.path().join("incoming/sub")
        );
        let default = service.transaction(None, None).unwrap();
        assert_eq!(
            service.transaction_mut(default).unwrap().working_dir(),
            f.dir.path().join("incoming")
        );
    }
}
