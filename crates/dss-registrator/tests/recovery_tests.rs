//! Crash and restart scenarios
//!
//! A registry wrapper simulates the process going down while the entity
//! operations call is in flight: it optionally lets the batch through, then
//! fires the shutdown token and never answers. A second registrator on the
//! same directories then has to resolve what was left behind.

mod common;

use async_trait::async_trait;
use common::{list, snapshot, TestDropBox};
use dss_common::types::DataSetCode;
use dss_common::ErrorClass;
use dss_registrator::handler::PlainDeliveryHandler;
use dss_registrator::registry::{
    AtomicEntityOperationResult, AtomicEntityOperations, EntityOperationsState, InMemoryRegistry,
    MetadataRegistry,
};
use dss_registrator::rollback::RollbackStack;
use dss_registrator::transaction::TransactionStatus;
use dss_registrator::{EngineContext, TopLevelRegistrator};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DELIVERY: &str = "NEMO.EXP1==CP001A-3AB";
const OWNER: &str = "/TEST/CP001A-3AB";

/// What the registry did with the batch before the process went away
#[derive(Clone, Copy, PartialEq)]
enum CrashPoint {
    /// The batch was registered
    AfterRegistration,
    /// The batch never arrived
    BeforeRegistration,
    /// The registry is still working on it
    DuringRegistration,
}

struct CrashingRegistry {
    inner: Arc<InMemoryRegistry>,
    crash: CrashPoint,
    shutdown: CancellationToken,
}

#[async_trait]
impl MetadataRegistry for CrashingRegistry {
    async fn create_data_set_code(&self) -> dss_registrator::Result<DataSetCode> {
        self.inner.create_data_set_code().await
    }

    async fn owner_exists(&self, identifier: &str) -> dss_registrator::Result<bool> {
        self.inner.owner_exists(identifier).await
    }

    async fn perform_entity_operations(
        &self,
        operations: &AtomicEntityOperations,
    ) -> dss_registrator::Result<AtomicEntityOperationResult> {
        match self.crash {
            CrashPoint::AfterRegistration => {
                self.inner.perform_entity_operations(operations).await?;
            },
            CrashPoint::BeforeRegistration => {},
            CrashPoint::DuringRegistration => {
                self.inner.mark_in_progress(operations.registration_id.clone()).await;
            },
        }
        self.shutdown.cancel();
        std::future::pending().await
    }

    async fn entity_operations_state(&self, registration_id: &str) -> dss_registrator::Result<EntityOperationsState> {
        self.inner.entity_operations_state(registration_id).await
    }

    async fn health(&self) -> dss_registrator::Result<()> {
        self.inner.health().await
    }
}

/// Run one delivery until the simulated crash; returns the delivery path
async fn crash_during_registration(drop_box: &TestDropBox, crash: CrashPoint) -> std::path::PathBuf {
    let shutdown = CancellationToken::new();
    let registry = Arc::new(CrashingRegistry {
        inner: Arc::clone(&drop_box.registry),
        crash,
        shutdown: shutdown.clone(),
    });
    let ctx = EngineContext::builder(drop_box.config.clone())
        .registry(registry)
        .shutdown(shutdown)
        .build()
        .unwrap();
    let registrator = TopLevelRegistrator::new(ctx, Arc::new(PlainDeliveryHandler));
    registrator.start().await.unwrap();

    let incoming = drop_box.deliver(DELIVERY, b"acquired plate");
    let outcome = registrator.handle(&incoming).await.unwrap();

    assert!(outcome.interrupted);
    assert!(!outcome.succeeded);
    assert_eq!(outcome.errors[0].classification, ErrorClass::Interruption);
    assert_eq!(outcome.transactions[0].status, TransactionStatus::RolledBack);
    assert!(registrator.is_stopped());
    assert_eq!(RollbackStack::list_persisted(drop_box.staging()).unwrap().len(), 1);
    incoming
}

#[tokio::test]
async fn test_restart_completes_transaction_registered_before_crash() {
    let drop_box = TestDropBox::new([OWNER]);
    let incoming = crash_during_registration(&drop_box, CrashPoint::AfterRegistration).await;
    assert!(!incoming.exists());

    let registrator = drop_box.registrator();
    let report = registrator.start().await.unwrap();

    assert_eq!(report.completed.len(), 1);
    assert!(report.rolled_back.is_empty());
    assert!(RollbackStack::list_persisted(drop_box.staging()).unwrap().is_empty());
    assert!(!drop_box.staging().join(report.completed[0].to_string()).exists());

    let registered = drop_box.registry.data_sets().await;
    assert_eq!(registered.len(), 1);
    let stored = snapshot(&drop_box.store().join(registered[0].code.store_path()));
    assert_eq!(stored.get(&format!("original/{}", DELIVERY)).unwrap(), b"acquired plate");
    assert!(!incoming.exists());
}

#[tokio::test]
async fn test_restart_rolls_back_transaction_the_registry_never_saw() {
    let drop_box = TestDropBox::new([OWNER]);
    let incoming = crash_during_registration(&drop_box, CrashPoint::BeforeRegistration).await;
    assert!(!incoming.exists());
    assert!(!list(drop_box.store()).is_empty());

    let registrator = drop_box.registrator();
    let report = registrator.start().await.unwrap();

    assert_eq!(report.rolled_back.len(), 1);
    assert!(report.completed.is_empty());
    assert_eq!(std::fs::read(&incoming).unwrap(), b"acquired plate");
    assert!(list(drop_box.store()).is_empty());
    assert!(list(&drop_box.config.directories.precommit).is_empty());
    assert!(RollbackStack::list_persisted(drop_box.staging()).unwrap().is_empty());
    assert!(drop_box.registry.data_sets().await.is_empty());

    // The restored delivery registers normally afterwards.
    let outcome = registrator.handle(&incoming).await.unwrap();
    assert!(outcome.succeeded, "{:?}", outcome.errors);
}

#[tokio::test]
async fn test_registration_still_in_progress_blocks_startup() {
    let drop_box = TestDropBox::new([OWNER]);
    let incoming = crash_during_registration(&drop_box, CrashPoint::DuringRegistration).await;

    let registrator = drop_box.registrator();
    let err = registrator.start().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Environment);
    assert!(err.to_string().contains("still in progress"));

    // Nothing was touched, the next start can try again.
    assert_eq!(RollbackStack::list_persisted(drop_box.staging()).unwrap().len(), 1);
    assert!(!incoming.exists());

    // Recovery also runs before the first delivery and stops the registrator.
    let other = drop_box.deliver("NEMO.EXP1==OTHER", b"x");
    assert!(registrator.handle(&other).await.is_none());
    assert!(registrator.is_stopped());
    assert!(other.exists());
}

#[tokio::test]
async fn test_unreachable_registry_blocks_startup_after_crash() {
    let drop_box = TestDropBox::new([OWNER]);
    crash_during_registration(&drop_box, CrashPoint::AfterRegistration).await;
    drop_box.registry.set_unreachable(true).await;

    let err = drop_box.registrator().start().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Environment);
    assert_eq!(RollbackStack::list_persisted(drop_box.staging()).unwrap().len(), 1);

    drop_box.registry.set_unreachable(false).await;
    let report = drop_box.registrator().start().await.unwrap();
    assert_eq!(report.completed.len(), 1);
}

#[tokio::test]
async fn test_crash_before_any_registration_needs_no_registry() {
    let drop_box = TestDropBox::new([OWNER]);
    let ctx = drop_box.context();
    let incoming = drop_box.deliver_dir(DELIVERY, &[("a.csv", b"1".as_slice()), ("b/c.csv", b"2".as_slice())]);
    let before = snapshot(&incoming);

    // A transaction that staged its content and was never committed
    let mut transaction = dss_registrator::Transaction::new(
        Arc::clone(&ctx),
        &incoming,
        Arc::clone(&ctx.details_factory),
    );
    let staged = transaction.move_file(&incoming, DELIVERY).unwrap();
    assert!(staged.exists());
    drop(transaction);

    drop_box.registry.set_unreachable(true).await;
    let report = drop_box.registrator().start().await.unwrap();

    assert_eq!(report.rolled_back.len(), 1);
    assert_eq!(snapshot(&incoming), before);
    assert!(!ctx.workspace(report.rolled_back[0]).exists());
}
