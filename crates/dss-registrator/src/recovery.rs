//! Dead-transaction recovery
//!
//! A transaction that was still open when the process died leaves its
//! persisted rollback stack below the staging root. On startup every such
//! stack is resolved before any new delivery is accepted:
//!
//! - no registration was attempted: roll back;
//! - a registration was attempted: ask the registry. `SUCCEEDED` means the
//!   content is stored and registered, so only the workspace is cleaned;
//!   `NO_OPERATION` means roll back; `IN_PROGRESS` cannot be decided yet and
//!   fails startup.
//!
//! Corrupt stacks and an unreachable registry fail startup as well.

use crate::context::EngineContext;
use crate::error::{RegistrationError, Result};
use crate::fs_ops;
use crate::registry::EntityOperationsState;
use crate::rollback::RollbackStack;
use crate::transaction::TransactionId;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub rolled_back: Vec<TransactionId>,
    pub completed: Vec<TransactionId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.rolled_back.is_empty() && self.completed.is_empty()
    }
}

pub async fn recover_dead_transactions(ctx: &EngineContext) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for path in RollbackStack::list_persisted(&ctx.config.directories.staging)? {
        let mut stack = RollbackStack::load(&path)?;
        let id = stack.transaction_id();

        let completed = match stack.registration_attempt().map(str::to_string) {
            None => false,
            Some(registration_id) => match ctx.registry.entity_operations_state(&registration_id).await? {
                EntityOperationsState::Succeeded => true,
                EntityOperationsState::NoOperation => false,
                EntityOperationsState::InProgress => {
                    return Err(RegistrationError::RegistryUnavailable(format!(
                        "registration {} of transaction {} is still in progress",
                        registration_id, id
                    )));
                },
            },
        };

        if completed {
            fs_ops::remove_path(&ctx.workspace(id))?;
            stack.discard()?;
            info!(transaction_id = %id, "Recovered transaction was registered, cleaned its workspace");
            report.completed.push(id);
        } else {
            let undone = stack.rollback(ctx.processor.as_ref())?;
            fs_ops::remove_path(&ctx.workspace(id))?;
            warn!(transaction_id = %id, undone, "Rolled back dead transaction");
            report.rolled_back.push(id);
        }
    }

    if !report.is_empty() {
        info!(
            rolled_back = report.rolled_back.len(),
            completed = report.completed.len(),
            "Dead-transaction recovery finished"
        );
    }
    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{RegistratorConfig, RegistryMode};
    use crate::registry::InMemoryRegistry;
    use crate::rollback::RollbackCommand;
    use std::sync::Arc;

    fn context(dir: &std::path::Path, registry: Arc<InMemoryRegistry>) -> Arc<EngineContext> {
        let mut config = RegistratorConfig::for_root(dir);
        config.registry.mode = RegistryMode::Memory;
        let ctx = EngineContext::builder(config).registry(registry).build().unwrap();
        ctx.ensure_directories().unwrap();
        ctx
    }

    /// Simulates a process that moved a delivery into its workspace and died
    fn dead_transaction(ctx: &EngineContext, registration_id: Option<&str>) -> (TransactionId, std::path::PathBuf) {
        let incoming = ctx.config.directories.incoming.join("delivery");
        std::fs::write(&incoming, b"payload").unwrap();

        let id = TransactionId::new();
        let workspace = ctx.workspace(id);
        let mut stack = RollbackStack::new(&ctx.config.directories.staging, id);
        stack.push(RollbackCommand::CreateDirectory { path: workspace.clone() }).unwrap();
        std::fs::create_dir_all(&workspace).unwrap();
        let staged = workspace.join("delivery");
        stack
            .push(RollbackCommand::MoveFile { from: incoming.clone(), to: staged.clone() })
            .unwrap();
        std::fs::rename(&incoming, &staged).unwrap();
        if let Some(registration_id) = registration_id {
            stack
                .push(RollbackCommand::RegistrationAttempted { registration_id: registration_id.to_string() })
                .unwrap();
        }
        (id, incoming)
    }

    #[tokio::test]
    async fn test_unregistered_transaction_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(InMemoryRegistry::new()));
        let (id, incoming) = dead_transaction(&ctx, Some("reg-1"));

        let report = recover_dead_transactions(&ctx).await.unwrap();
        assert_eq!(report.rolled_back, vec![id]);
        assert_eq!(std::fs::read(&incoming).unwrap(), b"payload");
        assert!(!ctx.workspace(id).exists());
        assert!(RollbackStack::list_persisted(&ctx.config.directories.staging).unwrap().is_empty());

        // Nothing left to do on the next start.
        assert!(recover_dead_transactions(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_progress_registration_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        registry.mark_in_progress("reg-2").await;
        let ctx = context(dir.path(), registry);
        dead_transaction(&ctx, Some("reg-2"));

        let err = recover_dead_transactions(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("still in progress"));
        assert_eq!(RollbackStack::list_persisted(&ctx.config.directories.staging).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_registry_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        registry.set_unreachable(true).await;
        let ctx = context(dir.path(), registry);
        let (_, incoming) = dead_transaction(&ctx, Some("reg-3"));

        assert!(recover_dead_transactions(&ctx).await.is_err());
        assert!(!incoming.exists());
    }

    #[tokio::test]
    async fn test_transaction_without_attempt_needs_no_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        registry.set_unreachable(true).await;
        let ctx = context(dir.path(), registry);
        let (id, incoming) = dead_transaction(&ctx, None);

        let report = recover_dead_transactions(&ctx).await.unwrap();
        assert_eq!(report.rolled_back, vec![id]);
        assert!(incoming.exists());
    }
}
