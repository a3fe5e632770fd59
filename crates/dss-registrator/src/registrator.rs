//! Top-level registrator
//!
//! Entry point for every delivery. Deliveries are handled one at a time under
//! a mutex. Before the first delivery is accepted, transactions left behind
//! by a crashed process are recovered. The same recovery runs again before
//! the next delivery whenever a transaction was left undecided. An
//! interruption stops the registrator for good; later deliveries are ignored
//! until the process restarts.

use crate::context::EngineContext;
use crate::dataset_file::DataSetFile;
use crate::error::{RegistrationError, Result};
use crate::handler::DeliveryHandler;
use crate::hooks::HookKind;
use crate::marker;
use crate::outcome::DeliveryOutcome;
use crate::recovery::{recover_dead_transactions, RecoveryReport};
use crate::service::{CleanAction, RegistrationService};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct TopLevelRegistrator {
    ctx: Arc<EngineContext>,
    handler: Arc<dyn DeliveryHandler>,
    lock: Mutex<()>,
    stopped: AtomicBool,
    recovered: AtomicBool,
}

impl TopLevelRegistrator {
    pub fn new(ctx: Arc<EngineContext>, handler: Arc<dyn DeliveryHandler>) -> Self {
        Self {
            ctx,
            handler,
            lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            warn!("Registrator stopped; no further deliveries will be accepted");
        }
    }

    /// Create the directory layout and recover dead transactions
    pub async fn start(&self) -> Result<RecoveryReport> {
        let _guard = self.lock.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<RecoveryReport> {
        self.ctx.ensure_directories()?;
        let report = recover_dead_transactions(&self.ctx).await?;
        self.recovered.store(true, Ordering::SeqCst);
        Ok(report)
    }

    /// Resolve what `path` names and the clean-up action that goes with it
    fn resolve(&self, path: &Path) -> Result<(DataSetFile, CleanAction)> {
        if !self.ctx.config.drop_box.use_marker_files {
            let shown = path.display().to_string();
            return Ok((
                DataSetFile::direct(path),
                Box::new(move |success| debug!(incoming = %shown, success, "Delivery finished")),
            ));
        }

        if !marker::is_marker(path) {
            return Err(RegistrationError::invalid_argument(format!(
                "'{}' is not an is-finished marker",
                path.display()
            )));
        }
        let incoming = marker::incoming_path_from_marker(path)?;
        let marker_path = path.to_path_buf();
        Ok((
            DataSetFile::direct(incoming),
            Box::new(move |_success| {
                marker::delete_marker(&marker_path);
            }),
        ))
    }

    /// Register one delivery. Returns `None` when the registrator is stopped
    /// or `path` does not name a delivery.
    pub async fn handle(&self, path: &Path) -> Option<DeliveryOutcome> {
        if self.is_stopped() {
            debug!(path = %path.display(), "Registrator is stopped, ignoring delivery");
            return None;
        }

        let _guard = self.lock.lock().await;
        if self.is_stopped() {
            return None;
        }
        if self.ctx.is_shutting_down() {
            self.stop();
            return None;
        }

        if !self.recovered.load(Ordering::SeqCst) {
            if let Err(err) = self.start_locked().await {
                error!(error = %err, "Recovery of dead transactions failed");
                self.stop();
                return None;
            }
        }

        let (file, clean_action) = match self.resolve(path) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Ignoring delivery");
                return None;
            },
        };

        info!(incoming = %file.real_incoming_path().display(), "Handling delivery");
        let mut service = RegistrationService::new(Arc::clone(&self.ctx), file.clone(), clean_action);

        let mut outcome = match self
            .ctx
            .hooks
            .run(HookKind::PreDelivery, file.real_incoming_path(), &[])
            .await
        {
            Err(err) => service.abort(err),
            Ok(()) => match self.handler.handle(&file, &mut service).await {
                Ok(()) => service.commit().await,
                Err(err) => service.abort(err),
            },
        };

        if outcome.interrupted {
            self.stop();
        } else if outcome.recovery_pending {
            self.recovered.store(false, Ordering::SeqCst);
        }
        service.clean_after_registration_if_necessary();

        let codes: Vec<String> = outcome.data_set_codes.iter().map(ToString::to_string).collect();
        let env = vec![
            ("DSS_OUTCOME".to_string(), outcome.outcome_label().to_string()),
            ("DSS_DATA_SET_CODES".to_string(), codes.join(",")),
            ("DSS_ERROR_COUNT".to_string(), outcome.errors.len().to_string()),
        ];
        if let Err(err) = self
            .ctx
            .hooks
            .run(HookKind::PostDelivery, file.real_incoming_path(), &env)
            .await
        {
            warn!(incoming = %file.real_incoming_path().display(), error = %err, "Post-delivery script failed");
            service.record_secondary_failure(format!("{} script", HookKind::PostDelivery), err.to_string());
            outcome.secondary_errors = service.secondary_errors().to_vec();
        }

        Some(outcome)
    }

    /// Validate processor, hooks, directories and the registry connection
    /// without changing anything
    pub async fn check(&self) -> Result<()> {
        self.ctx.processor.check()?;
        self.ctx.hooks.check()?;

        let dirs = &self.ctx.config.directories;
        for (name, dir) in [
            ("incoming", &dirs.incoming),
            ("staging", &dirs.staging),
            ("precommit", &dirs.precommit),
            ("store", &dirs.store),
            ("error", &dirs.error),
            ("registration log", &dirs.registration_log),
        ] {
            let metadata = std::fs::metadata(dir)
                .map_err(|e| RegistrationError::io(format!("The {} directory is not accessible", name), dir, e))?;
            if !metadata.is_dir() {
                return Err(RegistrationError::config(format!(
                    "The {} directory '{}' is not a directory",
                    name,
                    dir.display()
                )));
            }
            if metadata.permissions().readonly() {
                return Err(RegistrationError::config(format!(
                    "The {} directory '{}' is read-only",
                    name,
                    dir.display()
                )));
            }
        }

        self.ctx.registry.health().await?;
        info!("Health check passed");
        Ok(())
    }
}
