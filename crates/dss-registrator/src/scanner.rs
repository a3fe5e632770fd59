//! Drop-box polling loop
//!
//! In marker mode only `.MARKER_is_finished_*` files are deliveries. Without
//! markers every visible top-level entry is a delivery once nothing below it
//! has been modified for the quiet period.

use crate::error::{RegistrationError, Result};
use crate::marker;
use crate::outcome::DeliveryOutcome;
use crate::registrator::TopLevelRegistrator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use walkdir::WalkDir;

pub struct DropBoxScanner {
    registrator: Arc<TopLevelRegistrator>,
    incoming: PathBuf,
    use_marker_files: bool,
    quiet_period: Duration,
    scan_interval: Duration,
    shutdown: CancellationToken,
}

/// Most recent modification time anywhere below `path`
fn newest_modification(path: &Path) -> Option<SystemTime> {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter_map(|m| m.modified().ok())
        .max()
}

impl DropBoxScanner {
    pub fn new(registrator: Arc<TopLevelRegistrator>) -> Self {
        let ctx = Arc::clone(registrator.context());
        let drop_box = &ctx.config.drop_box;
        Self {
            incoming: ctx.config.directories.incoming.clone(),
            use_marker_files: drop_box.use_marker_files,
            quiet_period: Duration::from_secs(drop_box.quiet_period_secs),
            scan_interval: Duration::from_secs(drop_box.scan_interval_secs),
            shutdown: ctx.shutdown.clone(),
            registrator,
        }
    }

    /// Deliveries ready for registration, in name order
    pub fn ready_deliveries(&self) -> Result<Vec<PathBuf>> {
        let read_dir = std::fs::read_dir(&self.incoming)
            .map_err(|e| RegistrationError::io("Failed to scan drop box", &self.incoming, e))?;

        let now = SystemTime::now();
        let mut ready = Vec::new();
        for entry in read_dir {
            let path = entry
                .map_err(|e| RegistrationError::io("Failed to scan drop box", &self.incoming, e))?
                .path();
            let hidden = path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(true);

            let is_ready = if self.use_marker_files {
                marker::is_marker(&path)
            } else if hidden {
                false
            } else {
                newest_modification(&path)
                    .and_then(|modified| now.duration_since(modified).ok())
                    .is_some_and(|age| age >= self.quiet_period)
            };
            if is_ready {
                ready.push(path);
            }
        }

        ready.sort();
        Ok(ready)
    }

    /// Hand every ready delivery to the registrator, stopping early on
    /// shutdown or when the registrator stops
    pub async fn scan_once(&self) -> Result<Vec<DeliveryOutcome>> {
        let mut outcomes = Vec::new();
        for path in self.ready_deliveries()? {
            if self.shutdown.is_cancelled() || self.registrator.is_stopped() {
                break;
            }
            if let Some(outcome) = self.registrator.handle(&path).await {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    pub async fn run(&self) -> Result<()> {
        info!(
            incoming = %self.incoming.display(),
            markers = self.use_marker_files,
            interval_secs = self.scan_interval.as_secs(),
            "Watching drop box"
        );

        while !self.shutdown.is_cancelled() && !self.registrator.is_stopped() {
            match self.scan_once().await {
                Ok(outcomes) if !outcomes.is_empty() => {
                    let failed = outcomes.iter().filter(|o| !o.succeeded).count();
                    info!(deliveries = outcomes.len(), failed, "Scan finished");
                },
                Ok(_) => debug!("Nothing to register"),
                Err(err) => error!(error = %err, "Drop box scan failed"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.scan_interval) => {},
            }
        }

        info!("Drop box scanner stopped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{RegistratorConfig, RegistryMode};
    use crate::context::EngineContext;
    use crate::handler::PlainDeliveryHandler;

    fn scanner(dir: &Path, markers: bool, quiet_secs: u64) -> DropBoxScanner {
        let mut config = RegistratorConfig::for_root(dir);
        config.registry.mode = RegistryMode::Memory;
        config.drop_box.use_marker_files = markers;
        config.drop_box.quiet_period_secs = quiet_secs;
        let ctx = EngineContext::from_config(config).unwrap();
        ctx.ensure_directories().unwrap();
        DropBoxScanner::new(Arc::new(TopLevelRegistrator::new(ctx, Arc::new(PlainDeliveryHandler))))
    }

    #[test]
    fn test_marker_mode_only_sees_markers() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = scanner(dir.path(), true, 0);
        let incoming = dir.path().join("incoming");
        std::fs::write(incoming.join("data"), b"x").unwrap();
        std::fs::write(incoming.join(".MARKER_is_finished_data"), b"").unwrap();

        assert_eq!(
            scanner.ready_deliveries().unwrap(),
            vec![incoming.join(".MARKER_is_finished_data")]
        );
    }

    #[test]
    fn test_quiet_period_holds_back_fresh_entries() {
        let dir = tempfile::tempdir().unwrap();
        let incoming = dir.path().join("incoming");

        let waiting = scanner(dir.path(), false, 3600);
        std::fs::write(incoming.join("b"), b"x").unwrap();
        std::fs::write(incoming.join("a"), b"x").unwrap();
        std::fs::write(incoming.join(".hidden"), b"x").unwrap();
        assert!(waiting.ready_deliveries().unwrap().is_empty());

        let eager = scanner(dir.path(), false, 0);
        assert_eq!(eager.ready_deliveries().unwrap(), vec![incoming.join("a"), incoming.join("b")]);
    }

    #[tokio::test]
    async fn test_run_returns_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = scanner(dir.path(), true, 0);
        scanner.shutdown.cancel();
        scanner.run().await.unwrap();
    }
}
