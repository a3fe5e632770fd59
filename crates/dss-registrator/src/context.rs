//! Engine context
//!
//! Everything a delivery needs that does not change while the engine runs:
//! configuration, the registry, the storage processor, the details factory,
//! the undo table, hooks and the shutdown token. Built once at startup and
//! shared by `Arc`.

use crate::config::{RegistratorConfig, RegistryMode};
use crate::details::{DefaultDetailsFactory, DetailsFactory};
use crate::error::Result;
use crate::fs_ops;
use crate::hooks::ScriptHooks;
use crate::notify::{LogNotifier, Notifier};
use crate::policy::RollbackPolicy;
use crate::registry::{InMemoryRegistry, MetadataRegistry, RegistryClient};
use crate::storage::processor::{DefaultStorageProcessor, StorageProcessor};
use crate::storage::StoragePaths;
use crate::transaction::TransactionId;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct EngineContext {
    pub config: RegistratorConfig,
    pub registry: Arc<dyn MetadataRegistry>,
    pub processor: Arc<dyn StorageProcessor>,
    pub details_factory: Arc<dyn DetailsFactory>,
    pub policy: RollbackPolicy,
    pub hooks: ScriptHooks,
    pub notifier: Arc<dyn Notifier>,
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    pub fn builder(config: RegistratorConfig) -> EngineContextBuilder {
        EngineContextBuilder {
            config,
            registry: None,
            processor: None,
            details_factory: None,
            notifier: None,
            shutdown: None,
        }
    }

    /// Context with every component chosen by the configuration
    pub fn from_config(config: RegistratorConfig) -> Result<Arc<Self>> {
        Self::builder(config).build()
    }

    /// Create the drop-box directory layout
    pub fn ensure_directories(&self) -> Result<()> {
        let dirs = &self.config.directories;
        for dir in [
            &dirs.incoming,
            &dirs.staging,
            &dirs.precommit,
            &dirs.store,
            &dirs.error,
            &dirs.registration_log,
        ] {
            fs_ops::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Private staging workspace of a transaction
    pub fn workspace(&self, id: TransactionId) -> PathBuf {
        self.config.directories.staging.join(id.to_string())
    }

    pub fn storage_paths(&self, id: TransactionId) -> StoragePaths {
        StoragePaths {
            workspace: self.workspace(id),
            precommit: self.config.directories.precommit.clone(),
            store: self.config.directories.store.clone(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Builder for [`EngineContext`]; unset components come from the configuration
pub struct EngineContextBuilder {
    config: RegistratorConfig,
    registry: Option<Arc<dyn MetadataRegistry>>,
    processor: Option<Arc<dyn StorageProcessor>>,
    details_factory: Option<Arc<dyn DetailsFactory>>,
    notifier: Option<Arc<dyn Notifier>>,
    shutdown: Option<CancellationToken>,
}

impl EngineContextBuilder {
    pub fn registry(mut self, registry: Arc<dyn MetadataRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn StorageProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn details_factory(mut self, factory: Arc<dyn DetailsFactory>) -> Self {
        self.details_factory = Some(factory);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn build(self) -> Result<Arc<EngineContext>> {
        let config = self.config;

        let policy = match &config.on_error_overrides {
            Some(overrides) => RollbackPolicy::from_overrides(overrides)?,
            None => RollbackPolicy::default(),
        };

        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        let registry: Arc<dyn MetadataRegistry> = match self.registry {
            Some(registry) => registry,
            None => match config.registry.mode {
                RegistryMode::Http => Arc::new(RegistryClient::new(
                    config.registry.url.clone(),
                    Duration::from_secs(config.registry.timeout_secs),
                )?),
                RegistryMode::Memory => Arc::new(InMemoryRegistry::new()),
            },
        };

        let processor: Arc<dyn StorageProcessor> = match self.processor {
            Some(processor) => processor,
            None => Arc::new(
                DefaultStorageProcessor::from_properties(&config.processor_properties)?
                    .with_notifier(notifier.clone(), config.notify_recipient.clone()),
            ),
        };

        let details_factory = self
            .details_factory
            .unwrap_or_else(|| Arc::new(DefaultDetailsFactory::new(&config.details)));

        debug!(mode = ?config.registry.mode, "Engine context built");

        Ok(Arc::new(EngineContext {
            hooks: ScriptHooks::new(config.hooks.clone()),
            config,
            registry,
            processor,
            details_factory,
            policy,
            notifier,
            shutdown: self.shutdown.unwrap_or_default(),
        }))
    }
}
