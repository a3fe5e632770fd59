//! Common test utilities for registrator integration tests
//!
//! [`TestDropBox`] lays out a complete drop box below a temporary directory
//! and wires a registrator to an in-memory registry.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use dss_registrator::config::{RegistratorConfig, RegistryMode};
use dss_registrator::handler::{DeliveryHandler, PlainDeliveryHandler};
use dss_registrator::registry::{InMemoryRegistry, MetadataRegistry};
use dss_registrator::{EngineContext, TopLevelRegistrator};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use walkdir::WalkDir;

/// Space every test identifier lives in
pub const TEST_SPACE: &str = "TEST";

pub struct TestDropBox {
    pub dir: TempDir,
    pub config: RegistratorConfig,
    pub registry: Arc<InMemoryRegistry>,
}

impl TestDropBox {
    /// Drop box whose registry knows the given owners
    pub fn new<I, S>(owners: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = RegistratorConfig::for_root(dir.path());
        config.registry.mode = RegistryMode::Memory;
        config.details.space = TEST_SPACE.to_string();
        config.details.data_set_type = "HCS_IMAGE".to_string();

        Self {
            dir,
            config,
            registry: Arc::new(InMemoryRegistry::with_owners(owners)),
        }
    }

    pub fn context(&self) -> Arc<EngineContext> {
        self.context_with(self.registry.clone())
    }

    pub fn context_with(&self, registry: Arc<dyn MetadataRegistry>) -> Arc<EngineContext> {
        let ctx = EngineContext::builder(self.config.clone())
            .registry(registry)
            .build()
            .expect("Failed to build engine context");
        ctx.ensure_directories().unwrap();
        ctx
    }

    pub fn registrator(&self) -> TopLevelRegistrator {
        self.registrator_with(Arc::new(PlainDeliveryHandler))
    }

    pub fn registrator_with(&self, handler: Arc<dyn DeliveryHandler>) -> TopLevelRegistrator {
        TopLevelRegistrator::new(self.context(), handler)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn incoming(&self) -> &Path {
        &self.config.directories.incoming
    }

    pub fn store(&self) -> &Path {
        &self.config.directories.store
    }

    pub fn error_dir(&self) -> &Path {
        &self.config.directories.error
    }

    pub fn staging(&self) -> &Path {
        &self.config.directories.staging
    }

    /// Write a single-file delivery
    pub fn deliver(&self, name: &str, content: &[u8]) -> PathBuf {
        std::fs::create_dir_all(self.incoming()).unwrap();
        let path = self.incoming().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Write a directory delivery with the given relative files
    pub fn deliver_dir(&self, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let root = self.incoming().join(name);
        for (relative, content) in files {
            let path = root.join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
        }
        root
    }

    /// Registration log files that ended up in `succeeded/` or `failed/`
    pub fn logs_in(&self, outcome_dir: &str) -> Vec<PathBuf> {
        list(&self.config.directories.registration_log.join(outcome_dir))
    }
}

/// Entries of a directory, sorted; empty when it does not exist
pub fn list(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default();
    entries.sort();
    entries
}

/// Every file below `root` with its content, keyed by relative path
pub fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let relative = e.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
            (relative, std::fs::read(e.path()).unwrap())
        })
        .collect()
}
