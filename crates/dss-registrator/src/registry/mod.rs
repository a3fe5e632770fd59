//! Metadata registry boundary
//!
//! The registry is an external service. The engine only needs a handful of
//! calls from it, the central one being "perform these entity operations
//! atomically". [`client::RegistryClient`] talks to a real registry over HTTP;
//! [`memory::InMemoryRegistry`] keeps everything in process for tests and dry
//! runs.

pub mod client;
pub mod memory;
pub mod operations;

use crate::error::Result;
use async_trait::async_trait;
use dss_common::types::{DataSetCode, ExperimentIdentifier, FileMetadata, SampleIdentifier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use client::RegistryClient;
pub use memory::InMemoryRegistry;
pub use operations::EntityOperationService;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExperiment {
    pub identifier: ExperimentIdentifier,
    pub experiment_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl NewExperiment {
    pub fn new(identifier: ExperimentIdentifier, experiment_type: impl Into<String>) -> Self {
        Self {
            identifier,
            experiment_type: experiment_type.into(),
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSample {
    pub identifier: SampleIdentifier,
    pub sample_type: String,
    pub experiment: Option<ExperimentIdentifier>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl NewSample {
    pub fn new(identifier: SampleIdentifier, sample_type: impl Into<String>) -> Self {
        Self {
            identifier,
            sample_type: sample_type.into(),
            experiment: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn in_experiment(mut self, experiment: ExperimentIdentifier) -> Self {
        self.experiment = Some(experiment);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDataSet {
    pub code: DataSetCode,
    pub data_set_type: String,
    pub experiment: Option<ExperimentIdentifier>,
    pub sample: Option<SampleIdentifier>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub parent_codes: Vec<DataSetCode>,
    /// Codes of the children, for containers
    #[serde(default)]
    pub contained_codes: Vec<DataSetCode>,
    pub is_container: bool,
    /// Location relative to the store root; empty for containers
    pub location: String,
    #[serde(default)]
    pub files: Vec<FileMetadata>,
}

impl NewDataSet {
    pub fn owner_identifier(&self) -> Option<String> {
        self.sample
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| self.experiment.as_ref().map(ToString::to_string))
    }
}

/// One all-or-nothing batch for the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicEntityOperations {
    /// Client-chosen id, used to ask later whether the batch went through
    pub registration_id: String,
    pub experiments: Vec<NewExperiment>,
    pub samples: Vec<NewSample>,
    pub data_sets: Vec<NewDataSet>,
}

impl AtomicEntityOperations {
    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty() && self.samples.is_empty() && self.data_sets.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicEntityOperationResult {
    pub registration_id: String,
    pub experiments_created: usize,
    pub samples_created: usize,
    pub data_sets_created: usize,
}

/// What the registry knows about a registration id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityOperationsState {
    NoOperation,
    InProgress,
    Succeeded,
}

#[async_trait]
pub trait MetadataRegistry: Send + Sync {
    /// Reserve a fresh, unique data set code
    async fn create_data_set_code(&self) -> Result<DataSetCode>;

    /// Whether an experiment or sample with this identifier exists
    async fn owner_exists(&self, identifier: &str) -> Result<bool>;

    /// Register everything in `operations` or nothing
    async fn perform_entity_operations(
        &self,
        operations: &AtomicEntityOperations,
    ) -> Result<AtomicEntityOperationResult>;

    async fn entity_operations_state(&self, registration_id: &str) -> Result<EntityOperationsState>;

    async fn health(&self) -> Result<()>;
}
