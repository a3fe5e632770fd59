//! Packages a transaction's accumulated entities into one atomic registry call

use super::{
    AtomicEntityOperationResult, AtomicEntityOperations, MetadataRegistry, NewExperiment, NewSample,
};
use crate::error::{RegistrationError, Result};
use crate::storage::StorageAlgorithm;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct EntityOperationService<'a> {
    registry: &'a dyn MetadataRegistry,
}

impl<'a> EntityOperationService<'a> {
    pub fn new(registry: &'a dyn MetadataRegistry) -> Self {
        Self { registry }
    }

    /// Build the batch. Contained data sets precede their containers.
    pub fn prepare(
        registration_id: impl Into<String>,
        experiments: &[NewExperiment],
        samples: &[NewSample],
        algorithms: &[StorageAlgorithm],
    ) -> AtomicEntityOperations {
        AtomicEntityOperations {
            registration_id: registration_id.into(),
            experiments: experiments.to_vec(),
            samples: samples.to_vec(),
            data_sets: algorithms.iter().flat_map(StorageAlgorithm::new_data_sets).collect(),
        }
    }

    /// Perform the batch, giving up with an interruption if `shutdown` fires
    /// first. The registry may still complete a batch abandoned this way;
    /// recovery asks it later.
    pub async fn perform(
        &self,
        operations: &AtomicEntityOperations,
        shutdown: &CancellationToken,
    ) -> Result<AtomicEntityOperationResult> {
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                return Err(RegistrationError::interrupted(format!(
                    "shutdown while registration {} was in flight",
                    operations.registration_id
                )));
            }
            result = self.registry.perform_entity_operations(operations) => result?,
        };

        if result.data_sets_created != operations.data_sets.len() {
            warn!(
                registration_id = %operations.registration_id,
                expected = operations.data_sets.len(),
                created = result.data_sets_created,
                "Registry reported a different number of data sets than sent"
            );
        }

        info!(
            registration_id = %operations.registration_id,
            experiments = result.experiments_created,
            samples = result.samples_created,
            data_sets = result.data_sets_created,
            "Entity operations performed"
        );
        Ok(result)
    }
}
