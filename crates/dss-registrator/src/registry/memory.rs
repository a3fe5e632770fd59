//! In-process registry
//!
//! Applies entity operations to plain maps with the same all-or-nothing
//! semantics as the real service. Failures can be injected to exercise the
//! rollback paths.

use super::{
    AtomicEntityOperationResult, AtomicEntityOperations, EntityOperationsState, MetadataRegistry,
    NewDataSet, NewExperiment, NewSample,
};
use crate::error::{RegistrationError, Result};
use async_trait::async_trait;
use chrono::Utc;
use dss_common::types::DataSetCode;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::Mutex;

/// Failure to return from the next `perform_entity_operations` calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Answer as an unreachable registry would
    Unavailable,
    /// Reject the batch as invalid
    Rejected,
    /// Apply the batch, then lose the answer
    LostResponse,
    /// Leave the batch half-way and lose the answer
    LeftInProgress,
    /// Lose the answer and stay unreachable until told otherwise
    WentUnreachable,
}

#[derive(Default)]
struct State {
    next_code: u64,
    owners: BTreeSet<String>,
    experiments: BTreeMap<String, NewExperiment>,
    samples: BTreeMap<String, NewSample>,
    data_sets: BTreeMap<DataSetCode, NewDataSet>,
    registrations: HashMap<String, EntityOperationsState>,
    calls: Vec<AtomicEntityOperations>,
    pending_failures: Vec<InjectedFailure>,
    unreachable: bool,
}

#[derive(Default)]
pub struct InMemoryRegistry {
    state: Mutex<State>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that already knows the given experiments/samples
    pub fn with_owners<I, S>(owners: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = State {
            owners: owners.into_iter().map(Into::into).collect(),
            ..State::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn add_owner(&self, identifier: impl Into<String>) {
        self.state.lock().await.owners.insert(identifier.into());
    }

    /// Make the next entity-operations call fail
    pub async fn fail_next_operation(&self, failure: InjectedFailure) {
        self.state.lock().await.pending_failures.push(failure);
    }

    /// Toggle answering every call as unreachable
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }

    /// Pretend a batch was left half-way by the registry
    pub async fn mark_in_progress(&self, registration_id: impl Into<String>) {
        self.state
            .lock()
            .await
            .registrations
            .insert(registration_id.into(), EntityOperationsState::InProgress);
    }

    pub async fn data_set(&self, code: &DataSetCode) -> Option<NewDataSet> {
        self.state.lock().await.data_sets.get(code).cloned()
    }

    pub async fn data_sets(&self) -> Vec<NewDataSet> {
        self.state.lock().await.data_sets.values().cloned().collect()
    }

    pub async fn experiment_count(&self) -> usize {
        self.state.lock().await.experiments.len()
    }

    pub async fn sample_count(&self) -> usize {
        self.state.lock().await.samples.len()
    }

    /// Every batch received, including rejected ones
    pub async fn calls(&self) -> Vec<AtomicEntityOperations> {
        self.state.lock().await.calls.clone()
    }

    fn validate(state: &State, operations: &AtomicEntityOperations) -> Result<()> {
        let mut new_owners: BTreeSet<String> = BTreeSet::new();
        for experiment in &operations.experiments {
            let id = experiment.identifier.to_string();
            if state.owners.contains(&id) || !new_owners.insert(id.clone()) {
                return Err(RegistrationError::RegistryRejected(format!("experiment {} already exists", id)));
            }
        }
        for sample in &operations.samples {
            let id = sample.identifier.to_string();
            if state.owners.contains(&id) || !new_owners.insert(id.clone()) {
                return Err(RegistrationError::RegistryRejected(format!("sample {} already exists", id)));
            }
        }

        let mut codes = BTreeSet::new();
        for data_set in &operations.data_sets {
            if state.data_sets.contains_key(&data_set.code) || !codes.insert(data_set.code.clone()) {
                return Err(RegistrationError::RegistryRejected(format!(
                    "data set {} already exists",
                    data_set.code
                )));
            }
            if let Some(owner) = data_set.owner_identifier() {
                if !state.owners.contains(&owner) && !new_owners.contains(&owner) {
                    return Err(RegistrationError::RegistryRejected(format!(
                        "owner {} of data set {} does not exist",
                        owner, data_set.code
                    )));
                }
            }
            for contained in &data_set.contained_codes {
                if !codes.contains(contained) && !state.data_sets.contains_key(contained) {
                    return Err(RegistrationError::RegistryRejected(format!(
                        "container {} references unknown data set {}",
                        data_set.code, contained
                    )));
                }
            }
        }
        Ok(())
    }

    fn apply(state: &mut State, operations: &AtomicEntityOperations) -> Result<AtomicEntityOperationResult> {
        if state.registrations.get(&operations.registration_id) == Some(&EntityOperationsState::Succeeded) {
            return Err(RegistrationError::RegistryRejected(format!(
                "registration {} was already performed",
                operations.registration_id
            )));
        }

        Self::validate(state, operations)?;

        for experiment in &operations.experiments {
            let id = experiment.identifier.to_string();
            state.owners.insert(id.clone());
            state.experiments.insert(id, experiment.clone());
        }
        for sample in &operations.samples {
            let id = sample.identifier.to_string();
            state.owners.insert(id.clone());
            state.samples.insert(id, sample.clone());
        }
        for data_set in &operations.data_sets {
            state.data_sets.insert(data_set.code.clone(), data_set.clone());
        }
        state
            .registrations
            .insert(operations.registration_id.clone(), EntityOperationsState::Succeeded);

        Ok(AtomicEntityOperationResult {
            registration_id: operations.registration_id.clone(),
            experiments_created: operations.experiments.len(),
            samples_created: operations.samples.len(),
            data_sets_created: operations.data_sets.len(),
        })
    }
}

fn lost_response() -> RegistrationError {
    RegistrationError::RegistryUnavailable("injected: response lost".into())
}

#[async_trait]
impl MetadataRegistry for InMemoryRegistry {
    async fn create_data_set_code(&self) -> Result<DataSetCode> {
        let mut state = self.state.lock().await;
        if state.unreachable {
            return Err(RegistrationError::RegistryUnavailable("registry is unreachable".into()));
        }
        state.next_code += 1;
        let code = format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S%3f"), state.next_code);
        Ok(DataSetCode::new(code)?)
    }

    async fn owner_exists(&self, identifier: &str) -> Result<bool> {
        let state = self.state.lock().await;
        if state.unreachable {
            return Err(RegistrationError::RegistryUnavailable("registry is unreachable".into()));
        }
        Ok(state.owners.contains(identifier))
    }

    async fn perform_entity_operations(
        &self,
        operations: &AtomicEntityOperations,
    ) -> Result<AtomicEntityOperationResult> {
        let mut state = self.state.lock().await;
        state.calls.push(operations.clone());

        if state.unreachable {
            return Err(RegistrationError::RegistryUnavailable("registry is unreachable".into()));
        }
        if state.pending_failures.is_empty() {
            return Self::apply(&mut state, operations);
        }
        match state.pending_failures.remove(0) {
            InjectedFailure::Unavailable => Err(RegistrationError::RegistryUnavailable(
                "injected: connection reset".into(),
            )),
            InjectedFailure::Rejected => Err(RegistrationError::RegistryRejected(
                "injected: batch rejected".into(),
            )),
            InjectedFailure::LostResponse => {
                Self::apply(&mut state, operations)?;
                Err(lost_response())
            },
            InjectedFailure::LeftInProgress => {
                state
                    .registrations
                    .insert(operations.registration_id.clone(), EntityOperationsState::InProgress);
                Err(lost_response())
            },
            InjectedFailure::WentUnreachable => {
                state.unreachable = true;
                Err(lost_response())
            },
        }
    }

    async fn entity_operations_state(&self, registration_id: &str) -> Result<EntityOperationsState> {
        let state = self.state.lock().await;
        if state.unreachable {
            return Err(RegistrationError::RegistryUnavailable("registry is unreachable".into()));
        }
        Ok(state
            .registrations
            .get(registration_id)
            .copied()
            .unwrap_or(EntityOperationsState::NoOperation))
    }

    async fn health(&self) -> Result<()> {
        if self.state.lock().await.unreachable {
            return Err(RegistrationError::RegistryUnavailable("registry is unreachable".into()));
        }
        Ok(())
    }
}
