//! Registration details and the factories that build them

use crate::config::DetailsConfig;
use crate::dataset_file::DataSetFile;
use crate::error::{RegistrationError, Result};
use dss_common::types::{DataSetCode, ExperimentIdentifier, SampleIdentifier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Metadata describing one data set to create. Immutable once handed to a
/// storage algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationDetails {
    pub experiment: Option<ExperimentIdentifier>,
    pub sample: Option<SampleIdentifier>,
    pub data_set_type: String,
    pub properties: BTreeMap<String, String>,
    pub parent_codes: Vec<DataSetCode>,
    pub is_container: bool,
}

impl RegistrationDetails {
    pub fn new(data_set_type: impl Into<String>) -> Self {
        Self {
            experiment: None,
            sample: None,
            data_set_type: data_set_type.into(),
            properties: BTreeMap::new(),
            parent_codes: Vec::new(),
            is_container: false,
        }
    }

    pub fn with_experiment(mut self, experiment: ExperimentIdentifier) -> Self {
        self.experiment = Some(experiment);
        self
    }

    pub fn with_sample(mut self, sample: SampleIdentifier) -> Self {
        self.sample = Some(sample);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_parent(mut self, code: DataSetCode) -> Self {
        self.parent_codes.push(code);
        self
    }

    pub fn container(mut self) -> Self {
        self.is_container = true;
        self
    }

    /// Identifier of the entity owning the data set; the sample wins over
    /// the experiment.
    pub fn owner_identifier(&self) -> Option<String> {
        self.sample
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| self.experiment.as_ref().map(ToString::to_string))
    }
}

/// Builds registration details for a delivery
pub trait DetailsFactory: Send + Sync {
    /// Details for one plain data set built from `file`
    fn create_details(&self, file: &Path) -> Result<RegistrationDetails>;

    /// Details for the container grouping several data sets of `file`
    fn create_container_details(&self, file: &Path) -> Result<RegistrationDetails> {
        Ok(self.create_details(file)?.container())
    }

    /// Convenience for whole deliveries
    fn create_for_delivery(&self, file: &DataSetFile) -> Result<RegistrationDetails> {
        self.create_details(file.real_incoming_path())
    }
}

/// Parses `PROJECT.EXPERIMENT==SAMPLE` delivery names.
///
/// A trailing extension on the sample part (`...==S1.csv`) is ignored. Space
/// and data set type come from configuration.
#[derive(Debug, Clone)]
pub struct DefaultDetailsFactory {
    space: String,
    data_set_type: String,
}

impl DefaultDetailsFactory {
    pub fn new(config: &DetailsConfig) -> Self {
        Self {
            space: config.space.clone(),
            data_set_type: config.data_set_type.clone(),
        }
    }

    fn parse_name(&self, name: &str) -> Result<(ExperimentIdentifier, SampleIdentifier)> {
        let invalid = || {
            RegistrationError::invalid_content(format!(
                "'{}' does not follow the PROJECT.EXPERIMENT==SAMPLE naming convention",
                name
            ))
        };

        let (experiment_part, sample_part) = name.split_once("==").ok_or_else(invalid)?;
        let (project, experiment) = experiment_part.split_once('.').ok_or_else(invalid)?;
        let sample = sample_part.split('.').next().unwrap_or_default();
        if project.is_empty() || experiment.is_empty() || sample.is_empty() {
            return Err(invalid());
        }

        let experiment = ExperimentIdentifier::new(&self.space, project, experiment)
            .map_err(|e| RegistrationError::invalid_content(e.to_string()))?;
        let sample = SampleIdentifier::new(&self.space, sample)
            .map_err(|e| RegistrationError::invalid_content(e.to_string()))?;
        Ok((experiment, sample))
    }
}

impl DetailsFactory for DefaultDetailsFactory {
    fn create_details(&self, file: &Path) -> Result<RegistrationDetails> {
        let name = crate::fs_ops::file_name(file)?;
        let (experiment, sample) = self.parse_name(&name)?;
        Ok(RegistrationDetails::new(&self.data_set_type)
            .with_experiment(experiment)
            .with_sample(sample))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn factory() -> DefaultDetailsFactory {
        DefaultDetailsFactory::new(&DetailsConfig {
            space: "TEST".to_string(),
            data_set_type: "HCS_IMAGE".to_string(),
        })
    }

    #[test]
    fn test_parses_delivery_name() {
        let details = factory()
            .create_details(Path::new("/incoming/NEMO.EXP1==CP001A-3AB"))
            .unwrap();
        assert_eq!(details.experiment.unwrap().to_string(), "/TEST/NEMO/EXP1");
        assert_eq!(details.sample.as_ref().unwrap().to_string(), "/TEST/CP001A-3AB");
        assert_eq!(details.data_set_type, "HCS_IMAGE");
        assert!(!details.is_container);
    }

    #[test]
    fn test_extension_on_sample_is_ignored() {
        let details = factory().create_details(Path::new("NEMO.EXP1==S1.csv")).unwrap();
        assert_eq!(details.owner_identifier().unwrap(), "/TEST/S1");
    }

    #[test]
    fn test_bad_names_are_content_errors() {
        for name in ["data.csv", "NEMO==S1", ".EXP1==S1", "NEMO.EXP1==", "NEMO.EXP 1==S1"] {
            let err = factory().create_details(Path::new(name)).unwrap_err();
            assert_eq!(err.class(), dss_common::ErrorClass::Content, "{}", name);
        }
    }

    #[test]
    fn test_container_details() {
        let details = factory()
            .create_container_details(Path::new("NEMO.EXP1==S1"))
            .unwrap();
        assert!(details.is_container);
    }
}
