//! HTTP client for the metadata registry
//!
//! Every response is wrapped in `{success, data, error}`. Connection failures
//! and 5xx answers are environment failures (retry-eligible); 4xx answers and
//! `success: false` are content failures.

use super::{
    AtomicEntityOperationResult, AtomicEntityOperations, EntityOperationsState, MetadataRegistry,
};
use crate::error::{RegistrationError, Result};
use async_trait::async_trait;
use dss_common::types::DataSetCode;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

// ============================================================================
// Endpoints
// ============================================================================

pub mod endpoints {
    pub fn entity_operations_url(base_url: &str) -> String {
        format!("{}/api/v1/entity-operations", base_url)
    }

    pub fn entity_operations_state_url(base_url: &str, registration_id: &str) -> String {
        format!(
            "{}/api/v1/entity-operations/{}",
            base_url,
            urlencoding::encode(registration_id)
        )
    }

    pub fn data_set_codes_url(base_url: &str) -> String {
        format!("{}/api/v1/data-set-codes", base_url)
    }

    pub fn owners_url(base_url: &str, identifier: &str) -> String {
        format!(
            "{}/api/v1/owners?identifier={}",
            base_url,
            urlencoding::encode(identifier)
        )
    }

    pub fn health_url(base_url: &str) -> String {
        format!("{}/health", base_url)
    }
}

/// Envelope of every registry response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CodeResponse {
    pub code: DataSetCode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OwnerResponse {
    pub exists: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateResponse {
    pub state: EntityOperationsState,
}

pub struct RegistryClient {
    client: Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistrationError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn unwrap_response<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        let status = response.status();

        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistrationError::RegistryUnavailable(format!(
                "{} failed with {}: {}",
                what, status, body
            )));
        }

        if status.is_client_error() {
            let message = match response.json::<ApiResponse<serde_json::Value>>().await {
                Ok(ApiResponse { error: Some(error), .. }) => error,
                _ => status.to_string(),
            };
            return Err(RegistrationError::RegistryRejected(format!("{}: {}", what, message)));
        }

        let api_response: ApiResponse<T> = response.json().await.map_err(|e| {
            RegistrationError::RegistryUnavailable(format!("{} returned an unreadable body: {}", what, e))
        })?;

        if !api_response.success {
            return Err(RegistrationError::RegistryRejected(format!(
                "{}: {}",
                what,
                api_response.error.unwrap_or_else(|| "no reason given".to_string())
            )));
        }

        api_response.data.ok_or_else(|| {
            RegistrationError::RegistryUnavailable(format!("{} returned no data", what))
        })
    }
}

#[async_trait]
impl MetadataRegistry for RegistryClient {
    async fn create_data_set_code(&self) -> Result<DataSetCode> {
        let url = endpoints::data_set_codes_url(&self.base_url);
        let response = self.client.post(&url).send().await?;
        let body: CodeResponse = Self::unwrap_response(response, "Data set code allocation").await?;
        Ok(body.code)
    }

    async fn owner_exists(&self, identifier: &str) -> Result<bool> {
        let url = endpoints::owners_url(&self.base_url, identifier);
        let response = self.client.get(&url).send().await?;
        let body: OwnerResponse = Self::unwrap_response(response, "Owner lookup").await?;
        Ok(body.exists)
    }

    async fn perform_entity_operations(
        &self,
        operations: &AtomicEntityOperations,
    ) -> Result<AtomicEntityOperationResult> {
        let url = endpoints::entity_operations_url(&self.base_url);
        debug!(
            registration_id = %operations.registration_id,
            data_sets = operations.data_sets.len(),
            "Sending entity operations"
        );
        let response = self.client.post(&url).json(operations).send().await?;
        Self::unwrap_response(response, "Entity operations").await
    }

    async fn entity_operations_state(&self, registration_id: &str) -> Result<EntityOperationsState> {
        let url = endpoints::entity_operations_state_url(&self.base_url, registration_id);
        let response = self.client.get(&url).send().await?;
        let body: StateResponse = Self::unwrap_response(response, "Entity operations state").await?;
        Ok(body.state)
    }

    async fn health(&self) -> Result<()> {
        let url = endpoints::health_url(&self.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RegistrationError::RegistryUnavailable(format!(
                "Health check returned {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::endpoints;

    #[test]
    fn test_endpoint_urls() {
        assert_eq!(
            endpoints::entity_operations_url("http://reg:8888"),
            "http://reg:8888/api/v1/entity-operations"
        );
        assert_eq!(
            endpoints::owners_url("http://reg:8888", "/TEST/CP001A-3AB"),
            "http://reg:8888/api/v1/owners?identifier=%2FTEST%2FCP001A-3AB"
        );
        assert_eq!(
            endpoints::entity_operations_state_url("http://reg:8888", "r 1"),
            "http://reg:8888/api/v1/entity-operations/r%201"
        );
    }
}
