use crate::error::{RegistrationError, Result};
use crate::registry::MetadataRegistry;
use serde::{Deserialize, Serialize};

/// How a data set relates to its owner in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageStrategy {
    /// The owner must already be registered; checked before staging
    OwnerExists,
    /// The owner is created by the same transaction; no lookup
    IdentifiedOwner,
}

impl StorageStrategy {
    /// Run the registry lookup this strategy requires for `owner`
    pub async fn verify_owner(
        &self,
        owner: Option<&str>,
        registry: &dyn MetadataRegistry,
    ) -> Result<()> {
        match (self, owner) {
            (StorageStrategy::IdentifiedOwner, _) | (StorageStrategy::OwnerExists, None) => Ok(()),
            (StorageStrategy::OwnerExists, Some(owner)) => {
                if registry.owner_exists(owner).await? {
                    Ok(())
                } else {
                    Err(RegistrationError::OwnerNotFound(owner.to_string()))
                }
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;

    #[tokio::test]
    async fn test_owner_lookup_only_for_owner_exists() {
        let registry = InMemoryRegistry::with_owners(["/TEST/S1"]);

        StorageStrategy::OwnerExists
            .verify_owner(Some("/TEST/S1"), &registry)
            .await
            .unwrap();
        let err = StorageStrategy::OwnerExists
            .verify_owner(Some("/TEST/S9"), &registry)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::OwnerNotFound(_)));

        registry.set_unreachable(true).await;
        StorageStrategy::IdentifiedOwner
            .verify_owner(Some("/TEST/S9"), &registry)
            .await
            .unwrap();
    }
}
