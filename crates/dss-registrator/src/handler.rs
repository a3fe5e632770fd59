//! Delivery handlers
//!
//! A handler decides what a delivery becomes: it opens transactions on the
//! registration service and fills them with data sets and entities. It does
//! not commit; the registrator commits or aborts depending on the result.

use crate::config::HandlerKind;
use crate::dataset_file::DataSetFile;
use crate::error::{RegistrationError, Result};
use crate::fs_ops;
use crate::service::RegistrationService;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, file: &DataSetFile, service: &mut RegistrationService) -> Result<()>;
}

pub fn handler_for(kind: HandlerKind) -> Arc<dyn DeliveryHandler> {
    match kind {
        HandlerKind::Plain => Arc::new(PlainDeliveryHandler),
        HandlerKind::Container => Arc::new(ContainerDeliveryHandler),
    }
}

/// Registers the whole delivery as one data set
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainDeliveryHandler;

#[async_trait]
impl DeliveryHandler for PlainDeliveryHandler {
    async fn handle(&self, file: &DataSetFile, service: &mut RegistrationService) -> Result<()> {
        let incoming = file.real_incoming_path();
        let id = service.transaction(Some(incoming), None)?;
        let transaction = service
            .transaction_mut(id)
            .ok_or_else(|| RegistrationError::invalid_argument(format!("Unknown transaction {}", id)))?;
        transaction.create_new_data_set_from_file(incoming).await?;
        Ok(())
    }
}

/// Registers a directory delivery as a container holding one data set per
/// top-level entry. Plain files are registered as a single data set.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContainerDeliveryHandler;

#[async_trait]
impl DeliveryHandler for ContainerDeliveryHandler {
    async fn handle(&self, file: &DataSetFile, service: &mut RegistrationService) -> Result<()> {
        let incoming = file.real_incoming_path();
        if !incoming.is_dir() {
            return PlainDeliveryHandler.handle(file, service).await;
        }

        let id = service.transaction(Some(incoming), None)?;
        let transaction = service
            .transaction_mut(id)
            .ok_or_else(|| RegistrationError::invalid_argument(format!("Unknown transaction {}", id)))?;

        let factory = Arc::clone(transaction.details_factory());
        let container_details = factory.create_container_details(incoming)?;
        let child_details = factory.create_details(incoming)?;

        // Take the delivery into the workspace first so the incoming
        // directory disappears as a whole.
        let workspace_copy = transaction.move_file(incoming, &fs_ops::file_name(incoming)?)?;

        let mut entries: Vec<_> = std::fs::read_dir(&workspace_copy)
            .map_err(|e| RegistrationError::io("Failed to list delivery", &workspace_copy, e))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<_>>()
            .map_err(|e| RegistrationError::io("Failed to list delivery", &workspace_copy, e))?;
        entries.sort();
        if entries.is_empty() {
            return Err(RegistrationError::invalid_content(format!(
                "Delivery '{}' is an empty directory",
                incoming.display()
            )));
        }

        let container = transaction.create_new_data_set(container_details, None).await?;
        for entry in &entries {
            let child = transaction
                .add_contained_data_set(&container, child_details.clone(), entry)
                .await?;
            debug!(container = %container, child = %child, entry = %entry.display(), "Added child data set");
        }
        Ok(())
    }
}
