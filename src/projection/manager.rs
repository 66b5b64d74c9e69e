use std::sync::Arc;

use crate::projection::{ProjectionStatus, Projector, ReadModel, ReadModelProjector};
use crate::store::{EventStore, StoreError};

/// Registry and control channel for projectors.
///
/// The manager never invokes a projector directly: control operations write
/// a status on the projection record, and the running projector polls and
/// reacts at its next poll point.
#[derive(Clone)]
pub struct ProjectionManager {
    store: EventStore,
}

impl ProjectionManager {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }

    pub(crate) fn store(&self) -> &EventStore {
        &self.store
    }

    /// Returns a projector bound to this manager and store.
    pub fn create_projector(&self, name: impl Into<String>) -> Projector {
        Projector::new(self.clone(), name.into())
    }

    /// Returns a read-model projector bound to this manager and store.
    pub fn create_read_model_projector(
        &self,
        name: impl Into<String>,
        read_model: Arc<dyn ReadModel>,
    ) -> ReadModelProjector {
        ReadModelProjector::new(self.clone(), name.into(), read_model)
    }

    /// Current status of the projection record.
    ///
    /// Fails open: a back-end error or a missing record reads as `Running`,
    /// so a transient fault does not stop a healthy projector.
    pub async fn fetch_projection_status(&self, name: &str) -> ProjectionStatus {
        match self.store.persistence().fetch_projection(name).await {
            Ok(Some(record)) => record.status,
            Ok(None) => ProjectionStatus::Running,
            Err(error) => {
                tracing::warn!(projection = name, error = %error, "failed to fetch projection status");
                ProjectionStatus::Running
            }
        }
    }

    pub async fn fetch_projection_names(&self) -> Result<Vec<String>, StoreError> {
        self.store.persistence().fetch_projection_names().await
    }

    pub async fn idle_projection(&self, name: &str) -> Result<(), StoreError> {
        self.update_status(name, ProjectionStatus::Idle).await
    }

    /// Asks the projection to stop at its next poll point.
    pub async fn stop_projection(&self, name: &str) -> Result<(), StoreError> {
        self.update_status(name, ProjectionStatus::Stopping).await
    }

    /// Asks the projection to clear its checkpoint and start over.
    pub async fn reset_projection(&self, name: &str) -> Result<(), StoreError> {
        self.update_status(name, ProjectionStatus::Resetting).await
    }

    /// Asks the projection to delete itself, optionally including the
    /// stream it emitted.
    pub async fn delete_projection(&self, name: &str, incl_emitted: bool) -> Result<(), StoreError> {
        let status = if incl_emitted {
            ProjectionStatus::DeletingInclEmittedEvents
        } else {
            ProjectionStatus::Deleting
        };
        self.update_status(name, status).await
    }

    async fn update_status(&self, name: &str, status: ProjectionStatus) -> Result<(), StoreError> {
        self.store
            .persistence()
            .update_projection_status(name, status)
            .await
    }
}
