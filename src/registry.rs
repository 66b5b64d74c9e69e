use std::sync::Arc;

use crate::aggregate::Aggregate;
use crate::middleware::{EventAction, Middleware};
use crate::projection::{Projector, ProjectorError, ReadModel, ReadModelProjector};

pub(crate) type ProjectionSetup = Box<dyn Fn(&mut Projector) -> Result<(), ProjectorError> + Send + Sync>;
pub(crate) type ReadModelProjectionSetup =
    Box<dyn Fn(&mut ReadModelProjector) -> Result<(), ProjectorError> + Send + Sync>;

pub(crate) struct ProjectionDefinition {
    pub(crate) name: String,
    pub(crate) setup: ProjectionSetup,
}

pub(crate) struct ReadModelProjectionDefinition {
    pub(crate) name: String,
    pub(crate) read_model: Arc<dyn ReadModel>,
    pub(crate) setup: ReadModelProjectionSetup,
}

/// Configuration-time inventory consumed by
/// [`EventStoreBuilder`](crate::store::EventStoreBuilder): aggregate stream
/// bindings, projection definitions, read-model projection definitions and
/// middleware registrations bucketed by [`EventAction`].
#[derive(Default)]
pub struct Registry {
    pub(crate) aggregates: Vec<(&'static str, String)>,
    pub(crate) projections: Vec<ProjectionDefinition>,
    pub(crate) read_model_projections: Vec<ReadModelProjectionDefinition>,
    pub(crate) middleware: Vec<(EventAction, Arc<dyn Middleware>)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the aggregate type tag to the stream its repository works on.
    #[must_use]
    pub fn aggregate<A: Aggregate>(mut self, stream: impl Into<String>) -> Self {
        self.aggregates.push((A::NAME, stream.into()));
        self
    }

    /// Registers a projection. The setup closure configures a fresh
    /// projector (`init`, source selection, handlers) and runs once, eagerly,
    /// when the store is built.
    #[must_use]
    pub fn projection(
        mut self,
        name: impl Into<String>,
        setup: impl Fn(&mut Projector) -> Result<(), ProjectorError> + Send + Sync + 'static,
    ) -> Self {
        self.projections.push(ProjectionDefinition {
            name: name.into(),
            setup: Box::new(setup),
        });
        self
    }

    /// Registers a projection driving an external read model.
    #[must_use]
    pub fn read_model_projection(
        mut self,
        name: impl Into<String>,
        read_model: Arc<dyn ReadModel>,
        setup: impl Fn(&mut ReadModelProjector) -> Result<(), ProjectorError> + Send + Sync + 'static,
    ) -> Self {
        self.read_model_projections.push(ReadModelProjectionDefinition {
            name: name.into(),
            read_model,
            setup: Box::new(setup),
        });
        self
    }

    /// Registers a middleware under one of the event actions.
    #[must_use]
    pub fn middleware(mut self, action: EventAction, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push((action, Arc::new(middleware)));
        self
    }
}
