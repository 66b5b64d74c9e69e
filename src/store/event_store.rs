use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::aggregate::Aggregate;
use crate::event::Event;
use crate::matcher::MetadataMatcher;
use crate::middleware::{EventAction, Middleware, MiddlewareIterator};
use crate::projection::{ProjectionManager, Projector, ProjectorError, ReadModelProjector};
use crate::registry::Registry;
use crate::repository::{AggregateRepository, RepositoryError};
use crate::store::memory::InMemoryWriteLock;
use crate::store::{PersistenceStrategy, StoreError, StreamRequest, WriteLockStrategy};
use crate::types::EventNumber;

/// The event store facade.
///
/// Orchestrates streams, the append middleware chain, aggregate
/// repositories and the projection registry over a pluggable
/// [`PersistenceStrategy`]. The facade is a cheap cloneable handle: clones
/// share one inner store, so repositories and projectors created from it
/// all observe the same data.
pub struct EventStore {
    pub(crate) inner: Arc<InnerEventStore>,
}

pub(crate) struct InnerEventStore {
    pub(crate) persistence: Box<dyn PersistenceStrategy>,
    pub(crate) locks: Arc<dyn WriteLockStrategy>,
    pre_append: Vec<Arc<dyn Middleware>>,
    appended: Vec<Arc<dyn Middleware>>,
    append_errored: Vec<Arc<dyn Middleware>>,
    loaded: Vec<Arc<dyn Middleware>>,
    aggregates: RwLock<HashMap<&'static str, String>>,
    projectors: RwLock<HashMap<String, Projector>>,
    read_model_projectors: RwLock<HashMap<String, ReadModelProjector>>,
}

impl Clone for EventStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore").finish_non_exhaustive()
    }
}

impl EventStore {
    pub(crate) fn persistence(&self) -> &dyn PersistenceStrategy {
        self.inner.persistence.as_ref()
    }

    /// Creates the `event_streams` and `projections` tables. Idempotent.
    pub async fn install(&self) -> Result<(), StoreError> {
        self.inner.persistence.create_event_streams_table().await?;
        self.inner.persistence.create_projections_table().await
    }

    /// Registers the stream, then creates its physical storage.
    ///
    /// A duplicate registration is logged and swallowed so bootstrapping
    /// stays idempotent. When schema creation fails the registration is
    /// rolled back and a schema drop attempted before the original error
    /// surfaces.
    #[tracing::instrument(skip(self), err)]
    pub async fn create_stream(&self, stream: &str) -> Result<(), StoreError> {
        match self
            .inner
            .persistence
            .add_stream_to_streams_table(stream)
            .await
        {
            Ok(()) => {}
            Err(error @ StoreError::StreamAlreadyExists(_)) => {
                tracing::warn!(stream, error = %error, "stream already registered, skipping creation");
                return Ok(());
            }
            Err(error) => return Err(error),
        }

        if let Err(error) = self.inner.persistence.create_schema(stream).await {
            if let Err(rollback) = self
                .inner
                .persistence
                .remove_stream_from_streams_table(stream)
                .await
            {
                tracing::error!(stream, error = %rollback, "failed to roll back stream registration");
            }
            if let Err(drop) = self.inner.persistence.drop_schema(stream).await {
                tracing::warn!(stream, error = %drop, "failed to drop partially created schema");
            }
            return Err(error);
        }

        Ok(())
    }

    /// Removes the stream registration and drops its storage. Fails with
    /// [`StoreError::StreamNotFound`] for unknown names.
    pub async fn delete_stream(&self, stream: &str) -> Result<(), StoreError> {
        self.inner
            .persistence
            .remove_stream_from_streams_table(stream)
            .await?;
        self.inner.persistence.drop_schema(stream).await
    }

    pub async fn has_stream(&self, stream: &str) -> Result<bool, StoreError> {
        self.inner.persistence.has_stream(stream).await
    }

    pub async fn fetch_stream_names(&self) -> Result<Vec<String>, StoreError> {
        self.inner.persistence.fetch_stream_names().await
    }

    /// Appends a batch to the stream. No-op for an empty batch.
    ///
    /// `PreAppend` middleware runs sequentially per event and may substitute
    /// it; a failure there aborts the whole append. After the back-end
    /// accepts the batch, `Appended` middleware observes every persisted
    /// event; on back-end failure `AppendErrored` middleware observes the
    /// batch and the original error is re-raised. Observer failures are
    /// logged, never propagated.
    #[tracing::instrument(skip(self, events), fields(count = events.len()), err)]
    pub async fn append_to(&self, stream: &str, events: Vec<Event>) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut prepared = Vec::with_capacity(events.len());
        for mut event in events {
            for middleware in &self.inner.pre_append {
                event = middleware
                    .handle(event)
                    .await
                    .map_err(StoreError::Middleware)?;
            }
            prepared.push(event);
        }

        let pending = prepared.clone();
        match self.inner.persistence.append_to(stream, prepared).await {
            Ok(persisted) => {
                self.observe(&self.inner.appended, &persisted).await;
                Ok(())
            }
            Err(error) => {
                self.observe(&self.inner.append_errored, &pending).await;
                Err(error)
            }
        }
    }

    async fn observe(&self, observers: &[Arc<dyn Middleware>], events: &[Event]) {
        for event in events {
            for observer in observers {
                if let Err(error) = observer.handle(event.clone()).await {
                    tracing::error!(
                        middleware = observer.name(),
                        event = event.name(),
                        error = %error,
                        "observer middleware failed"
                    );
                }
            }
        }
    }

    /// Lazy sequence over one stream from the given position, wrapped so
    /// every pulled event passes through the `Loaded` middleware chain.
    pub async fn load(
        &self,
        stream: &str,
        from: EventNumber,
        matcher: Option<MetadataMatcher>,
    ) -> Result<MiddlewareIterator, StoreError> {
        let events = self
            .inner
            .persistence
            .load(stream, from, None, matcher.as_ref())
            .await?;
        Ok(MiddlewareIterator::new(events, self.inner.loaded.clone()))
    }

    /// Time-ordered merge across streams, with the same `Loaded` middleware
    /// wrapping as [`load`](Self::load).
    pub async fn merge_and_load(
        &self,
        requests: Vec<StreamRequest>,
    ) -> Result<MiddlewareIterator, StoreError> {
        let events = self.inner.persistence.merge_and_load(requests).await?;
        Ok(MiddlewareIterator::new(events, self.inner.loaded.clone()))
    }

    /// Binds the aggregate type to a stream and returns a repository for
    /// it. Repeated calls for the same aggregate type replace the prior
    /// binding.
    pub async fn create_repository<A: Aggregate>(
        &self,
        stream: impl Into<String>,
    ) -> AggregateRepository<A> {
        let stream = stream.into();
        self.inner
            .aggregates
            .write()
            .await
            .insert(A::NAME, stream.clone());
        AggregateRepository::new(self.clone(), stream)
    }

    /// Returns a repository for a registry-declared aggregate binding.
    pub async fn repository<A: Aggregate>(&self) -> Result<AggregateRepository<A>, RepositoryError> {
        let stream = self
            .inner
            .aggregates
            .read()
            .await
            .get(A::NAME)
            .cloned()
            .ok_or_else(|| RepositoryError::AggregateNotRegistered(A::NAME))?;
        Ok(AggregateRepository::new(self.clone(), stream))
    }

    /// Returns the pre-instantiated projector registered under the name.
    pub async fn get_projector(&self, name: &str) -> Result<Projector, StoreError> {
        self.inner
            .projectors
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::ProjectionNotFound(name.to_string()))
    }

    /// Returns the pre-instantiated read-model projector registered under
    /// the name.
    pub async fn get_read_model_projector(
        &self,
        name: &str,
    ) -> Result<ReadModelProjector, StoreError> {
        self.inner
            .read_model_projectors
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::ProjectionNotFound(name.to_string()))
    }
}

/// Builds an [`EventStore`] from a persistence strategy, an optional write
/// lock strategy and a [`Registry`].
///
/// `try_build` instantiates every registered projection eagerly, so
/// build-phase mistakes (double `init`, missing handlers and the like)
/// surface at configuration time rather than on first run.
pub struct EventStoreBuilder {
    persistence: Box<dyn PersistenceStrategy>,
    locks: Arc<dyn WriteLockStrategy>,
    registry: Registry,
}

impl EventStoreBuilder {
    pub fn new(persistence: impl PersistenceStrategy + 'static) -> Self {
        Self {
            persistence: Box::new(persistence),
            locks: Arc::new(InMemoryWriteLock::new()),
            registry: Registry::new(),
        }
    }

    #[must_use]
    pub fn with_write_lock(mut self, locks: impl WriteLockStrategy + 'static) -> Self {
        self.locks = Arc::new(locks);
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub async fn try_build(self) -> Result<EventStore, ProjectorError> {
        let mut pre_append = Vec::new();
        let mut appended = Vec::new();
        let mut append_errored = Vec::new();
        let mut loaded = Vec::new();
        for (action, middleware) in self.registry.middleware {
            match action {
                EventAction::PreAppend => pre_append.push(middleware),
                EventAction::Appended => appended.push(middleware),
                EventAction::AppendErrored => append_errored.push(middleware),
                EventAction::Loaded => loaded.push(middleware),
            }
        }

        let store = EventStore {
            inner: Arc::new(InnerEventStore {
                persistence: self.persistence,
                locks: self.locks,
                pre_append,
                appended,
                append_errored,
                loaded,
                aggregates: RwLock::new(self.registry.aggregates.into_iter().collect()),
                projectors: RwLock::new(HashMap::new()),
                read_model_projectors: RwLock::new(HashMap::new()),
            }),
        };

        let manager = ProjectionManager::new(store.clone());
        for definition in self.registry.projections {
            let mut projector = manager.create_projector(definition.name.as_str());
            (definition.setup)(&mut projector)?;
            store
                .inner
                .projectors
                .write()
                .await
                .insert(definition.name, projector);
        }
        for definition in self.registry.read_model_projections {
            let mut projector = manager
                .create_read_model_projector(definition.name.as_str(), definition.read_model);
            (definition.setup)(&mut projector)?;
            store
                .inner
                .read_model_projectors
                .write()
                .await
                .insert(definition.name, projector);
        }

        Ok(store)
    }
}
