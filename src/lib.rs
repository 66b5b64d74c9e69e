//! An event-sourcing engine built around three pieces: an append-only
//! [`EventStore`] with ordered, matcher-filterable streams and an append
//! middleware chain; an [`AggregateRepository`] reconstructing aggregate
//! state by replay with optimistic version control; and a projection
//! runtime ([`Projector`], [`ReadModelProjector`], [`ProjectionManager`])
//! folding streams into durable, resumable derived state.
//!
//! Persistence is pluggable through [`PersistenceStrategy`]; the crate
//! ships an in-memory back-end ([`InMemoryStore`]) sharing one dataset
//! across clones.

pub mod aggregate;
pub mod event;
pub mod matcher;
pub mod middleware;
pub mod projection;
pub mod registry;
pub mod repository;
pub mod store;
pub mod types;

pub use crate::aggregate::{Aggregate, AggregateRoot};
pub use crate::event::{Event, Metadata};
pub use crate::matcher::{FieldType, MetadataMatcher, Operation};
pub use crate::middleware::{
    EventAction, Middleware, MiddlewareError, MiddlewareFn, MiddlewareIterator,
};
pub use crate::projection::{
    EventHandlers, ProjectionManager, ProjectionRecord, ProjectionStatus, Projector,
    ProjectorContext, ProjectorError, ReadModel, ReadModelContext, ReadModelError,
    ReadModelHandlers, ReadModelProjector, StreamSource,
};
pub use crate::registry::Registry;
pub use crate::repository::{AggregateRepository, RepositoryError};
pub use crate::store::memory::{InMemoryStore, InMemoryWriteLock};
pub use crate::store::{
    EventStore, EventStoreBuilder, EventStream, PersistenceStrategy, StoreError, StreamRequest,
    WriteLockStrategy,
};
pub use crate::types::{EventNumber, Version};
