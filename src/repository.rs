use std::marker::PhantomData;

use futures::StreamExt;
use serde_json::Value;

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::event::AGGREGATE_ID;
use crate::matcher::{MetadataMatcher, Operation};
use crate::store::{EventStore, StoreError};
use crate::types::Version;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// `get` found no events for the id.
    #[error("aggregate `{0}` was not found")]
    AggregateNotFound(String),
    /// No stream binding registered for the aggregate type.
    #[error("aggregate type `{0}` is not registered")]
    AggregateNotRegistered(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Loads aggregates by replaying their events and persists newly recorded
/// events with version metadata.
///
/// A repository holds a handle to its [`EventStore`] (constructor
/// injection) plus the stream it works on; create one through
/// [`EventStore::create_repository`] or [`EventStore::repository`].
pub struct AggregateRepository<A> {
    store: EventStore,
    stream: String,
    _aggregate: PhantomData<A>,
}

impl<A: Aggregate> AggregateRepository<A> {
    pub(crate) fn new(store: EventStore, stream: String) -> Self {
        Self {
            store,
            stream,
            _aggregate: PhantomData,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Drains the aggregate's pending events, stamps each with the
    /// aggregate identity and the next version, and appends the batch
    /// through the store facade (so `PreAppend` middleware applies). On
    /// success the root's version advances by the batch length; an empty
    /// drain is a no-op.
    ///
    /// A concurrent save of the same instance surfaces as
    /// [`StoreError::Concurrency`].
    #[tracing::instrument(skip_all, fields(aggregate_id = %root.id()), err)]
    pub async fn save(&self, root: &mut AggregateRoot<A>) -> Result<(), RepositoryError> {
        let pending = root.inner_mut().release_events();
        if pending.is_empty() {
            return Ok(());
        }

        let base = root.version();
        let id = root.id().to_string();
        let events: Vec<_> = pending
            .into_iter()
            .enumerate()
            .map(|(i, event)| {
                event
                    .with_aggregate_id(id.clone())
                    .with_aggregate_type(A::NAME)
                    .with_version(base + i as Version + 1)
            })
            .collect();
        let appended = events.len() as Version;

        self.store.append_to(&self.stream, events).await?;
        root.set_version(base + appended);

        Ok(())
    }

    /// Replays the stream filtered by `_aggregate_id` into a fresh
    /// aggregate. `None` when no events exist for the id.
    pub async fn load(&self, id: &str) -> Result<Option<AggregateRoot<A>>, RepositoryError> {
        let matcher =
            MetadataMatcher::new().match_field(AGGREGATE_ID, Operation::Equals, Value::from(id));
        let mut events = self.store.load(&self.stream, 1, Some(matcher)).await?;

        let mut inner = A::default();
        let mut version: Version = 0;
        while let Some(event) = events.next().await {
            let event = event?;
            inner.apply(&event);
            version += 1;
        }

        if version == 0 {
            return Ok(None);
        }
        Ok(Some(AggregateRoot::from_parts(inner, version)))
    }

    /// Like [`load`](Self::load), but missing aggregates are an error.
    pub async fn get(&self, id: &str) -> Result<AggregateRoot<A>, RepositoryError> {
        self.load(id)
            .await?
            .ok_or_else(|| RepositoryError::AggregateNotFound(id.to_string()))
    }
}
