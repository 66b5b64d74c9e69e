pub use event_store::*;

pub mod memory;

mod event_store;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::event::Event;
use crate::matcher::MetadataMatcher;
use crate::middleware::MiddlewareError;
use crate::projection::{ProjectionRecord, ProjectionStatus};
use crate::types::{EventNumber, Version};

/// Lazy, finite, non-restartable sequence of persisted events.
pub type EventStream = BoxStream<'static, Result<Event, StoreError>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Stream name already registered in the streams table.
    #[error("event stream `{0}` already exists")]
    StreamAlreadyExists(String),
    /// Stream name missing from the streams table.
    #[error("event stream `{0}` was not found")]
    StreamNotFound(String),
    /// Duplicate `(_aggregate_id, _aggregate_version)` pair on append.
    #[error("version {version} already recorded for aggregate `{aggregate_id}`")]
    Concurrency { aggregate_id: String, version: Version },
    /// No projection registered under the given name.
    #[error("projection `{0}` was not found")]
    ProjectionNotFound(String),
    /// A `PreAppend` middleware failed; the append was aborted.
    #[error("append middleware failed: {0}")]
    Middleware(#[source] MiddlewareError),
    /// Serialization/deserialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Error raised by the persistence back-end.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

/// One entry of a [`merge_and_load`](PersistenceStrategy::merge_and_load)
/// call: which stream to read, from which position, through which matcher.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    stream: String,
    from: EventNumber,
    matcher: Option<MetadataMatcher>,
}

impl StreamRequest {
    pub fn new(stream: impl Into<String>, from: EventNumber) -> Self {
        Self {
            stream: stream.into(),
            from,
            matcher: None,
        }
    }

    #[must_use]
    pub fn with_matcher(mut self, matcher: MetadataMatcher) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn from_number(&self) -> EventNumber {
        self.from
    }

    pub fn matcher(&self) -> Option<&MetadataMatcher> {
        self.matcher.as_ref()
    }
}

/// Back-end contract consumed by the [`EventStore`] facade.
///
/// Implementations own the two logical tables (`event_streams`,
/// `projections`) plus the per-stream physical storage, and must serialize
/// per-stream appends so stream numbering stays dense.
#[async_trait]
pub trait PersistenceStrategy: Send + Sync {
    /// Idempotent; safe to call on an already-initialized store.
    async fn create_event_streams_table(&self) -> Result<(), StoreError>;

    /// Idempotent; safe to call on an already-initialized store.
    async fn create_projections_table(&self) -> Result<(), StoreError>;

    /// Fails with [`StoreError::StreamAlreadyExists`] on duplicates.
    async fn add_stream_to_streams_table(&self, stream: &str) -> Result<(), StoreError>;

    /// Fails with [`StoreError::StreamNotFound`] for unknown names.
    async fn remove_stream_from_streams_table(&self, stream: &str) -> Result<(), StoreError>;

    /// Creates the per-stream physical storage.
    async fn create_schema(&self, stream: &str) -> Result<(), StoreError>;

    /// Drops the per-stream physical storage.
    async fn drop_schema(&self, stream: &str) -> Result<(), StoreError>;

    async fn has_stream(&self, stream: &str) -> Result<bool, StoreError>;

    async fn fetch_stream_names(&self) -> Result<Vec<String>, StoreError>;

    /// Appends the batch atomically: every event becomes visible or none.
    ///
    /// Assigns `no` values contiguously from `max(no) + 1` and returns the
    /// persisted events. Fails with [`StoreError::Concurrency`] when an
    /// event's `(_aggregate_id, _aggregate_version)` pair duplicates an
    /// existing one in the stream (or another event of the same batch).
    async fn append_to(&self, stream: &str, events: Vec<Event>) -> Result<Vec<Event>, StoreError>;

    /// Lazy ascending-`no` sequence of events with `no >= from`, filtered by
    /// the matcher, each tagged with the `stream` metadata label.
    async fn load(
        &self,
        stream: &str,
        from: EventNumber,
        count: Option<usize>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventStream, StoreError>;

    /// Time-ordered merge of per-stream filtered iterations, ordered by
    /// `(created_at, no, request-index)` ascending. Unknown streams
    /// contribute nothing: projection sources may disappear between stream
    /// listing and read.
    async fn merge_and_load(&self, requests: Vec<StreamRequest>) -> Result<EventStream, StoreError>;

    /// No-op when a record under that name already exists.
    async fn create_projection(&self, name: &str, record: ProjectionRecord) -> Result<(), StoreError>;

    async fn fetch_projection(&self, name: &str) -> Result<Option<ProjectionRecord>, StoreError>;

    async fn fetch_projection_names(&self) -> Result<Vec<String>, StoreError>;

    /// Writes state and positions, leaving the status untouched. Upserts
    /// when the record is missing.
    async fn persist_projection(
        &self,
        name: &str,
        state: serde_json::Value,
        positions: std::collections::BTreeMap<String, EventNumber>,
    ) -> Result<(), StoreError>;

    /// No-op when the record is missing.
    async fn update_projection_status(
        &self,
        name: &str,
        status: ProjectionStatus,
    ) -> Result<(), StoreError>;

    async fn delete_projection(&self, name: &str) -> Result<(), StoreError>;
}

/// Named advisory lock used to serialize projection runs by name for the
/// duration of one `run` call.
#[async_trait]
pub trait WriteLockStrategy: Send + Sync {
    /// Returns `false` when the lock is already held.
    async fn create_lock(&self, name: &str) -> Result<bool, StoreError>;

    /// Returns `false` when the lock was not held.
    async fn release_lock(&self, name: &str) -> Result<bool, StoreError>;
}
