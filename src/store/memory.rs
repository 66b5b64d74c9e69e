//! In-memory [`PersistenceStrategy`] and [`WriteLockStrategy`], backed by
//! shared maps behind async locks. The reference back-end of the engine and
//! the one its test-suite runs against.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::event::{Event, STREAM};
use crate::matcher::MetadataMatcher;
use crate::projection::{ProjectionRecord, ProjectionStatus};
use crate::store::{EventStream, PersistenceStrategy, StoreError, StreamRequest, WriteLockStrategy};
use crate::types::{EventNumber, Version};

#[derive(Default)]
struct MemoryBackend {
    stream_names: BTreeSet<String>,
    streams: HashMap<String, Vec<Event>>,
    projections: BTreeMap<String, ProjectionRecord>,
}

impl MemoryBackend {
    /// Filtered snapshot of one stream, each event tagged with its source
    /// stream label.
    fn select(
        &self,
        stream: &str,
        from: EventNumber,
        matcher: Option<&MetadataMatcher>,
    ) -> Vec<Event> {
        self.streams
            .get(stream)
            .into_iter()
            .flatten()
            .filter(|event| event.no() >= from)
            .filter(|event| matcher.map_or(true, |matcher| matcher.matches(event)))
            .map(|event| {
                event
                    .clone()
                    .with_metadata_entry(STREAM, Value::from(stream))
            })
            .collect()
    }
}

/// In-memory store sharing one backend across clones, so a facade, its
/// repositories and its projectors all observe the same data.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    backend: Arc<RwLock<MemoryBackend>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStrategy for InMemoryStore {
    async fn create_event_streams_table(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_projections_table(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn add_stream_to_streams_table(&self, stream: &str) -> Result<(), StoreError> {
        let mut backend = self.backend.write().await;
        if !backend.stream_names.insert(stream.to_string()) {
            return Err(StoreError::StreamAlreadyExists(stream.to_string()));
        }
        Ok(())
    }

    async fn remove_stream_from_streams_table(&self, stream: &str) -> Result<(), StoreError> {
        let mut backend = self.backend.write().await;
        if !backend.stream_names.remove(stream) {
            return Err(StoreError::StreamNotFound(stream.to_string()));
        }
        Ok(())
    }

    async fn create_schema(&self, stream: &str) -> Result<(), StoreError> {
        let mut backend = self.backend.write().await;
        backend.streams.entry(stream.to_string()).or_default();
        Ok(())
    }

    async fn drop_schema(&self, stream: &str) -> Result<(), StoreError> {
        let mut backend = self.backend.write().await;
        backend.streams.remove(stream);
        Ok(())
    }

    async fn has_stream(&self, stream: &str) -> Result<bool, StoreError> {
        Ok(self.backend.read().await.stream_names.contains(stream))
    }

    async fn fetch_stream_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.backend.read().await.stream_names.iter().cloned().collect())
    }

    async fn append_to(&self, stream: &str, events: Vec<Event>) -> Result<Vec<Event>, StoreError> {
        let mut backend = self.backend.write().await;
        let stored = backend
            .streams
            .get_mut(stream)
            .ok_or_else(|| StoreError::StreamNotFound(stream.to_string()))?;

        // Validate the whole batch before making anything visible.
        let mut taken: HashSet<(String, Version)> = stored
            .iter()
            .filter_map(|event| {
                let id = event.metadata().aggregate_id()?;
                let version = event.metadata().aggregate_version()?;
                Some((id.to_string(), version))
            })
            .collect();
        for event in &events {
            if let (Some(id), Some(version)) = (
                event.metadata().aggregate_id(),
                event.metadata().aggregate_version(),
            ) {
                if !taken.insert((id.to_string(), version)) {
                    return Err(StoreError::Concurrency {
                        aggregate_id: id.to_string(),
                        version,
                    });
                }
            }
        }

        let next = stored.last().map(|event| event.no() + 1).unwrap_or(1);
        let persisted: Vec<Event> = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| event.with_no(next + i as EventNumber))
            .collect();
        stored.extend(persisted.iter().cloned());

        Ok(persisted)
    }

    async fn load(
        &self,
        stream: &str,
        from: EventNumber,
        count: Option<usize>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventStream, StoreError> {
        let backend = self.backend.read().await;
        if !backend.streams.contains_key(stream) {
            return Err(StoreError::StreamNotFound(stream.to_string()));
        }

        let mut selected = backend.select(stream, from, matcher);
        if let Some(count) = count {
            selected.truncate(count);
        }

        Ok(stream::iter(selected.into_iter().map(Ok)).boxed())
    }

    async fn merge_and_load(&self, requests: Vec<StreamRequest>) -> Result<EventStream, StoreError> {
        let backend = self.backend.read().await;

        let mut merged: Vec<(usize, Event)> = Vec::new();
        for (index, request) in requests.iter().enumerate() {
            let selected =
                backend.select(request.stream(), request.from_number(), request.matcher());
            merged.extend(selected.into_iter().map(|event| (index, event)));
        }
        // Stable under equal keys: ties fall back to stream-declaration order.
        merged.sort_by(|(lhs_index, lhs), (rhs_index, rhs)| {
            (lhs.created_at(), lhs.no(), *lhs_index).cmp(&(rhs.created_at(), rhs.no(), *rhs_index))
        });

        Ok(stream::iter(merged.into_iter().map(|(_, event)| Ok(event))).boxed())
    }

    async fn create_projection(&self, name: &str, record: ProjectionRecord) -> Result<(), StoreError> {
        let mut backend = self.backend.write().await;
        backend.projections.entry(name.to_string()).or_insert(record);
        Ok(())
    }

    async fn fetch_projection(&self, name: &str) -> Result<Option<ProjectionRecord>, StoreError> {
        Ok(self.backend.read().await.projections.get(name).cloned())
    }

    async fn fetch_projection_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.backend.read().await.projections.keys().cloned().collect())
    }

    async fn persist_projection(
        &self,
        name: &str,
        state: Value,
        positions: BTreeMap<String, EventNumber>,
    ) -> Result<(), StoreError> {
        let mut backend = self.backend.write().await;
        let record = backend.projections.entry(name.to_string()).or_default();
        record.state = state;
        record.positions = positions;
        Ok(())
    }

    async fn update_projection_status(
        &self,
        name: &str,
        status: ProjectionStatus,
    ) -> Result<(), StoreError> {
        let mut backend = self.backend.write().await;
        if let Some(record) = backend.projections.get_mut(name) {
            record.status = status;
        }
        Ok(())
    }

    async fn delete_projection(&self, name: &str) -> Result<(), StoreError> {
        let mut backend = self.backend.write().await;
        backend.projections.remove(name);
        Ok(())
    }
}

/// Process-local advisory locks over a shared name set.
#[derive(Default, Clone)]
pub struct InMemoryWriteLock {
    locks: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryWriteLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WriteLockStrategy for InMemoryWriteLock {
    async fn create_lock(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.locks.lock().await.insert(name.to_string()))
    }

    async fn release_lock(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.locks.lock().await.remove(name))
    }
}
