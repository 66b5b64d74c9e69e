use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{EventNumber, Version};

/// Metadata label carrying the id of the aggregate instance that emitted the event.
pub const AGGREGATE_ID: &str = "_aggregate_id";
/// Metadata label carrying the aggregate type tag.
pub const AGGREGATE_TYPE: &str = "_aggregate_type";
/// Metadata label carrying the optimistic-concurrency version.
pub const AGGREGATE_VERSION: &str = "_aggregate_version";
/// Metadata label populated by the store with the source stream name when
/// events are loaded.
pub const STREAM: &str = "stream";

/// Event metadata: an ordered string-to-value map with a few reserved labels
/// (`_aggregate_id`, `_aggregate_type`, `_aggregate_version` and the
/// engine-populated `stream`) next to arbitrary user labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, label: &str) -> Option<&Value> {
        self.0.get(label)
    }

    pub fn insert(&mut self, label: impl Into<String>, value: Value) {
        self.0.insert(label.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn aggregate_id(&self) -> Option<&str> {
        self.0.get(AGGREGATE_ID).and_then(Value::as_str)
    }

    pub fn aggregate_type(&self) -> Option<&str> {
        self.0.get(AGGREGATE_TYPE).and_then(Value::as_str)
    }

    pub fn aggregate_version(&self) -> Option<Version> {
        self.0.get(AGGREGATE_VERSION).and_then(Value::as_u64)
    }

    /// The source stream of a loaded event. `None` for events that have not
    /// been through a load yet.
    pub fn stream(&self) -> Option<&str> {
        self.0.get(STREAM).and_then(Value::as_str)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// An immutable event envelope.
///
/// The envelope is what the store persists and what projections consume: a
/// stable `name` used for handler dispatch, an opaque JSON `payload`, the
/// `metadata` map, and the ordering fields `no` / `created_at`. The `no`
/// field is assigned by the store at append time; a freshly built event
/// carries `0` until then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    no: EventNumber,
    uuid: Uuid,
    name: String,
    payload: Value,
    metadata: Metadata,
    created_at: DateTime<Utc>,
}

impl Event {
    /// Builds a new event with a random uuid, the current timestamp and
    /// empty metadata.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            no: 0,
            uuid: Uuid::new_v4(),
            name: name.into(),
            payload,
            metadata: Metadata::default(),
            created_at: Utc::now(),
        }
    }

    pub fn no(&self) -> EventNumber {
        self.no
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the event with the given stream position. Reserved to the
    /// store; producers never assign positions themselves.
    #[must_use]
    pub fn with_no(mut self, no: EventNumber) -> Self {
        self.no = no;
        self
    }

    #[must_use]
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    /// Returns the event with `_aggregate_version` set in its metadata.
    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.metadata.insert(AGGREGATE_VERSION, Value::from(version));
        self
    }

    /// Returns the event with `_aggregate_id` set in its metadata.
    #[must_use]
    pub fn with_aggregate_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.insert(AGGREGATE_ID, Value::from(id.into()));
        self
    }

    /// Returns the event with `_aggregate_type` set in its metadata.
    #[must_use]
    pub fn with_aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.metadata
            .insert(AGGREGATE_TYPE, Value::from(aggregate_type.into()));
        self
    }

    /// Returns the event with its metadata map replaced.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns the event with a single metadata label set.
    #[must_use]
    pub fn with_metadata_entry(mut self, label: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(label, value);
        self
    }

    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}
