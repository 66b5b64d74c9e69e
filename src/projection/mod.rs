pub use manager::ProjectionManager;
pub use projector::{EventHandlers, InitHandler, ProjectionHandler, Projector, ProjectorContext};
pub use read_model::{
    ReadModel, ReadModelContext, ReadModelError, ReadModelHandler, ReadModelHandlers,
    ReadModelProjector,
};

mod manager;
mod projector;
mod read_model;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::matcher::MetadataMatcher;
use crate::store::StoreError;
use crate::types::EventNumber;

/// Lifecycle of a projection as persisted on its record. Transitions are
/// written by the [`ProjectionManager`] and observed by the projector at
/// poll points; there is no direct method invocation between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionStatus {
    Idle,
    Running,
    Stopping,
    Deleting,
    DeletingInclEmittedEvents,
    Resetting,
}

/// Persisted checkpoint of one projection: opaque state, per-stream
/// positions (last processed `no`, inclusive), status and optional lock
/// lease fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionRecord {
    pub state: Value,
    pub positions: BTreeMap<String, EventNumber>,
    pub status: ProjectionStatus,
    pub locked_until: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
}

impl Default for ProjectionRecord {
    fn default() -> Self {
        Self {
            state: Value::Null,
            positions: BTreeMap::new(),
            status: ProjectionStatus::Idle,
            locked_until: None,
            lock_owner: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProjectorError {
    /// `init` called twice.
    #[error("projection was already initialized")]
    AlreadyInitialized,
    /// More than one of `from_all` / `from_stream` / `from_streams`.
    #[error("projection source was already chosen")]
    FromAlreadyCalled,
    /// More than one of `when` / `when_any`.
    #[error("projection handlers were already set")]
    WhenAlreadyCalled,
    /// `run` without `when`/`when_any`.
    #[error("projection has no handlers configured")]
    NoHandler,
    /// `run` without `init`.
    #[error("projection state was not initialised")]
    StateNotInitialised,
    /// `run` without a source selection.
    #[error("projection has no source streams configured")]
    NoSources,
    /// A handler was registered under an empty event name.
    #[error("invalid handler registration: {0}")]
    InvalidHandler(String),
    /// The projection's write lock is held by another run.
    #[error("projection `{0}` is already running")]
    AlreadyRunning(String),
    /// A merged event came through without its source stream label.
    #[error("loaded event is missing its stream metadata label")]
    MissingStreamTag,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    ReadModel(#[from] ReadModelError),
}

/// One source stream of a projection, with an optional matcher restricting
/// which of its events reach the handlers.
#[derive(Debug, Clone, Default)]
pub struct StreamSource {
    pub(crate) stream: String,
    pub(crate) matcher: Option<MetadataMatcher>,
}

impl StreamSource {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            matcher: None,
        }
    }

    #[must_use]
    pub fn with_matcher(mut self, matcher: MetadataMatcher) -> Self {
        self.matcher = Some(matcher);
        self
    }
}

/// What a projection folds over: every registered stream, or a declared
/// list of sources.
#[derive(Debug, Clone)]
pub(crate) enum Sources {
    All,
    Streams(Vec<StreamSource>),
}
