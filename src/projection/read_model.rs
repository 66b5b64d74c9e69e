use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;

use crate::event::Event;
use crate::projection::{
    ProjectionManager, ProjectionRecord, ProjectionStatus, ProjectorError, Sources, StreamSource,
};
use crate::store::StreamRequest;
use crate::types::EventNumber;

const IDLE_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ReadModelError {
    /// Error raised by the user read-model implementation.
    #[error(transparent)]
    Custom(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// The user-supplied read-model contract.
///
/// `stack` queues a mutation; nothing becomes visible until `persist`
/// applies the queue. The projector persists the read model before it
/// checkpoints positions, so a crash between the two replays events into an
/// idempotent `stack`/`persist` pair rather than losing them.
#[async_trait]
pub trait ReadModel: Send + Sync {
    async fn init(&self) -> Result<(), ReadModelError>;

    async fn is_initialized(&self) -> Result<bool, ReadModelError>;

    /// Applies the stacked operations.
    async fn persist(&self) -> Result<(), ReadModelError>;

    async fn delete(&self) -> Result<(), ReadModelError>;

    async fn reset(&self) -> Result<(), ReadModelError>;

    /// Queues one typed operation with its arguments.
    fn stack(&self, operation: &str, args: Vec<Value>);
}

/// Handler folding one event into the projection state while driving the
/// read model through its operation queue.
pub type ReadModelHandler =
    Arc<dyn for<'a> Fn(Value, &Event, &mut ReadModelContext<'a>) -> Value + Send + Sync>;

/// Event-name-keyed handler map for [`ReadModelProjector::when`].
#[derive(Clone, Default)]
pub struct ReadModelHandlers(HashMap<String, ReadModelHandler>);

impl ReadModelHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn handle(
        mut self,
        name: impl Into<String>,
        handler: impl for<'a> Fn(Value, &Event, &mut ReadModelContext<'a>) -> Value
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.0.insert(name.into(), Arc::new(handler));
        self
    }
}

#[derive(Clone)]
enum Handlers {
    Any(ReadModelHandler),
    Named(HashMap<String, ReadModelHandler>),
}

/// Handed to every read-model handler invocation: the stack of the owned
/// read model plus the cooperative `stop` flag.
pub struct ReadModelContext<'a> {
    read_model: &'a dyn ReadModel,
    stopped: bool,
}

impl<'a> ReadModelContext<'a> {
    fn new(read_model: &'a dyn ReadModel) -> Self {
        Self {
            read_model,
            stopped: false,
        }
    }

    /// Queues a typed operation on the read model; it is applied at the
    /// next checkpoint.
    pub fn stack(&self, operation: &str, args: Vec<Value>) {
        self.read_model.stack(operation, args);
    }

    /// Stops the fold after the current event.
    pub fn stop(&mut self) {
        self.stopped = true;
    }
}

/// A [`Projector`](crate::projection::Projector) that materializes into an
/// external read model instead of emitting events.
///
/// The projector owns the read model for the duration of its runs: it
/// initializes it lazily, persists it together with every checkpoint and
/// resets or deletes it along with the projection.
#[derive(Clone)]
pub struct ReadModelProjector {
    name: String,
    manager: ProjectionManager,
    read_model: Arc<dyn ReadModel>,
    state: Option<Value>,
    init_handler: Option<Arc<dyn Fn() -> Value + Send + Sync>>,
    sources: Option<Sources>,
    handlers: Option<Handlers>,
    positions: BTreeMap<String, EventNumber>,
    status: ProjectionStatus,
    is_stopped: bool,
    record_deleted: bool,
}

impl ReadModelProjector {
    pub(crate) fn new(
        manager: ProjectionManager,
        name: String,
        read_model: Arc<dyn ReadModel>,
    ) -> Self {
        Self {
            name,
            manager,
            read_model,
            state: None,
            init_handler: None,
            sources: None,
            handlers: None,
            positions: BTreeMap::new(),
            status: ProjectionStatus::Idle,
            is_stopped: false,
            record_deleted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> Option<&Value> {
        self.state.as_ref()
    }

    pub fn status(&self) -> ProjectionStatus {
        self.status
    }

    pub fn positions(&self) -> &BTreeMap<String, EventNumber> {
        &self.positions
    }

    pub fn read_model(&self) -> &Arc<dyn ReadModel> {
        &self.read_model
    }

    /// Sets the initial state from the factory; kept for `reset`/`delete`.
    pub fn init(
        &mut self,
        factory: impl Fn() -> Value + Send + Sync + 'static,
    ) -> Result<&mut Self, ProjectorError> {
        if self.init_handler.is_some() || self.state.is_some() {
            return Err(ProjectorError::AlreadyInitialized);
        }
        let factory: Arc<dyn Fn() -> Value + Send + Sync> = Arc::new(factory);
        self.state = Some(factory());
        self.init_handler = Some(factory);
        Ok(self)
    }

    pub fn from_all(&mut self) -> Result<&mut Self, ProjectorError> {
        self.set_sources(Sources::All)
    }

    pub fn from_stream(&mut self, source: StreamSource) -> Result<&mut Self, ProjectorError> {
        self.set_sources(Sources::Streams(vec![source]))
    }

    pub fn from_streams(&mut self, sources: Vec<StreamSource>) -> Result<&mut Self, ProjectorError> {
        self.set_sources(Sources::Streams(sources))
    }

    fn set_sources(&mut self, sources: Sources) -> Result<&mut Self, ProjectorError> {
        if self.sources.is_some() {
            return Err(ProjectorError::FromAlreadyCalled);
        }
        self.sources = Some(sources);
        Ok(self)
    }

    pub fn when(&mut self, handlers: ReadModelHandlers) -> Result<&mut Self, ProjectorError> {
        if self.handlers.is_some() {
            return Err(ProjectorError::WhenAlreadyCalled);
        }
        if handlers.0.keys().any(|name| name.is_empty()) {
            return Err(ProjectorError::InvalidHandler(
                "empty event name".to_string(),
            ));
        }
        self.handlers = Some(Handlers::Named(handlers.0));
        Ok(self)
    }

    pub fn when_any(
        &mut self,
        handler: impl for<'a> Fn(Value, &Event, &mut ReadModelContext<'a>) -> Value
            + Send
            + Sync
            + 'static,
    ) -> Result<&mut Self, ProjectorError> {
        if self.handlers.is_some() {
            return Err(ProjectorError::WhenAlreadyCalled);
        }
        self.handlers = Some(Handlers::Any(Arc::new(handler)));
        Ok(self)
    }

    /// Runs the fold; see [`Projector::run`](crate::projection::Projector::run)
    /// for the shared state machine. The read model is initialized lazily on
    /// the first run and persisted with every checkpoint.
    #[tracing::instrument(skip(self), fields(projection = %self.name), err)]
    pub async fn run(&mut self, keep_running: bool) -> Result<(), ProjectorError> {
        if self.handlers.is_none() {
            return Err(ProjectorError::NoHandler);
        }
        if self.state.is_none() {
            return Err(ProjectorError::StateNotInitialised);
        }
        if self.sources.is_none() {
            return Err(ProjectorError::NoSources);
        }

        let locks = Arc::clone(&self.manager.store().inner.locks);
        if !locks.create_lock(&self.name).await? {
            return Err(ProjectorError::AlreadyRunning(self.name.clone()));
        }

        let result = self.run_loop(keep_running).await;

        if !self.record_deleted {
            match self
                .persistence()
                .update_projection_status(&self.name, ProjectionStatus::Idle)
                .await
            {
                Ok(()) => self.status = ProjectionStatus::Idle,
                Err(error) => {
                    tracing::warn!(projection = %self.name, error = %error, "failed to idle projection status");
                }
            }
        }
        if let Err(error) = locks.release_lock(&self.name).await {
            tracing::warn!(projection = %self.name, error = %error, "failed to release projection lock");
        }

        result
    }

    async fn run_loop(&mut self, keep_running: bool) -> Result<(), ProjectorError> {
        self.record_deleted = false;

        match self.manager.fetch_projection_status(&self.name).await {
            ProjectionStatus::Stopping => {
                self.load().await?;
                self.stop().await?;
                return Ok(());
            }
            ProjectionStatus::Deleting => {
                self.delete(false).await?;
                return Ok(());
            }
            ProjectionStatus::DeletingInclEmittedEvents => {
                self.delete(true).await?;
                return Ok(());
            }
            ProjectionStatus::Resetting => self.reset().await?,
            ProjectionStatus::Idle | ProjectionStatus::Running => {}
        }

        self.persistence()
            .create_projection(&self.name, ProjectionRecord::default())
            .await?;
        if !self.read_model.is_initialized().await? {
            self.read_model.init().await?;
        }
        self.prepare_stream_positions().await?;
        self.load().await?;
        self.is_stopped = false;
        self.update_status(ProjectionStatus::Running).await?;

        let handlers = self.handlers.clone().ok_or(ProjectorError::NoHandler)?;

        loop {
            let requests = self.stream_requests();
            let mut events = self.manager.store().merge_and_load(requests).await?;

            let mut event_counter = 0usize;
            while let Some(event) = events.next().await {
                let event = event?;
                self.handle_event(event, &handlers)?;
                event_counter += 1;
                if self.is_stopped {
                    break;
                }
            }
            drop(events);

            if event_counter > 0 {
                self.persist().await?;
            } else if keep_running && !self.is_stopped {
                tokio::time::sleep(IDLE_SLEEP).await;
            }

            match self.manager.fetch_projection_status(&self.name).await {
                ProjectionStatus::Stopping => self.stop().await?,
                ProjectionStatus::Deleting => self.delete(false).await?,
                ProjectionStatus::DeletingInclEmittedEvents => self.delete(true).await?,
                ProjectionStatus::Resetting => {
                    self.reset().await?;
                    if keep_running {
                        self.is_stopped = false;
                        self.update_status(ProjectionStatus::Running).await?;
                    }
                }
                ProjectionStatus::Idle | ProjectionStatus::Running => {}
            }
            self.prepare_stream_positions().await?;

            if !keep_running || self.is_stopped {
                break;
            }
        }

        if !self.record_deleted {
            self.persist().await?;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: Event, handlers: &Handlers) -> Result<(), ProjectorError> {
        let stream = event
            .metadata()
            .stream()
            .ok_or(ProjectorError::MissingStreamTag)?
            .to_string();
        self.positions.insert(stream, event.no());

        let state = self
            .state
            .take()
            .ok_or(ProjectorError::StateNotInitialised)?;
        let read_model = Arc::clone(&self.read_model);
        let mut context = ReadModelContext::new(read_model.as_ref());
        let state = match handlers {
            Handlers::Any(handler) => handler(state, &event, &mut context),
            Handlers::Named(handlers) => match handlers.get(event.name()) {
                Some(handler) => handler(state, &event, &mut context),
                None => state,
            },
        };
        let stopped = context.stopped;
        self.state = Some(state);
        if stopped {
            self.is_stopped = true;
        }

        Ok(())
    }

    /// Checkpoints (read model first) and flags the fold to stop.
    pub async fn stop(&mut self) -> Result<(), ProjectorError> {
        self.persist().await?;
        self.update_status(ProjectionStatus::Idle).await?;
        self.is_stopped = true;
        Ok(())
    }

    /// Starts over: zeroed positions, reset read model, state from the init
    /// factory, a fresh `Idle` record.
    pub async fn reset(&mut self) -> Result<(), ProjectorError> {
        self.positions.clear();
        self.prepare_stream_positions().await?;
        self.read_model.reset().await?;
        if let Some(init) = &self.init_handler {
            self.state = Some(init());
        }
        self.persist().await?;
        self.update_status(ProjectionStatus::Idle).await?;
        Ok(())
    }

    /// Removes the projection record and resets the in-memory fold,
    /// deleting the read model when asked for.
    pub async fn delete(&mut self, delete_read_model: bool) -> Result<(), ProjectorError> {
        self.persistence().delete_projection(&self.name).await?;
        if delete_read_model {
            self.read_model.delete().await?;
        }
        self.positions.clear();
        if let Some(init) = &self.init_handler {
            self.state = Some(init());
        }
        self.status = ProjectionStatus::Idle;
        self.is_stopped = true;
        self.record_deleted = true;
        Ok(())
    }

    async fn prepare_stream_positions(&mut self) -> Result<(), ProjectorError> {
        let streams: Vec<String> = match self.sources.as_ref().ok_or(ProjectorError::NoSources)? {
            Sources::All => self.manager.store().fetch_stream_names().await?,
            Sources::Streams(sources) => {
                sources.iter().map(|source| source.stream.clone()).collect()
            }
        };
        for stream in streams {
            self.positions.entry(stream).or_insert(0);
        }
        Ok(())
    }

    /// Requests keep the declared source order: the merge tie-breaks equal
    /// `(created_at, no)` keys by request index. Under `from_all` there is
    /// no declaration order and the position map's name order keeps ties
    /// deterministic.
    fn stream_requests(&self) -> Vec<StreamRequest> {
        match self.sources.as_ref() {
            Some(Sources::Streams(sources)) => sources
                .iter()
                .map(|source| {
                    let position = self.positions.get(&source.stream).copied().unwrap_or(0);
                    let request = StreamRequest::new(source.stream.clone(), position + 1);
                    match &source.matcher {
                        Some(matcher) => request.with_matcher(matcher.clone()),
                        None => request,
                    }
                })
                .collect(),
            _ => self
                .positions
                .iter()
                .map(|(stream, position)| StreamRequest::new(stream.clone(), position + 1))
                .collect(),
        }
    }

    async fn load(&mut self) -> Result<(), ProjectorError> {
        if let Some(record) = self.persistence().fetch_projection(&self.name).await? {
            for (stream, position) in record.positions {
                self.positions.insert(stream, position);
            }
            if !record.state.is_null() {
                self.state = Some(record.state);
            }
        }
        Ok(())
    }

    /// Read-model persist comes first: re-applying events after a crash is
    /// safe, skipping them is not.
    async fn persist(&mut self) -> Result<(), ProjectorError> {
        self.read_model.persist().await?;
        let state = self.state.clone().unwrap_or(Value::Null);
        self.persistence()
            .persist_projection(&self.name, state, self.positions.clone())
            .await?;
        Ok(())
    }

    async fn update_status(&mut self, status: ProjectionStatus) -> Result<(), ProjectorError> {
        self.persistence()
            .update_projection_status(&self.name, status)
            .await?;
        self.status = status;
        Ok(())
    }

    fn persistence(&self) -> &dyn crate::store::PersistenceStrategy {
        self.manager.store().persistence()
    }
}
