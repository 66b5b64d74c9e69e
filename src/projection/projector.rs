use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;

use crate::event::Event;
use crate::projection::{
    ProjectionManager, ProjectionRecord, ProjectionStatus, ProjectorError, Sources, StreamSource,
};
use crate::store::{StoreError, StreamRequest};
use crate::types::EventNumber;

/// How long an idle keep-running projector sleeps between polls.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

pub type InitHandler = Arc<dyn Fn() -> Value + Send + Sync>;

/// Handler folding one event into the projection state. The returned value
/// replaces the state; the ownership move is what keeps handlers from
/// aliasing the projector's snapshot.
pub type ProjectionHandler =
    Arc<dyn Fn(Value, &Event, &mut ProjectorContext) -> Value + Send + Sync>;

/// Event-name-keyed handler map for [`Projector::when`].
#[derive(Clone, Default)]
pub struct EventHandlers(pub(crate) HashMap<String, ProjectionHandler>);

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn handle(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(Value, &Event, &mut ProjectorContext) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.0.insert(name.into(), Arc::new(handler));
        self
    }
}

#[derive(Clone)]
pub(crate) enum Handlers {
    Any(ProjectionHandler),
    Named(HashMap<String, ProjectionHandler>),
}

pub(crate) enum EmitOp {
    Emit(Event),
    LinkTo(String, Event),
}

/// Handed to every handler invocation. Queues `emit`/`link_to` writes which
/// the projector flushes before advancing past the current event, and
/// carries the cooperative `stop` flag.
#[derive(Default)]
pub struct ProjectorContext {
    ops: Vec<EmitOp>,
    stopped: bool,
}

impl ProjectorContext {
    fn new() -> Self {
        Self::default()
    }

    /// Queues an event for the projection's own stream.
    pub fn emit(&mut self, event: Event) {
        self.ops.push(EmitOp::Emit(event));
    }

    /// Queues an event for an arbitrary stream.
    pub fn link_to(&mut self, stream: impl Into<String>, event: Event) {
        self.ops.push(EmitOp::LinkTo(stream.into(), event));
    }

    /// Stops the fold after the current event.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    fn finish(self) -> (Vec<EmitOp>, bool) {
        (self.ops, self.stopped)
    }
}

/// A named, resumable fold over one or more streams.
///
/// Built in three steps (`init`, one `from_*`, one `when*`), then driven by
/// [`run`](Self::run). The projector owns its in-memory state and cursor
/// between checkpoints and cooperates with the [`ProjectionManager`]
/// through the status persisted on its projection record.
#[derive(Clone)]
pub struct Projector {
    name: String,
    manager: ProjectionManager,
    state: Option<Value>,
    init_handler: Option<InitHandler>,
    sources: Option<Sources>,
    handlers: Option<Handlers>,
    positions: BTreeMap<String, EventNumber>,
    status: ProjectionStatus,
    is_stopped: bool,
    stream_created: bool,
    record_deleted: bool,
}

impl Projector {
    pub(crate) fn new(manager: ProjectionManager, name: String) -> Self {
        Self {
            name,
            manager,
            state: None,
            init_handler: None,
            sources: None,
            handlers: None,
            positions: BTreeMap::new(),
            status: ProjectionStatus::Idle,
            is_stopped: false,
            stream_created: false,
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

    /// Sets the initial state from the factory. The factory is kept around:
    /// `reset` and `delete` re-invoke it.
    pub fn init(
        &mut self,
        factory: impl Fn() -> Value + Send + Sync + 'static,
    ) -> Result<&mut Self, ProjectorError> {
        if self.init_handler.is_some() || self.state.is_some() {
            return Err(ProjectorError::AlreadyInitialized);
        }
        let factory: InitHandler = Arc::new(factory);
        self.state = Some(factory());
        self.init_handler = Some(factory);
        Ok(self)
    }

    /// Folds over every stream registered at run time, including streams
    /// that appear while the projector keeps running.
    pub fn from_all(&mut self) -> Result<&mut Self, ProjectorError> {
        self.set_sources(Sources::All)
    }

    /// Folds over a single stream.
    pub fn from_stream(
        &mut self,
        source: StreamSource,
    ) -> Result<&mut Self, ProjectorError> {
        self.set_sources(Sources::Streams(vec![source]))
    }

    /// Folds over a declared list of streams.
    pub fn from_streams(
        &mut self,
        sources: Vec<StreamSource>,
    ) -> Result<&mut Self, ProjectorError> {
        self.set_sources(Sources::Streams(sources))
    }

    fn set_sources(&mut self, sources: Sources) -> Result<&mut Self, ProjectorError> {
        if self.sources.is_some() {
            return Err(ProjectorError::FromAlreadyCalled);
        }
        self.sources = Some(sources);
        Ok(self)
    }

    /// Registers one handler per event name; events with no handler are
    /// skipped (their position still advances).
    pub fn when(&mut self, handlers: EventHandlers) -> Result<&mut Self, ProjectorError> {
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

    /// Registers a single handler invoked for every event.
    pub fn when_any(
        &mut self,
        handler: impl Fn(Value, &Event, &mut ProjectorContext) -> Value + Send + Sync + 'static,
    ) -> Result<&mut Self, ProjectorError> {
        if self.handlers.is_some() {
            return Err(ProjectorError::WhenAlreadyCalled);
        }
        self.handlers = Some(Handlers::Any(Arc::new(handler)));
        Ok(self)
    }

    /// Runs the fold. With `keep_running` the projector polls for new
    /// events and control signals until stopped; without, it drains what is
    /// currently in the streams, checkpoints and returns.
    ///
    /// The projection's write lock is held for the whole call; a second
    /// concurrent run fails with [`ProjectorError::AlreadyRunning`].
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

        // Mirror of the lock release: whatever happened, the projection is
        // no longer running once this call returns.
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
                self.handle_event(event, &handlers).await?;
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

    async fn handle_event(
        &mut self,
        event: Event,
        handlers: &Handlers,
    ) -> Result<(), ProjectorError> {
        let stream = event
            .metadata()
            .stream()
            .ok_or(ProjectorError::MissingStreamTag)?
            .to_string();
        // The position becomes the event's own number, not a +1 step:
        // matchers make streams sparse from the projector's point of view.
        self.positions.insert(stream, event.no());

        let state = self
            .state
            .take()
            .ok_or(ProjectorError::StateNotInitialised)?;
        let mut context = ProjectorContext::new();
        let state = match handlers {
            Handlers::Any(handler) => handler(state, &event, &mut context),
            Handlers::Named(handlers) => match handlers.get(event.name()) {
                Some(handler) => handler(state, &event, &mut context),
                None => state,
            },
        };
        self.state = Some(state);

        let (ops, stopped) = context.finish();
        for op in ops {
            match op {
                EmitOp::Emit(event) => self.emit(event).await?,
                EmitOp::LinkTo(stream, event) => self.link_to(&stream, event).await?,
            }
        }
        if stopped {
            self.is_stopped = true;
        }

        Ok(())
    }

    /// Appends to the stream named after the projection, creating it on
    /// first use.
    pub async fn emit(&mut self, event: Event) -> Result<(), ProjectorError> {
        let stream = self.name.clone();
        if !self.stream_created && !self.manager.store().has_stream(&stream).await? {
            self.manager.store().create_stream(&stream).await?;
        }
        self.stream_created = true;
        self.manager.store().append_to(&stream, vec![event]).await?;
        Ok(())
    }

    /// Appends to an arbitrary stream, creating it when missing.
    pub async fn link_to(&mut self, stream: &str, event: Event) -> Result<(), ProjectorError> {
        if !self.manager.store().has_stream(stream).await? {
            self.manager.store().create_stream(stream).await?;
        }
        self.manager.store().append_to(stream, vec![event]).await?;
        Ok(())
    }

    /// Checkpoints, writes an `Idle` status and flags the fold to stop.
    pub async fn stop(&mut self) -> Result<(), ProjectorError> {
        self.persist().await?;
        self.update_status(ProjectionStatus::Idle).await?;
        self.is_stopped = true;
        Ok(())
    }

    /// Starts the projection over: zeroed source positions, state from the
    /// init factory, a fresh `Idle` record, and the emitted stream dropped.
    pub async fn reset(&mut self) -> Result<(), ProjectorError> {
        self.positions.clear();
        self.prepare_stream_positions().await?;
        if let Some(init) = &self.init_handler {
            self.state = Some(init());
        }
        self.persist().await?;
        self.update_status(ProjectionStatus::Idle).await?;
        self.delete_emitted_stream().await?;
        Ok(())
    }

    /// Removes the projection record and resets the in-memory fold. The
    /// projection's own emitted stream is dropped when asked for.
    pub async fn delete(&mut self, delete_emitted_events: bool) -> Result<(), ProjectorError> {
        self.persistence().delete_projection(&self.name).await?;
        if delete_emitted_events {
            self.delete_emitted_stream().await?;
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

    async fn delete_emitted_stream(&mut self) -> Result<(), ProjectorError> {
        match self.manager.store().delete_stream(&self.name).await {
            Ok(()) | Err(StoreError::StreamNotFound(_)) => {
                self.stream_created = false;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Seeds unseen source streams at position 0, preserving existing
    /// positions. Under `from_all` the registered stream set is re-read, so
    /// streams created after the projector started are picked up.
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

    async fn persist(&mut self) -> Result<(), ProjectorError> {
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
