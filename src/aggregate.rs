use crate::event::Event;
use crate::types::Version;

/// The user-supplied aggregate contract.
///
/// An aggregate derives its state from nothing but its event stream:
/// applying the same events in the same order must always yield the same
/// state. `apply` is the replay dispatch — a pure match on
/// [`Event::name`] updating internal state — and must stay free of side
/// effects, since the repository replays through it on every load.
/// Commands record the events they emit into an internal buffer which the
/// repository drains through `release_events` on save.
pub trait Aggregate: Default + Send + Sync {
    /// Type tag written to `_aggregate_type` on every persisted event.
    /// Changing it breaks the link between existing events and their
    /// aggregate instances.
    const NAME: &'static str;

    /// Identity of this instance, derived from the applied events.
    fn id(&self) -> &str;

    /// Folds one event into the state.
    fn apply(&mut self, event: &Event);

    /// Drains the pending-events buffer filled by command handling.
    fn release_events(&mut self) -> Vec<Event>;
}

/// An aggregate instance together with its persisted version.
///
/// The version counts the events recorded for this instance and backs the
/// optimistic-concurrency check: event `i` of a save is stamped
/// `_aggregate_version = version + i + 1`.
#[derive(Debug, Clone)]
pub struct AggregateRoot<A> {
    inner: A,
    version: Version,
}

impl<A: Aggregate> Default for AggregateRoot<A> {
    fn default() -> Self {
        Self::new(A::default())
    }
}

impl<A: Aggregate> AggregateRoot<A> {
    pub fn new(inner: A) -> Self {
        Self { inner, version: 0 }
    }

    pub(crate) fn from_parts(inner: A, version: Version) -> Self {
        Self { inner, version }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut A {
        &mut self.inner
    }

    pub fn into_inner(self) -> A {
        self.inner
    }
}
