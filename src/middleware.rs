use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::Stream;
use futures::StreamExt;

use crate::event::Event;
use crate::store::{EventStream, StoreError};

/// Hook points offered by the event store.
///
/// `PreAppend` and `Loaded` transform events and run in registration order;
/// `Appended` and `AppendErrored` are observers whose failures are logged
/// and never reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    PreAppend,
    Appended,
    AppendErrored,
    Loaded,
}

pub type MiddlewareError = Box<dyn std::error::Error + Send + Sync>;

/// A user hook fired on one of the [`EventAction`]s. The returned event
/// replaces the input, so transforming middleware substitutes events while
/// observers return them untouched.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, event: Event) -> Result<Event, MiddlewareError>;

    /// Name used in tracing output when a hook fails. Defaults to the type
    /// name, override for a stable label.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Adapts a plain async closure into a [`Middleware`].
pub struct MiddlewareFn<F>(F);

impl<F> MiddlewareFn<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Middleware for MiddlewareFn<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Event, MiddlewareError>> + Send,
{
    async fn handle(&self, event: Event) -> Result<Event, MiddlewareError> {
        (self.0)(event).await
    }
}

/// Lazy sequence adapter piping every loaded event through the `Loaded`
/// middleware chain, one event at a time.
///
/// Each pull takes the next event from the underlying stream, folds the
/// chain over it in registration order and yields the result. A failing
/// hook is logged and skipped, leaving the event as produced by the hooks
/// before it. At most one event is in flight; the iterator never buffers.
pub struct MiddlewareIterator {
    inner: EventStream,
    chain: Arc<[Arc<dyn Middleware>]>,
    in_flight: Option<BoxFuture<'static, Event>>,
}

impl MiddlewareIterator {
    pub(crate) fn new(inner: EventStream, chain: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            inner,
            chain: chain.into(),
            in_flight: None,
        }
    }
}

impl Stream for MiddlewareIterator {
    type Item = Result<Event, StoreError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(fut) = this.in_flight.as_mut() {
                return match fut.as_mut().poll(cx) {
                    Poll::Ready(event) => {
                        this.in_flight = None;
                        Poll::Ready(Some(Ok(event)))
                    }
                    Poll::Pending => Poll::Pending,
                };
            }

            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if this.chain.is_empty() {
                        return Poll::Ready(Some(Ok(event)));
                    }
                    let chain = Arc::clone(&this.chain);
                    this.in_flight = Some(Box::pin(async move {
                        let mut event = event;
                        for middleware in chain.iter() {
                            match middleware.handle(event.clone()).await {
                                Ok(transformed) => event = transformed,
                                Err(error) => {
                                    tracing::error!(
                                        middleware = middleware.name(),
                                        error = %error,
                                        "loaded middleware failed, yielding the event untransformed"
                                    );
                                }
                            }
                        }
                        event
                    }));
                }
                Poll::Ready(Some(Err(error))) => return Poll::Ready(Some(Err(error))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
