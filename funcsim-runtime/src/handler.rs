//! Handler trait and completion conventions

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::context::InvocationContext;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How a handler signals completion.
///
/// The three conventions race against each other and against the
/// invocation timer; the context's once-guard resolves the race.
pub enum HandlerOutcome {
    /// Completion arrives later through the context
    /// (`done`/`succeed`/`fail`).
    Deferred,

    /// A future whose settlement is wired to `succeed`/`fail`.
    Async(BoxFuture<'static, Result<Value, BoxError>>),

    /// Plain return: an immediate success with an empty payload.
    Sync,
}

/// A function entry point invoked once per invocation.
///
/// The context carries the remaining time budget and the completion
/// routines; it stands in for the `done` callback of the emulated
/// calling convention.
pub trait Handler: Send + Sync {
    fn invoke(
        &self,
        event: Value,
        ctx: Arc<InvocationContext>,
    ) -> Result<HandlerOutcome, BoxError>;
}

/// Constructor signature a handler library exports.
///
/// The export name configured on the invocation selects which symbol to
/// resolve; calling it yields the handler instance for this invocation.
pub type HandlerCtor = fn() -> Box<dyn Handler>;

/// Wrap a plain closure as a [`Handler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(Value, Arc<InvocationContext>) -> Result<HandlerOutcome, BoxError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Handler for FnHandler<F>
where
    F: Fn(Value, Arc<InvocationContext>) -> Result<HandlerOutcome, BoxError> + Send + Sync,
{
    fn invoke(
        &self,
        event: Value,
        ctx: Arc<InvocationContext>,
    ) -> Result<HandlerOutcome, BoxError> {
        (self.0)(event, ctx)
    }
}

/// Wrap an async function as a [`Handler`] using the future convention.
///
/// ```ignore
/// let handler = handler_fn(|event| async move { Ok(event) });
/// ```
pub fn handler_fn<F, Fut, E>(f: F) -> AsyncFnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, E>> + Send + 'static,
    E: Into<BoxError>,
{
    AsyncFnHandler(f)
}

pub struct AsyncFnHandler<F>(F);

impl<F, Fut, E> Handler for AsyncFnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, E>> + Send + 'static,
    E: Into<BoxError>,
{
    fn invoke(
        &self,
        event: Value,
        _ctx: Arc<InvocationContext>,
    ) -> Result<HandlerOutcome, BoxError> {
        let fut = (self.0)(event);
        Ok(HandlerOutcome::Async(Box::pin(async move {
            fut.await.map_err(Into::into)
        })))
    }
}
