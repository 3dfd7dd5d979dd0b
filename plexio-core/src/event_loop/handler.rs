//! Readiness handlers and failure reporting.

use std::fmt;
use std::sync::Arc;

use crate::channel::SelectableChannel;
use crate::error::SelectorError;
use crate::event_loop::looper::{LoopHandle, LoopShared};
use crate::select::{Ops, SelectionKey, SelectorHandle, Token};

/// Code run by an event loop when a registration becomes ready.
///
/// Handlers run on the loop thread and must not block. Returning an error
/// (or panicking) is reported to the loop's [`ErrorSink`]; the registration
/// stays as it is, so a handler that wants to stop being called should
/// cancel its key or close its channel.
pub trait Handler: Send {
    fn ready(&mut self, cx: &mut Context, key: &SelectionKey) -> anyhow::Result<()>;
}

impl<F> Handler for F
where
    F: FnMut(&mut Context, &SelectionKey) -> anyhow::Result<()> + Send,
{
    fn ready(&mut self, cx: &mut Context, key: &SelectionKey) -> anyhow::Result<()> {
        self(cx, key)
    }
}

/// Pins a closure's signature so its argument types are inferred.
///
/// ```ignore
/// event_loop.register(&listener, Ops::ACCEPT, handler(|cx, key| {
///     // ...
///     Ok(())
/// }))?;
/// ```
pub fn handler<F>(f: F) -> F
where
    F: FnMut(&mut Context, &SelectionKey) -> anyhow::Result<()> + Send,
{
    f
}

/// What a handler may do to its loop.
pub struct Context {
    selector: SelectorHandle,
    shared: Arc<LoopShared>,

    /// Handlers registered during the current dispatch.
    pub(crate) spawned: Vec<(Token, Box<dyn Handler>)>,
}

impl Context {
    pub(crate) fn new(selector: SelectorHandle, shared: Arc<LoopShared>) -> Self {
        Self {
            selector,
            shared,
            spawned: Vec::new(),
        }
    }

    /// Registers another channel with this loop. Its handler is called from
    /// the next cycle on.
    pub fn register<H>(
        &mut self,
        channel: &impl SelectableChannel,
        ops: Ops,
        handler: H,
    ) -> Result<SelectionKey, SelectorError>
    where
        H: Handler + 'static,
    {
        let key = self.selector.register(channel, ops, None)?;
        self.spawned.push((key.token(), Box::new(handler)));
        Ok(key)
    }

    /// Asks the loop to stop once the current dispatch finishes.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// A handle usable from other threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle::new(self.shared.clone())
    }

    pub fn selector(&self) -> &SelectorHandle {
        &self.selector
    }
}

/// A handler error or panic, tagged with the registration it came from.
#[derive(Debug)]
pub struct HandlerFailure {
    pub token: Token,
    pub error: anyhow::Error,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler for {:?} failed: {:#}", self.token, self.error)
    }
}

/// Receives handler failures.
pub trait ErrorSink: Send {
    fn report(&mut self, failure: HandlerFailure);
}

impl<F> ErrorSink for F
where
    F: FnMut(HandlerFailure) + Send,
{
    fn report(&mut self, failure: HandlerFailure) {
        self(failure)
    }
}

/// The default sink: logs each failure at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&mut self, failure: HandlerFailure) {
        tracing::error!("{}", failure);
    }
}
