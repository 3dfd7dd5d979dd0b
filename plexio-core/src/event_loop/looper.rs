//! The poll/dispatch loop.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_utils::atomic::AtomicCell;

use crate::channel::SelectableChannel;
use crate::error::SelectorError;
use crate::event_loop::{Context, ErrorSink, Handler, HandlerFailure, LogSink, LoopConfig, LoopState};
use crate::select::{Ops, SelectionKey, Selector, SelectorHandle, Token};

/// Handlers registered from other threads, waiting for the next dispatch.
type Incoming = Vec<(Token, Box<dyn Handler>)>;

/// Loop state reachable from any thread.
pub(crate) struct LoopShared {
    name: String,
    state: AtomicCell<LoopState>,
    stop_requested: AtomicBool,
    selector: SelectorHandle,

    /// Held across registration so a handler is queued before its key can
    /// be dispatched.
    incoming: Mutex<Incoming>,
}

impl LoopShared {
    fn incoming(&self) -> MutexGuard<'_, Incoming> {
        self.incoming.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::AcqRel) {
            tracing::debug!("Stop requested for event loop {}", self.name);
        }
        // A closed selector means the loop is already stopped
        let _ = self.selector.wake();
    }
}

/// A cloneable, thread-safe handle to an event loop.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub(crate) fn new(shared: Arc<LoopShared>) -> Self {
        Self { shared }
    }

    /// Registers `channel` with the loop from any thread. A blocked poll is
    /// woken so the registration takes effect at once.
    pub fn register<H>(
        &self,
        channel: &impl SelectableChannel,
        ops: Ops,
        handler: H,
    ) -> Result<SelectionKey, SelectorError>
    where
        H: Handler + 'static,
    {
        let mut incoming = self.shared.incoming();
        let key = self.shared.selector.register(channel, ops, None)?;
        incoming.push((key.token(), Box::new(handler)));
        Ok(key)
    }

    /// Stops the loop. A poll in progress is woken; the loop reaches
    /// [`LoopState::Stopped`] once it returns.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn wake(&self) -> Result<(), SelectorError> {
        self.shared.selector.wake()
    }

    pub fn state(&self) -> LoopState {
        self.shared.state.load()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

/// A single-threaded readiness loop.
///
/// Each cycle polls the selector, then calls the handler of every selected
/// key exactly once. Handler failures are isolated per key and sent to the
/// error sink; a selector failure ends the loop and is returned by
/// [`run`](Self::run).
pub struct EventLoop {
    shared: Arc<LoopShared>,
    selector: Selector,
    handlers: HashMap<Token, Box<dyn Handler>>,
    cx: Context,
    sink: Box<dyn ErrorSink>,
    poll_timeout: Option<Duration>,
}

impl EventLoop {
    pub fn new(config: LoopConfig) -> Result<Self, SelectorError> {
        let selector = Selector::with_config(config.selector)?;
        let shared = Arc::new(LoopShared {
            name: config.name,
            state: AtomicCell::new(LoopState::Idle),
            stop_requested: AtomicBool::new(false),
            selector: selector.handle(),
            incoming: Mutex::new(Vec::new()),
        });

        Ok(Self {
            cx: Context::new(selector.handle(), shared.clone()),
            shared,
            selector,
            handlers: HashMap::new(),
            sink: Box::new(LogSink),
            poll_timeout: config.poll_timeout,
        })
    }

    /// Registers `channel` for `ops`, dispatching readiness to `handler`.
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
        self.handlers.insert(key.token(), Box::new(handler));
        Ok(key)
    }

    /// Replaces the sink receiving handler failures.
    pub fn set_error_sink(&mut self, sink: impl ErrorSink + 'static) {
        self.sink = Box::new(sink);
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle::new(self.shared.clone())
    }

    pub fn state(&self) -> LoopState {
        self.shared.state.load()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Runs cycles until stopped.
    ///
    /// Returns `Ok(())` after [`LoopHandle::stop`] and the selector's error
    /// when polling fails. Either way the loop ends in
    /// [`LoopState::Stopped`] with its selector closed.
    pub fn run(&mut self) -> Result<(), SelectorError> {
        match self.state() {
            LoopState::Stopped => return Ok(()),
            LoopState::Polling | LoopState::Dispatching => {
                return Err(SelectorError::AlreadyRunning)
            }
            LoopState::Idle => {}
        }

        tracing::info!("Event loop {} started", self.shared.name);
        while !self.shared.stop_requested() {
            self.cycle(self.poll_timeout)?;
        }
        self.finish();
        Ok(())
    }

    /// Runs one poll/dispatch cycle. Returns the number of handlers called.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize, SelectorError> {
        match self.state() {
            LoopState::Stopped => return Ok(0),
            LoopState::Polling | LoopState::Dispatching => {
                return Err(SelectorError::AlreadyRunning)
            }
            LoopState::Idle => {}
        }
        if self.shared.stop_requested() {
            self.finish();
            return Ok(0);
        }

        let dispatched = self.cycle(timeout)?;
        if self.shared.stop_requested() {
            self.finish();
        }
        Ok(dispatched)
    }

    fn cycle(&mut self, timeout: Option<Duration>) -> Result<usize, SelectorError> {
        // Step 1: poll
        self.shared.state.store(LoopState::Polling);
        if let Err(e) = self.selector.poll(timeout) {
            tracing::error!("Event loop {} failed: {}", self.shared.name, e);
            self.finish();
            return Err(e);
        }
        if self.shared.stop_requested() {
            self.finish();
            return Ok(0);
        }

        // Step 2: adopt handlers registered elsewhere, drop handlers of
        // cancelled registrations
        self.shared.state.store(LoopState::Dispatching);
        self.handlers.extend(self.shared.incoming().drain(..));
        for token in self.selector.take_removed() {
            self.handlers.remove(&token);
        }

        // Step 3: dispatch
        let dispatched = self.dispatch();
        self.shared.state.store(LoopState::Idle);
        Ok(dispatched)
    }

    fn dispatch(&mut self) -> usize {
        let ready: Vec<SelectionKey> = self.selector.selected_keys().drain().collect();
        let mut dispatched = 0;

        for key in ready {
            let token = key.token();
            // Cancelled by an earlier handler in this cycle
            if !key.is_valid() {
                self.handlers.remove(&token);
                continue;
            }
            let Some(mut handler) = self.handlers.remove(&token) else {
                tracing::trace!("No handler for {:?}", token);
                continue;
            };

            let cx = &mut self.cx;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.ready(cx, &key)));
            dispatched += 1;

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error),
                Err(payload) => Some(anyhow::anyhow!(
                    "handler panicked: {}",
                    panic_message(payload.as_ref())
                )),
            };
            if let Some(error) = failure {
                self.sink.report(HandlerFailure { token, error });
            }

            if key.is_valid() {
                self.handlers.insert(token, handler);
            }
            self.handlers.extend(self.cx.spawned.drain(..));
        }

        tracing::trace!("Dispatched {} handler(s)", dispatched);
        dispatched
    }

    /// Enters the terminal state and releases the selector and handlers.
    fn finish(&mut self) {
        if self.state() == LoopState::Stopped {
            return;
        }
        self.shared.state.store(LoopState::Stopped);
        self.selector.close();
        self.handlers.clear();
        self.cx.spawned.clear();
        self.shared.incoming().clear();
        tracing::info!("Event loop {} stopped", self.shared.name);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
