//! Handles to operations running on the disk engine.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::DiskError;

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;
const DONE: u8 = 3;

/// Progress of one operation, shared by the worker and the handle.
#[derive(Debug)]
pub(crate) struct OpState(AtomicU8);

impl OpState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(PENDING)))
    }

    /// Claims the operation for a worker. Fails once cancelled.
    pub(crate) fn start(&self) -> bool {
        self.0
            .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish(&self) {
        self.0.store(DONE, Ordering::Release);
    }

    /// Prevents the operation from starting. Fails once a worker claimed it.
    fn cancel(&self) -> bool {
        self.0
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn load(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

/// The eventual result of a disk operation.
///
/// Cancelling before a worker picks the operation up prevents its effect.
/// Cancelling later lets the operation finish, but its result is dropped.
/// Either way the completion then resolves to [`DiskError::Cancelled`].
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T, DiskError>>,
    state: Arc<OpState>,
    cancelled: bool,
}

impl<T> Completion<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T, DiskError>>, state: Arc<OpState>) -> Self {
        Self {
            rx,
            state,
            cancelled: false,
        }
    }

    /// Blocks until the operation finishes.
    ///
    /// Must not be called from an async context; `.await` the completion
    /// there instead.
    pub fn wait(self) -> Result<T, DiskError> {
        if self.cancelled {
            return Err(DiskError::Cancelled);
        }
        self.rx
            .blocking_recv()
            .unwrap_or(Err(DiskError::EngineStopped))
    }

    /// Takes the result if the operation has finished.
    ///
    /// Returns `None` while it is still queued or running. A result can be
    /// taken once; later calls report [`DiskError::EngineStopped`].
    pub fn try_take(&mut self) -> Option<Result<T, DiskError>> {
        if self.cancelled {
            return Some(Err(DiskError::Cancelled));
        }
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(DiskError::EngineStopped)),
        }
    }

    /// Whether a result is (or will never be) available.
    pub fn is_finished(&self) -> bool {
        self.cancelled || matches!(self.state.load(), CANCELLED | DONE)
    }

    /// Cancels the operation. Returns `true` if it had not started, so its
    /// effect never happens.
    pub fn cancel(&mut self) -> bool {
        if self.cancelled {
            return self.state.load() == CANCELLED;
        }
        self.cancelled = true;
        let prevented = self.state.cancel();
        tracing::trace!("Cancelled disk operation (prevented: {})", prevented);
        prevented
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, DiskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.cancelled {
            return Poll::Ready(Err(DiskError::Cancelled));
        }
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(DiskError::EngineStopped)))
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("finished", &self.is_finished())
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending<T>() -> (oneshot::Sender<Result<T, DiskError>>, Arc<OpState>, Completion<T>) {
        let (tx, rx) = oneshot::channel();
        let state = OpState::new();
        let completion = Completion::new(rx, state.clone());
        (tx, state, completion)
    }

    #[test]
    fn test_cancel_before_start_prevents_it() {
        let (_tx, state, mut completion) = pending::<u32>();
        assert!(!completion.is_finished());

        assert!(completion.cancel());
        assert!(!state.start());
        assert!(completion.is_finished());
        assert!(matches!(completion.wait(), Err(DiskError::Cancelled)));
    }

    #[test]
    fn test_cancel_after_start_discards_result() {
        let (tx, state, mut completion) = pending::<u32>();
        assert!(state.start());

        assert!(!completion.cancel());
        let _ = tx.send(Ok(7));
        state.finish();
        assert!(matches!(completion.try_take(), Some(Err(DiskError::Cancelled))));
    }

    #[test]
    fn test_try_take_before_and_after_finish() {
        let (tx, state, mut completion) = pending::<u32>();
        assert!(completion.try_take().is_none());

        state.start();
        tx.send(Ok(7)).unwrap();
        state.finish();
        assert!(completion.is_finished());
        assert_eq!(completion.try_take().unwrap().unwrap(), 7);
    }

    #[test]
    fn test_dropped_sender_means_engine_stopped() {
        let (tx, _state, completion) = pending::<u32>();
        drop(tx);
        assert!(matches!(completion.wait(), Err(DiskError::EngineStopped)));
    }

    #[tokio::test]
    async fn test_await_completion() {
        let (tx, state, completion) = pending::<&'static str>();
        let worker = std::thread::spawn(move || {
            state.start();
            let _ = tx.send(Ok("done"));
            state.finish();
        });

        assert_eq!(completion.await.unwrap(), "done");
        worker.join().unwrap();
    }
}
