//! Named, optionally core-pinned worker threads.

use std::fmt;
use std::io;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::arch::CpuInfo;

/// Outcome of pinning a thread to a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinningResult {
    /// Pinned to the requested core
    Success,
    /// Pinned, but to the given core instead of the requested one
    SuccessDifferentCore(usize),
    /// Not attempted, or not supported on this platform
    Unsupported,
    /// The platform refused
    Failed,
}

/// A spawned worker and where it runs.
pub struct WorkerThread<T> {
    handle: JoinHandle<T>,
    /// Core requested for this worker, if pinning was enabled
    core_id: Option<usize>,
    /// Reported by the thread once it started
    pinning: mpsc::Receiver<PinningResult>,
    pinned: Option<PinningResult>,
}

impl<T> WorkerThread<T> {
    pub fn core_id(&self) -> Option<usize> {
        self.core_id
    }

    /// How pinning went. Blocks until the thread has started.
    pub fn pinning_result(&mut self) -> PinningResult {
        *self
            .pinned
            .get_or_insert_with(|| self.pinning.recv().unwrap_or(PinningResult::Failed))
    }

    pub fn name(&self) -> Option<&str> {
        self.handle.thread().name()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the worker and returns its result, or the panic payload.
    pub fn join(self) -> thread::Result<T> {
        self.handle.join()
    }
}

impl<T> fmt::Debug for WorkerThread<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerThread")
            .field("name", &self.name())
            .field("core_id", &self.core_id)
            .finish()
    }
}

/// Spawns worker threads, assigning cores in order.
#[derive(Debug, Clone)]
pub struct ThreadBuilder {
    cpu_info: CpuInfo,
    pin: bool,
    /// Index of the next worker
    next_worker: usize,
}

impl ThreadBuilder {
    pub fn new(pin: bool, cpu_info: &CpuInfo) -> Self {
        Self {
            cpu_info: cpu_info.clone(),
            pin,
            next_worker: 0,
        }
    }

    /// Spawns `f` on a thread called `name`.
    pub fn spawn<F, T>(&mut self, name: &str, f: F) -> io::Result<WorkerThread<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let core_id = self
            .pin
            .then(|| self.cpu_info.core_for_worker(self.next_worker));
        self.next_worker += 1;

        let (report, pinning) = mpsc::sync_channel(1);
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let result = match core_id {
                Some(core) => pin_thread_to_core(core),
                None => PinningResult::Unsupported,
            };
            if core_id.is_some() && result != PinningResult::Success {
                tracing::warn!("Pinning to core {:?}: {:?}", core_id, result);
            }
            let _ = report.send(result);
            f()
        })?;

        tracing::debug!("Spawned worker {} (core {:?})", name, core_id);
        Ok(WorkerThread {
            handle,
            core_id,
            pinning,
            pinned: None,
        })
    }
}

/// Pins the calling thread to `core_id`, or to `core_id` modulo the
/// available cores when it is out of range.
fn pin_thread_to_core(core_id: usize) -> PinningResult {
    let Some(core_ids) = core_affinity::get_core_ids() else {
        return PinningResult::Unsupported;
    };
    if core_ids.is_empty() {
        return PinningResult::Failed;
    }

    let (index, result) = if core_id < core_ids.len() {
        (core_id, PinningResult::Success)
    } else {
        let fallback = core_id % core_ids.len();
        (fallback, PinningResult::SuccessDifferentCore(fallback))
    };
    if core_affinity::set_for_current(core_ids[index]) {
        result
    } else {
        PinningResult::Failed
    }
}
