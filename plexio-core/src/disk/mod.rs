//! One-shot file operations on worker threads.
//!
//! A [`DiskEngine`] runs positional reads, writes and syncs on a small pool
//! of threads so callers never block on the file system. Every submission
//! returns a [`Completion`] that can be waited on, polled, awaited or
//! cancelled.

mod completion;
mod engine;

pub use completion::Completion;
pub use engine::DiskEngine;

/// Configuration for the disk engine.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Number of worker threads; at least one is started.
    pub worker_threads: usize,

    /// Whether to pin worker threads to cores.
    pub pin_threads: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            pin_threads: false,
        }
    }
}
