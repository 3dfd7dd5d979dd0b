//! Error types for the multiplexing core.
//!
//! Each layer has its own error enum. Conditions that are part of normal
//! non-blocking operation (would-block, end-of-stream) are not errors and
//! are reported through return values instead.

use std::io;

use crate::channel::ChannelKind;
use crate::select::Ops;

/// Errors raised by [`Buffer`](crate::buffer::Buffer) accessors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// An access of `requested` bytes at `index` would cross the limit.
    #[error("access of {requested} byte(s) at index {index} exceeds limit {limit}")]
    OutOfBounds {
        index: usize,
        requested: usize,
        limit: usize,
    },

    /// A new position outside `0..=limit`.
    #[error("position {position} is outside 0..={limit}")]
    InvalidPosition { position: usize, limit: usize },

    /// A new limit larger than the capacity.
    #[error("limit {limit} exceeds capacity {capacity}")]
    InvalidLimit { limit: usize, capacity: usize },

    /// `reset()` without a prior `mark()`.
    #[error("mark is not set")]
    InvalidMark,

    /// Write attempted through a read-only view.
    #[error("buffer is read-only")]
    ReadOnly,

    /// The memory behind a view has been unmapped or its channel closed.
    #[error("buffer view has been invalidated")]
    Invalidated,
}

/// Errors raised by channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel has been closed.
    #[error("channel is closed")]
    Closed,

    /// The operation is not part of this channel kind's capability set.
    #[error("{kind} channel does not support {op}")]
    Unsupported { kind: ChannelKind, op: &'static str },

    /// The channel is registered with a selector and cannot block.
    #[error("channel is registered and cannot be switched to blocking mode")]
    Blocking,

    /// A connect is already in progress.
    #[error("connection already pending")]
    ConnectionPending,

    /// `finish_connect` without a pending connect.
    #[error("no connection pending")]
    NoConnectionPending,

    /// `connect` on a connected socket.
    #[error("socket is already connected")]
    AlreadyConnected,

    /// A buffer access failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// The platform call failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by selectors, registrations and event loops.
#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    /// The selector has been closed.
    #[error("selector is closed")]
    Closed,

    /// The registration has been cancelled.
    #[error("registration has been cancelled")]
    CancelledKey,

    /// The channel kind cannot be multiplexed.
    #[error("{0} channels cannot be registered with a selector")]
    NotSelectable(ChannelKind),

    /// The interest set names operations the channel kind does not support.
    #[error("interest {ops} is not valid for a {kind} channel")]
    InvalidOps { ops: Ops, kind: ChannelKind },

    /// `run` was entered while the loop was already running.
    #[error("event loop is already running")]
    AlreadyRunning,

    /// The channel rejected the registration (closed or blocking).
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The readiness primitive itself failed. Fatal to the selector.
    #[error("readiness primitive failed: {0}")]
    Platform(#[source] io::Error),
}

/// Errors delivered through a file I/O [`Completion`](crate::disk::Completion).
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    /// The operation was cancelled before a worker started it.
    #[error("operation was cancelled")]
    Cancelled,

    /// The engine shut down before the operation completed.
    #[error("disk engine has stopped")]
    EngineStopped,

    /// The file operation failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl ChannelError {
    /// Builds the capability-mismatch error.
    pub(crate) fn unsupported(kind: ChannelKind, op: &'static str) -> Self {
        Self::Unsupported { kind, op }
    }
}
