//! Plexio Core - readiness-based non-blocking I/O multiplexing
//!
//! This library provides the building blocks for single-threaded servers
//! that serve many connections at once:
//! - [`buffer`]: bounds-checked byte buffers with position, limit and mark
//! - [`channel`]: file, listening-socket and connected-socket channels
//! - [`select`]: selectors that report which channels are ready
//! - [`event_loop`]: loops that dispatch readiness to handlers
//! - [`shard`]: groups of loops spread over cores
//! - [`disk`]: one-shot file operations with completion handles

/// Core detection and worker thread placement
pub mod arch;

/// Byte buffers and scatter/gather helpers
pub mod buffer;

/// I/O channels
pub mod channel;

/// File operations on worker threads
pub mod disk;

/// Error types
pub mod error;

/// Event loops
pub mod event_loop;

/// Memory-mapped file regions
pub mod mmap;

/// Readiness selection
pub mod select;

/// Event loop groups
pub mod shard;

/// Platform readiness primitives
pub mod sys;

pub use buffer::{Buffer, ByteOrder};
pub use channel::{Channel, FileChannel, ReadStatus, ServerSocketChannel, SocketChannel};
pub use error::{BufferError, ChannelError, DiskError, SelectorError};
pub use event_loop::{EventLoop, LoopConfig, LoopHandle, LoopState};
pub use mmap::{MapMode, MappedRegion};
pub use select::{Ops, SelectionKey, Selector, SelectorConfig, Token};
pub use shard::{GroupConfig, LoopGroup};
