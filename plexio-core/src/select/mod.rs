//! Readiness selection.
//!
//! A [`Selector`] multiplexes many non-blocking channels over one blocking
//! wait. Channels are registered for a set of [`Ops`]; each registration is
//! represented by a [`SelectionKey`]. After [`Selector::poll`] the keys whose
//! channels are ready for an interested operation sit in the
//! [`SelectedKeys`] set until the caller removes them.
//!
//! Cancellation and interest changes are queued and applied at the next poll
//! boundary, so the active set is never mutated mid-iteration.

mod key;
mod ops;
mod selected;
mod selector;

pub use key::{Attachment, SelectionKey};
pub(crate) use key::KeyInner;
pub use ops::Ops;
pub use selected::SelectedKeys;
pub use selector::{Selector, SelectorHandle};

use crate::sys::PollerBackend;

/// Identifies a registration within its selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

/// Selector settings.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Readiness primitive.
    pub backend: PollerBackend,

    /// Most events collected per wait.
    pub events_capacity: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            backend: PollerBackend::Auto,
            events_capacity: 1024,
        }
    }
}
