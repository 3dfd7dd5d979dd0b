//! Registrations.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::channel::{Channel, ChannelCore, ChannelKind};
use crate::error::SelectorError;
use crate::select::selector::SelectorShared;
use crate::select::{Ops, Token};

/// Opaque per-registration value.
pub type Attachment = Arc<dyn Any + Send + Sync>;

/// Registration state shared by the selector and every key handle.
pub(crate) struct KeyInner {
    token: Token,

    /// Descriptor number, used for poller bookkeeping after close.
    fd: RawFd,

    kind: ChannelKind,

    /// Weak so a registration never keeps its channel open.
    channel: Weak<ChannelCore>,

    /// A registration cannot outlive its selector's state.
    selector: Arc<SelectorShared>,

    interest: AtomicU8,
    ready: AtomicU8,
    cancelled: AtomicBool,

    /// Whether the poller currently watches the descriptor. Only flipped
    /// under the selector's state lock.
    installed: AtomicBool,

    attachment: Mutex<Option<Attachment>>,
}

impl KeyInner {
    pub(crate) fn new(
        token: Token,
        core: &Arc<ChannelCore>,
        selector: Arc<SelectorShared>,
        interest: Ops,
        attachment: Option<Attachment>,
    ) -> Self {
        Self {
            token,
            fd: core.raw_fd(),
            kind: core.kind(),
            channel: Arc::downgrade(core),
            selector,
            interest: AtomicU8::new(interest.bits()),
            ready: AtomicU8::new(0),
            cancelled: AtomicBool::new(false),
            installed: AtomicBool::new(false),
            attachment: Mutex::new(attachment),
        }
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub(crate) fn channel(&self) -> Option<Arc<ChannelCore>> {
        self.channel.upgrade()
    }

    pub(crate) fn selector(&self) -> &Arc<SelectorShared> {
        &self.selector
    }

    pub(crate) fn interest(&self) -> Ops {
        Ops::from_bits_truncate(self.interest.load(Ordering::Acquire))
    }

    pub(crate) fn set_interest(&self, ops: Ops) {
        self.interest.store(ops.bits(), Ordering::Release);
    }

    pub(crate) fn ready(&self) -> Ops {
        Ops::from_bits_truncate(self.ready.load(Ordering::Acquire))
    }

    pub(crate) fn set_ready(&self, ops: Ops) {
        self.ready.store(ops.bits(), Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Marks the key cancelled. Returns `false` if it already was.
    pub(crate) fn mark_cancelled(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_installed(&self, installed: bool) -> bool {
        self.installed.swap(installed, Ordering::AcqRel)
    }

    fn attachment_slot(&self) -> MutexGuard<'_, Option<Attachment>> {
        self.attachment.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn replace_attachment(&self, attachment: Option<Attachment>) -> Option<Attachment> {
        std::mem::replace(&mut *self.attachment_slot(), attachment)
    }

    /// Called by a closing channel: leaves the poller before the descriptor
    /// is released.
    pub(crate) fn deregister_on_close(self: &Arc<Self>) {
        self.selector.deregister_now(self);
    }
}

/// A handle to one channel's registration with one selector.
///
/// Clones refer to the same registration. Every method is safe to call from
/// any thread, including from a handler currently processing this key.
#[derive(Clone)]
pub struct SelectionKey {
    inner: Arc<KeyInner>,
}

impl SelectionKey {
    pub(crate) fn from_inner(inner: Arc<KeyInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<KeyInner> {
        &self.inner
    }

    /// Identifies the registration within its selector.
    pub fn token(&self) -> Token {
        self.inner.token
    }

    /// The registered channel, or `None` once it has been closed or dropped.
    pub fn channel(&self) -> Option<Channel> {
        self.inner
            .channel()
            .filter(|core| core.is_open())
            .map(Channel::from_core)
    }

    pub fn interest_ops(&self) -> Ops {
        self.inner.interest()
    }

    /// Replaces the interest set, effective from the next poll.
    ///
    /// Wakes a poll in progress so the change is not delayed until it times
    /// out.
    pub fn set_interest_ops(&self, ops: Ops) -> Result<(), SelectorError> {
        if self.inner.is_cancelled() {
            return Err(SelectorError::CancelledKey);
        }
        let valid = self.inner.kind.valid_ops();
        if !valid.contains(ops) {
            return Err(SelectorError::InvalidOps {
                ops,
                kind: self.inner.kind,
            });
        }
        self.inner.set_interest(ops);
        self.inner.selector.queue_change(&self.inner)
    }

    /// Operations found ready by the most recent poll that selected this
    /// key.
    pub fn ready_ops(&self) -> Ops {
        self.inner.ready()
    }

    pub fn is_readable(&self) -> bool {
        self.ready_ops().is_readable()
    }

    pub fn is_writable(&self) -> bool {
        self.ready_ops().is_writable()
    }

    pub fn is_acceptable(&self) -> bool {
        self.ready_ops().is_acceptable()
    }

    pub fn is_connectable(&self) -> bool {
        self.ready_ops().is_connectable()
    }

    /// Replaces the attachment, returning the previous one.
    pub fn attach(&self, attachment: Option<Attachment>) -> Option<Attachment> {
        self.inner.replace_attachment(attachment)
    }

    pub fn attachment(&self) -> Option<Attachment> {
        self.inner.attachment_slot().clone()
    }

    /// The attachment downcast to `T`.
    pub fn attachment_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.attachment()?.downcast::<T>().ok()
    }

    /// Cancels the registration. Idempotent.
    ///
    /// The key is dropped from the selector's active set at the start of the
    /// next poll and never appears in a readiness result again.
    pub fn cancel(&self) {
        if self.inner.mark_cancelled() {
            self.inner.selector.queue_cancel(&self.inner);
        }
    }

    /// `false` once cancelled, explicitly or by closing the channel or the
    /// selector.
    pub fn is_valid(&self) -> bool {
        !self.inner.is_cancelled()
    }
}

impl PartialEq for SelectionKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SelectionKey {}

impl Hash for SelectionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state);
    }
}

impl fmt::Debug for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionKey")
            .field("token", &self.inner.token)
            .field("kind", &self.inner.kind)
            .field("interest", &self.interest_ops())
            .field("ready", &self.ready_ops())
            .field("valid", &self.is_valid())
            .finish()
    }
}
