//! The selector: readiness polling over a set of registrations.
//!
//! State is split in two:
//! - [`SelectorShared`] holds the poller and the pending lists (added,
//!   changed and cancelled keys). Any thread may touch it through a
//!   [`SelectorHandle`] or a [`SelectionKey`].
//! - [`Selector`] holds the active key map and the selected set. Only the
//!   polling thread touches it, so the active set is never mutated while a
//!   wait is in progress.
//!
//! Pending changes are applied at the start of each poll. Cross-thread
//! changes wake a poll already in progress so they take effect promptly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use std::{fmt, mem};

use crate::channel::{ChannelCore, ChannelKind, SelectableChannel};
use crate::error::{ChannelError, SelectorError};
use crate::select::key::{Attachment, KeyInner, SelectionKey};
use crate::select::{Ops, SelectedKeys, SelectorConfig, Token};
use crate::sys::{self, PollEvent, Poller};

/// Registrations changed since the last poll.
#[derive(Default)]
struct Pending {
    /// A poll is between draining this state and returning. Changes made
    /// while set must wake the poller.
    polling: bool,

    added: Vec<Arc<KeyInner>>,
    changed: Vec<Arc<KeyInner>>,
    cancelled: Vec<Arc<KeyInner>>,
}

/// Selector state reachable from any thread.
pub(crate) struct SelectorShared {
    /// `None` once the selector is closed.
    poller: RwLock<Option<Box<dyn Poller>>>,

    /// Taken before the poller lock whenever both are needed.
    state: Mutex<Pending>,

    closed: AtomicBool,
    next_token: AtomicUsize,
}

impl SelectorShared {
    fn lock_state(&self) -> MutexGuard<'_, Pending> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poller(&self) -> RwLockReadGuard<'_, Option<Box<dyn Poller>>> {
        self.poller.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn wake(&self) -> Result<(), SelectorError> {
        match self.poller().as_ref() {
            Some(poller) => poller.wake().map_err(SelectorError::Platform),
            None => Err(SelectorError::Closed),
        }
    }

    /// Wakes the poller when a poll is in progress. Called with the state
    /// lock held.
    fn wake_if_polling(&self, state: &Pending) {
        if !state.polling {
            return;
        }
        if let Err(e) = self.wake() {
            tracing::warn!("Failed to wake selector: {}", e);
        }
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        core: &Arc<ChannelCore>,
        ops: Ops,
        attachment: Option<Attachment>,
    ) -> Result<SelectionKey, SelectorError> {
        if self.is_closed() {
            return Err(SelectorError::Closed);
        }
        let kind = core.kind();
        if !kind.is_selectable() {
            return Err(SelectorError::NotSelectable(kind));
        }
        if !kind.valid_ops().contains(ops) {
            return Err(SelectorError::InvalidOps { ops, kind });
        }

        // Held until the key is queued so a concurrent close sees it
        let mut registrations = core.registrations();
        if !core.is_open() {
            return Err(ChannelError::Closed.into());
        }
        if core.is_blocking() {
            return Err(ChannelError::Blocking.into());
        }

        registrations.retain(|weak| weak.strong_count() > 0);
        let existing = registrations
            .iter()
            .filter_map(|weak| weak.upgrade())
            .find(|key| Arc::ptr_eq(key.selector(), self) && !key.is_cancelled());
        if let Some(existing) = existing {
            let key = SelectionKey::from_inner(existing);
            key.set_interest_ops(ops)?;
            key.attach(attachment);
            return Ok(key);
        }

        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        let inner = Arc::new(KeyInner::new(token, core, self.clone(), ops, attachment));

        {
            let mut state = self.lock_state();
            if self.is_closed() {
                return Err(SelectorError::Closed);
            }
            state.added.push(inner.clone());
            self.wake_if_polling(&state);
        }
        registrations.push(Arc::downgrade(&inner));

        tracing::debug!(
            "Registered {} channel fd {} as {:?} for {}",
            kind,
            inner.fd(),
            token,
            ops
        );
        Ok(SelectionKey::from_inner(inner))
    }

    pub(crate) fn queue_change(&self, key: &Arc<KeyInner>) -> Result<(), SelectorError> {
        let mut state = self.lock_state();
        if self.is_closed() {
            return Err(SelectorError::Closed);
        }
        state.changed.push(key.clone());
        self.wake_if_polling(&state);
        Ok(())
    }

    pub(crate) fn queue_cancel(&self, key: &Arc<KeyInner>) {
        let mut state = self.lock_state();
        if self.is_closed() {
            return;
        }
        state.cancelled.push(key.clone());
        self.wake_if_polling(&state);
    }

    /// Cancels `key` and removes its descriptor from the poller right away.
    /// Used when the channel closes, before the descriptor is released.
    pub(crate) fn deregister_now(&self, key: &Arc<KeyInner>) {
        let mut state = self.lock_state();
        key.mark_cancelled();
        if self.is_closed() {
            return;
        }
        if key.set_installed(false) {
            if let Some(poller) = self.poller().as_ref() {
                if let Err(e) = poller.delete(key.fd()) {
                    tracing::warn!("Failed to deregister fd {}: {}", key.fd(), e);
                }
            }
        }
        state.cancelled.push(key.clone());
        self.wake_if_polling(&state);
    }
}

/// A cloneable, thread-safe handle to a selector.
///
/// Offers the operations that are safe while another thread polls:
/// registration and wake-up.
#[derive(Clone)]
pub struct SelectorHandle {
    shared: Arc<SelectorShared>,
}

impl SelectorHandle {
    /// Registers `channel` for `ops`. See [`Selector::register`].
    pub fn register(
        &self,
        channel: &impl SelectableChannel,
        ops: Ops,
        attachment: Option<Attachment>,
    ) -> Result<SelectionKey, SelectorError> {
        self.shared.register(channel.core(), ops, attachment)
    }

    /// Makes the current (or next) poll return immediately.
    pub fn wake(&self) -> Result<(), SelectorError> {
        self.shared.wake()
    }

    pub fn is_open(&self) -> bool {
        !self.shared.is_closed()
    }
}

impl fmt::Debug for SelectorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorHandle")
            .field("open", &self.is_open())
            .finish()
    }
}

/// A readiness selector.
///
/// Owned by the polling thread. Use [`handle`](Self::handle) to register
/// channels or wake the selector from other threads.
pub struct Selector {
    shared: Arc<SelectorShared>,

    /// Active registrations by token.
    keys: HashMap<Token, SelectionKey>,

    selected: SelectedKeys,

    /// Scratch space for poller events.
    events: Vec<PollEvent>,

    /// Tokens of registrations removed since last taken.
    removed: Vec<Token>,
}

impl Selector {
    /// Opens a selector with the default configuration.
    pub fn open() -> Result<Self, SelectorError> {
        Self::with_config(SelectorConfig::default())
    }

    pub fn with_config(config: SelectorConfig) -> Result<Self, SelectorError> {
        let poller = sys::new_poller(config.backend, config.events_capacity)
            .map_err(SelectorError::Platform)?;

        tracing::debug!("Opened selector ({:?} backend)", config.backend);

        Ok(Self {
            shared: Arc::new(SelectorShared {
                poller: RwLock::new(Some(poller)),
                state: Mutex::new(Pending::default()),
                closed: AtomicBool::new(false),
                next_token: AtomicUsize::new(0),
            }),
            keys: HashMap::new(),
            selected: SelectedKeys::default(),
            events: Vec::with_capacity(config.events_capacity),
            removed: Vec::new(),
        })
    }

    pub fn handle(&self) -> SelectorHandle {
        SelectorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Registers `channel` for `ops`.
    ///
    /// The channel must be open and non-blocking, and `ops` must be valid for
    /// its kind. Registering a channel that already has a live registration
    /// with this selector returns that key with its interest and attachment
    /// replaced.
    pub fn register(
        &self,
        channel: &impl SelectableChannel,
        ops: Ops,
        attachment: Option<Attachment>,
    ) -> Result<SelectionKey, SelectorError> {
        self.shared.register(channel.core(), ops, attachment)
    }

    /// Makes the current (or next) poll return immediately.
    pub fn wake(&self) -> Result<(), SelectorError> {
        self.shared.wake()
    }

    pub fn is_open(&self) -> bool {
        !self.shared.is_closed()
    }

    /// Snapshot of the live registrations.
    pub fn keys(&self) -> Vec<SelectionKey> {
        self.keys
            .values()
            .filter(|key| key.is_valid())
            .cloned()
            .collect()
    }

    /// Keys selected by polls and not yet acknowledged.
    pub fn selected_keys(&mut self) -> &mut SelectedKeys {
        &mut self.selected
    }

    /// Polls without blocking.
    pub fn poll_now(&mut self) -> Result<usize, SelectorError> {
        self.poll(Some(Duration::ZERO))
    }

    /// Waits for readiness and updates the selected set.
    ///
    /// `None` waits indefinitely, `Some(Duration::ZERO)` returns at once.
    /// Returns the number of keys added to the selected set or whose ready
    /// operations grew. A [`wake`](Self::wake) only cuts the wait short:
    /// readiness collected by that wait is still reported, and a woken poll
    /// with nothing ready returns 0.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<usize, SelectorError> {
        // Step 1: apply pending registrations, changes and cancellations
        self.apply_pending()?;

        // Step 2: wait
        self.events.clear();
        let woken = {
            let poller = self.shared.poller();
            let poller = poller.as_ref().ok_or(SelectorError::Closed)?;
            poller.wait(&mut self.events, timeout)
        };
        self.shared.lock_state().polling = false;

        let woken = woken.map_err(|e| {
            tracing::error!("Readiness wait failed: {}", e);
            SelectorError::Platform(e)
        })?;
        if woken {
            tracing::trace!("Selector woken with {} event(s) pending", self.events.len());
        }

        // Step 3: translate platform readiness into selected keys
        let mut updated = 0;
        for event in self.events.drain(..) {
            let Some(key) = self.keys.get(&Token(event.token)) else {
                continue;
            };
            let inner = key.inner();
            if inner.is_cancelled() {
                continue;
            }
            // Closed between the wake and now
            let Some(core) = inner.channel().filter(|core| core.is_open()) else {
                continue;
            };

            let ready = translate(inner.kind(), core.is_connect_pending(), &event) & inner.interest();
            if ready.is_empty() {
                continue;
            }

            if self.selected.contains_token(inner.token()) {
                let previous = inner.ready() & inner.interest();
                let merged = previous | ready;
                inner.set_ready(merged);
                if merged != previous {
                    updated += 1;
                }
            } else {
                inner.set_ready(ready);
                self.selected.insert(key.clone());
                updated += 1;
            }
        }

        tracing::trace!("Poll selected {} key(s)", updated);
        Ok(updated)
    }

    fn apply_pending(&mut self) -> Result<(), SelectorError> {
        let mut state = self.shared.lock_state();
        if self.shared.is_closed() {
            return Err(SelectorError::Closed);
        }
        state.polling = true;

        let added = mem::take(&mut state.added);
        let changed = mem::take(&mut state.changed);
        let cancelled = mem::take(&mut state.cancelled);

        let poller = self.shared.poller();
        let Some(poller) = poller.as_ref() else {
            state.polling = false;
            return Err(SelectorError::Closed);
        };

        for key in cancelled {
            let token = key.token();
            self.keys.remove(&token);
            self.selected.remove_token(token);
            if key.set_installed(false) {
                if let Err(e) = poller.delete(key.fd()) {
                    tracing::debug!("Deregistering fd {} failed: {}", key.fd(), e);
                }
            }
            self.removed.push(token);
            tracing::debug!("Cancelled {:?}", token);
        }

        for key in changed {
            if key.is_cancelled() || !self.keys.contains_key(&key.token()) {
                continue;
            }
            let token = key.token();
            let ops = key.interest();

            // Ready ops only ever report what is currently of interest
            let ready = key.ready() & ops;
            key.set_ready(ready);
            if ready.is_empty() {
                self.selected.remove_token(token);
            }

            // An empty interest set leaves the poller, which would otherwise
            // keep reporting hang-up and error conditions
            let result = if ops.is_empty() {
                if key.set_installed(false) {
                    poller.delete(key.fd())
                } else {
                    Ok(())
                }
            } else if key.set_installed(true) {
                poller.modify(key.fd(), token.0, ops.to_interest())
            } else {
                poller.add(key.fd(), token.0, ops.to_interest())
            };

            if let Err(e) = result {
                tracing::warn!("Updating interest of fd {} failed: {}", key.fd(), e);
                key.mark_cancelled();
                if key.set_installed(false) {
                    let _ = poller.delete(key.fd());
                }
                self.keys.remove(&token);
                self.selected.remove_token(token);
                self.removed.push(token);
            }
        }

        for key in added {
            if key.is_cancelled() {
                continue;
            }
            let ops = key.interest();
            if ops.is_empty() {
                tracing::trace!("{:?} registered with no interest", key.token());
                self.keys
                    .insert(key.token(), SelectionKey::from_inner(key));
                continue;
            }
            match poller.add(key.fd(), key.token().0, ops.to_interest()) {
                Ok(()) => {
                    key.set_installed(true);
                    self.keys
                        .insert(key.token(), SelectionKey::from_inner(key));
                }
                Err(e) => {
                    tracing::warn!("Adding fd {} to the poller failed: {}", key.fd(), e);
                    key.mark_cancelled();
                    self.removed.push(key.token());
                }
            }
        }

        Ok(())
    }

    /// Tokens of registrations removed from the active set since the last
    /// call.
    pub(crate) fn take_removed(&mut self) -> Vec<Token> {
        mem::take(&mut self.removed)
    }

    /// Closes the selector: cancels every registration and releases the
    /// poller. Idempotent.
    pub fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let count = {
            let mut state = self.shared.lock_state();
            let pending = mem::take(&mut *state);
            let poller = self.shared.poller();

            let live = self.keys.values().map(|key| key.inner().clone());
            let mut count = 0;
            let queued = pending
                .added
                .into_iter()
                .chain(pending.changed)
                .chain(pending.cancelled);
            for key in live.chain(queued) {
                key.mark_cancelled();
                if key.set_installed(false) {
                    if let Some(poller) = poller.as_ref() {
                        let _ = poller.delete(key.fd());
                    }
                    count += 1;
                }
            }
            count
        };

        self.removed.extend(self.keys.keys().copied());
        self.keys.clear();
        self.selected.clear();

        // Waits for in-flight wakes to finish with the poller
        let poller = self
            .shared
            .poller
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(poller);

        tracing::debug!("Closed selector ({} registration(s) cancelled)", count);
    }
}

/// Maps platform readiness onto the operations it enables for a kind.
///
/// Errors and hang-ups enable everything so the handler observes the
/// failure on its next operation.
fn translate(kind: ChannelKind, connect_pending: bool, event: &PollEvent) -> Ops {
    let failed = event.error || event.hangup;
    let mut ops = Ops::NONE;

    if event.readable || failed {
        ops |= match kind {
            ChannelKind::Listener => Ops::ACCEPT,
            _ => Ops::READ,
        };
    }
    if (event.writable || failed) && kind == ChannelKind::Stream {
        ops |= if connect_pending {
            Ops::CONNECT
        } else {
            Ops::WRITE
        };
    }

    ops
}

impl Drop for Selector {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("open", &self.is_open())
            .field("keys", &self.keys.len())
            .field("selected", &self.selected.len())
            .finish()
    }
}
