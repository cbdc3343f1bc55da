//! Pollable sources: timers and file-descriptor endpoints.
//!
//! A [`Source`] is a cloneable handle over one underlying capability,
//! selected at construction and never re-tagged. Every source carries a
//! notification callback and remembers which reactor currently owns it;
//! the owner edge is a back-reference, not ownership.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustix::net::SendFlags;

use crate::diag;
use crate::reactor::{Reactor, ReactorId};

/// Why a source is being notified.
///
/// `TimerFired` is exclusive to timers; the other reasons are exclusive to
/// file-descriptor sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notify {
    /// The descriptor has readable data (or a pending accept).
    CanRead,
    /// The peer hung up.
    Disconnected,
    /// The descriptor is in an error state.
    Error,
    /// The timer's deadline elapsed.
    TimerFired,
}

/// Notification callback invoked on the reactor thread.
///
/// The callback receives the running reactor, so it may re-enter it
/// (add/remove sources, stop, dispatch).
pub type NotifyFn = Box<dyn FnMut(&mut Reactor, &Source, Notify) + Send>;

/// Unique identity of a source handle family (all clones share it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl SourceId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src#{}", self.0)
    }
}

pub(crate) struct TimerState {
    pub interval_ms: u64,
    pub periodic: bool,
    pub active: bool,
    /// Must be re-reconciled into the wheel before the next poll.
    pub dirty: bool,
}

struct FdState {
    /// `None` only transiently during teardown.
    fd: Option<OwnedFd>,
    raw: RawFd,
    close_on_destruct: bool,
}

enum Kind {
    Timer(TimerState),
    Fd(FdState),
}

struct Inner {
    kind: Kind,
    callback: Option<NotifyFn>,
    owner: Option<ReactorId>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Kind::Fd(state) = &mut self.kind {
            if !state.close_on_destruct {
                // Caller retains responsibility for the descriptor.
                if let Some(fd) = state.fd.take() {
                    let _ = fd.into_raw_fd();
                }
            }
        }
        diag::source_dropped();
    }
}

/// A pollable object: either a timer or a file descriptor.
///
/// Clones share state; identity is the [`SourceId`].
#[derive(Clone)]
pub struct Source {
    id: SourceId,
    inner: Arc<Mutex<Inner>>,
}

impl Source {
    /// Creates a timer source. Starts active and dirty.
    ///
    /// `interval_ms` of 0 is clamped to 1 tick.
    #[must_use]
    pub fn timer(interval_ms: u64, periodic: bool) -> Self {
        Self::new(Kind::Timer(TimerState {
            interval_ms: interval_ms.max(1),
            periodic,
            active: true,
            dirty: true,
        }))
    }

    /// Wraps an owned descriptor.
    ///
    /// The source does *not* close the descriptor on drop unless
    /// [`set_close_on_destruct`](Self::set_close_on_destruct) is set.
    #[must_use]
    pub fn from_fd(fd: OwnedFd) -> Self {
        let raw = fd.as_raw_fd();
        Self::new(Kind::Fd(FdState {
            fd: Some(fd),
            raw,
            close_on_destruct: false,
        }))
    }

    fn new(kind: Kind) -> Self {
        diag::source_created();
        Self {
            id: SourceId::next(),
            inner: Arc::new(Mutex::new(Inner {
                kind,
                callback: None,
                owner: None,
            })),
        }
    }

    #[must_use]
    pub fn id(&self) -> SourceId {
        self.id
    }

    /// The reactor currently holding this source, if any.
    #[must_use]
    pub fn owner(&self) -> Option<ReactorId> {
        self.inner.lock().owner
    }

    /// Installs the notification callback, replacing any previous one.
    pub fn set_callback(&self, f: impl FnMut(&mut Reactor, &Source, Notify) + Send + 'static) {
        self.inner.lock().callback = Some(Box::new(f));
    }

    /// Drops the notification callback, if any.
    pub fn clear_callback(&self) {
        self.inner.lock().callback = None;
    }

    #[must_use]
    pub fn has_callback(&self) -> bool {
        let inner = self.inner.lock();
        inner.callback.is_some()
    }

    #[must_use]
    pub fn is_timer(&self) -> bool {
        matches!(self.inner.lock().kind, Kind::Timer(_))
    }

    // --- timer interface ---------------------------------------------------

    /// Sets the timer interval in milliseconds. `false` for 0 or a non-timer.
    pub fn set_interval(&self, interval_ms: u64) -> bool {
        if interval_ms == 0 {
            return false;
        }
        self.mutate_timer(|t| t.interval_ms = interval_ms)
    }

    /// The timer interval, or `None` for a non-timer.
    #[must_use]
    pub fn interval(&self) -> Option<u64> {
        match &self.inner.lock().kind {
            Kind::Timer(t) => Some(t.interval_ms),
            Kind::Fd(_) => None,
        }
    }

    /// Marks the timer periodic (rearmed after each fire) or one-shot.
    pub fn set_periodic(&self, periodic: bool) -> bool {
        self.mutate_timer(|t| t.periodic = periodic)
    }

    /// Activates or deactivates the timer.
    pub fn set_active(&self, active: bool) -> bool {
        self.mutate_timer(|t| t.active = active)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(&self.inner.lock().kind, Kind::Timer(t) if t.active)
    }

    /// Applies a timer mutation and marks the timer dirty.
    fn mutate_timer(&self, f: impl FnOnce(&mut TimerState)) -> bool {
        match &mut self.inner.lock().kind {
            Kind::Timer(t) => {
                f(t);
                t.dirty = true;
                true
            }
            Kind::Fd(_) => false,
        }
    }

    // --- descriptor interface ----------------------------------------------

    /// Reads from the descriptor. Blocking semantics follow the fd itself.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a timer source; otherwise the raw OS error
    /// (including `Interrupted`, which callers are expected to retry).
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let inner = self.inner.lock();
        match &inner.kind {
            Kind::Fd(state) => match &state.fd {
                Some(fd) => Ok(rustix::io::read(fd, buf)?),
                None => Err(io::ErrorKind::NotConnected.into()),
            },
            Kind::Timer(_) => Err(io::ErrorKind::InvalidInput.into()),
        }
    }

    /// Writes to the descriptor via `write(2)`.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let inner = self.inner.lock();
        match &inner.kind {
            Kind::Fd(state) => match &state.fd {
                Some(fd) => Ok(rustix::io::write(fd, buf)?),
                None => Err(io::ErrorKind::NotConnected.into()),
            },
            Kind::Timer(_) => Err(io::ErrorKind::InvalidInput.into()),
        }
    }

    /// Sends via `send(2)` with the given flags (e.g. `SendFlags::NOSIGNAL`).
    pub fn send(&self, buf: &[u8], flags: SendFlags) -> io::Result<usize> {
        let inner = self.inner.lock();
        match &inner.kind {
            Kind::Fd(state) => match &state.fd {
                Some(fd) => Ok(rustix::net::send(fd, buf, flags)?),
                None => Err(io::ErrorKind::NotConnected.into()),
            },
            Kind::Timer(_) => Err(io::ErrorKind::InvalidInput.into()),
        }
    }

    /// Whether dropping the last handle closes the descriptor.
    pub fn set_close_on_destruct(&self, close: bool) -> bool {
        match &mut self.inner.lock().kind {
            Kind::Fd(state) => {
                state.close_on_destruct = close;
                true
            }
            Kind::Timer(_) => false,
        }
    }

    /// Raw descriptor for polling, `None` for timers.
    #[must_use]
    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        match &self.inner.lock().kind {
            Kind::Fd(state) => state.fd.as_ref().map(|_| state.raw),
            Kind::Timer(_) => None,
        }
    }

    /// Borrows the owned descriptor for syscalls needing `AsFd` access.
    pub(crate) fn with_fd<R>(&self, f: impl FnOnce(&OwnedFd) -> R) -> Option<R> {
        match &self.inner.lock().kind {
            Kind::Fd(state) => state.fd.as_ref().map(f),
            Kind::Timer(_) => None,
        }
    }

    // --- reactor integration (crate-internal) ------------------------------

    /// Claims ownership for `reactor`; fails if any reactor already owns it.
    pub(crate) fn claim(&self, reactor: ReactorId) -> bool {
        let mut inner = self.inner.lock();
        if inner.owner.is_some() {
            return false;
        }
        inner.owner = Some(reactor);
        true
    }

    /// Releases ownership held by `reactor`; fails for any other owner.
    pub(crate) fn release(&self, reactor: ReactorId) -> bool {
        let mut inner = self.inner.lock();
        if inner.owner != Some(reactor) {
            return false;
        }
        inner.owner = None;
        true
    }

    /// Snapshot of `(interval_ms, periodic, active, dirty)` for a timer.
    pub(crate) fn timer_snapshot(&self) -> Option<(u64, bool, bool, bool)> {
        match &self.inner.lock().kind {
            Kind::Timer(t) => Some((t.interval_ms, t.periodic, t.active, t.dirty)),
            Kind::Fd(_) => None,
        }
    }

    pub(crate) fn clear_dirty(&self) {
        if let Kind::Timer(t) = &mut self.inner.lock().kind {
            t.dirty = false;
        }
    }

    /// Deactivates a fired one-shot without re-marking it dirty.
    pub(crate) fn quiesce(&self) {
        if let Kind::Timer(t) = &mut self.inner.lock().kind {
            t.active = false;
        }
    }

    /// Takes the callback out for dispatch, leaving the slot empty so
    /// re-entrant source access never observes a held lock.
    pub(crate) fn take_callback(&self) -> Option<NotifyFn> {
        self.inner.lock().callback.take()
    }

    /// Restores a callback after dispatch unless it was replaced mid-call.
    pub(crate) fn restore_callback(&self, cb: NotifyFn) {
        let mut inner = self.inner.lock();
        if inner.callback.is_none() {
            inner.callback = Some(cb);
        }
    }
}

impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Source {}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_mutation_marks_dirty() {
        let t = Source::timer(10, false);
        t.clear_dirty();
        assert!(t.set_interval(25));
        let (interval, _, _, dirty) = t.timer_snapshot().unwrap();
        assert_eq!(interval, 25);
        assert!(dirty);
    }

    #[test]
    fn zero_interval_rejected() {
        let t = Source::timer(10, false);
        assert!(!t.set_interval(0));
        assert_eq!(t.interval(), Some(10));
    }

    #[test]
    fn timer_rejects_fd_operations() {
        let t = Source::timer(5, true);
        let mut buf = [0u8; 4];
        assert!(t.read(&mut buf).is_err());
        assert!(t.write(b"x").is_err());
        assert!(!t.set_close_on_destruct(true));
    }

    #[test]
    fn fd_source_rejects_timer_operations() {
        let (a, _b) = rustix::pipe::pipe().unwrap();
        let s = Source::from_fd(a);
        s.set_close_on_destruct(true);
        assert!(!s.set_interval(5));
        assert!(!s.set_periodic(true));
        assert_eq!(s.interval(), None);
    }

    #[test]
    fn clones_share_identity_and_state() {
        let t = Source::timer(10, false);
        let t2 = t.clone();
        assert_eq!(t, t2);
        t2.set_interval(99);
        assert_eq!(t.interval(), Some(99));
    }
}
