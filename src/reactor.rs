//! Single-threaded poll-based event loop.
//!
//! One thread calls [`Reactor::run`] and that thread executes every callback:
//! timer fires, descriptor readiness, queued async calls. The only
//! cross-thread entry points are [`ReactorHandle::stop`],
//! [`ReactorHandle::dispatch_async`] and [`ReactorHandle::dispatch_after`];
//! they wake the loop through a self-pipe so `poll(2)` observes "someone
//! wants my attention" like any other event, one byte per wakeup. A TASK
//! byte pops exactly one queued call, so N enqueues drain over N loop
//! iterations in FIFO order rather than as a batch.

mod source;
pub(crate) mod wheel;

pub use source::{Notify, NotifyFn, Source, SourceId};

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use minstant::Instant;
use parking_lot::Mutex;
use rustix::event::{PollFd, PollFlags};
use rustix::io::Errno;
use thiserror::Error;

use crate::diag;
use crate::trace::{debug, trace, warn};
use wheel::TimerWheel;

/// Wakeup byte: poll should return and re-check the stop flag.
const WAKE_BYTE: u8 = 0;
/// Task byte: pop and run exactly one queued async call.
const TASK_BYTE: u8 = 1;

/// Errors surfaced by reactor operations.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// The source has no notification callback installed.
    #[error("source has no notification callback")]
    NoCallback,
    /// The source already belongs to a reactor (possibly this one).
    #[error("source already belongs to a reactor")]
    AlreadyOwned,
    /// The source is not owned by this reactor.
    #[error("source is not owned by this reactor")]
    NotOwner,
    /// `run()` was called while the reactor is already running.
    #[error("reactor is already running")]
    AlreadyRunning,
    /// Self-pipe or poll failure.
    #[error("reactor I/O error: {0}")]
    Io(#[from] Errno),
}

/// Identity of a reactor instance, used for source ownership checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReactorId(u64);

impl ReactorId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ReactorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reactor#{}", self.0)
    }
}

/// A queued cross-thread call, run on the reactor thread.
///
/// Dropped without running if the reactor is destroyed first.
pub type AsyncCall = Box<dyn FnOnce(&mut Reactor) + Send>;

/// State shared with [`ReactorHandle`]s on other threads.
struct Shared {
    queue: Mutex<VecDeque<AsyncCall>>,
    wake_tx: OwnedFd,
    running: AtomicBool,
    stop: AtomicBool,
}

impl Shared {
    fn wake(&self, byte: u8) -> Result<(), Errno> {
        loop {
            match rustix::io::write(&self.wake_tx, &[byte]) {
                Ok(_) => return Ok(()),
                Err(Errno::INTR) => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn enqueue(&self, call: AsyncCall) -> Result<(), ReactorError> {
        self.queue.lock().push_back(call);
        self.wake(TASK_BYTE)?;
        Ok(())
    }

    fn request_stop(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        self.stop.store(true, Ordering::SeqCst);
        // Best-effort: if the pipe is gone the loop is already exiting.
        let _ = self.wake(WAKE_BYTE);
        true
    }
}

/// Cloneable, thread-safe handle to a reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    /// Requests the run loop to exit. `false` if the reactor is not running.
    ///
    /// Stopping is asynchronous: the loop observes the flag at the top of its
    /// next iteration and may still be mid-dispatch when this returns.
    pub fn stop(&self) -> bool {
        self.shared.request_stop()
    }

    /// Whether `run()` is currently executing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Enqueues `f` to run on the reactor thread, FIFO with other calls.
    ///
    /// # Errors
    ///
    /// Fails only if the wakeup pipe write fails.
    pub fn dispatch_async(
        &self,
        f: impl FnOnce(&mut Reactor) + Send + 'static,
    ) -> Result<(), ReactorError> {
        self.shared.enqueue(Box::new(f))
    }

    /// Runs `f` on the reactor thread after `delay_ms` milliseconds.
    ///
    /// # Errors
    ///
    /// Fails only if the wakeup pipe write fails.
    pub fn dispatch_after(
        &self,
        delay_ms: u64,
        f: impl FnOnce(&mut Reactor) + Send + 'static,
    ) -> Result<(), ReactorError> {
        self.dispatch_async(move |reactor| {
            if let Err(_err) = reactor.dispatch_after(delay_ms, f) {
                warn!(error = %_err, "dispatch_after: timer registration failed");
            }
        })
    }
}

/// The event loop: descriptor sources, timers, and an async-call queue.
///
/// Created inert; [`run`](Self::run) blocks the calling thread until a stop
/// request is observed. All mutators other than the handle entry points must
/// be called from the thread running the loop, or before the loop starts.
pub struct Reactor {
    id: ReactorId,
    /// Registration order is dispatch order within one poll iteration.
    fd_sources: Vec<Source>,
    timers: Vec<Source>,
    wheel: TimerWheel<SourceId>,
    wake_rx: OwnedFd,
    shared: Arc<Shared>,
}

impl Reactor {
    /// Creates an inert reactor.
    ///
    /// # Errors
    ///
    /// Fails if the self-pipe cannot be created.
    pub fn new() -> Result<Self, ReactorError> {
        let (wake_rx, wake_tx) = rustix::pipe::pipe()?;
        diag::reactor_created();
        Ok(Self {
            id: ReactorId::next(),
            fd_sources: Vec::new(),
            timers: Vec::new(),
            wheel: TimerWheel::new(),
            wake_rx,
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                wake_tx,
                running: AtomicBool::new(false),
                stop: AtomicBool::new(false),
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> ReactorId {
        self.id
    }

    /// A cloneable handle for cross-thread stop and dispatch.
    #[must_use]
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Registers a source with this reactor.
    ///
    /// A dirty timer is immediately reconciled into the wheel (or out of it,
    /// when inactive).
    ///
    /// # Errors
    ///
    /// [`ReactorError::NoCallback`] if no callback is installed;
    /// [`ReactorError::AlreadyOwned`] if any reactor (this one included)
    /// already holds the source.
    pub fn add_source(&mut self, src: &Source) -> Result<(), ReactorError> {
        if !src.has_callback() {
            return Err(ReactorError::NoCallback);
        }
        if !src.claim(self.id) {
            return Err(ReactorError::AlreadyOwned);
        }
        if src.is_timer() {
            self.timers.push(src.clone());
            self.reconcile_timer(src);
        } else {
            self.fd_sources.push(src.clone());
        }
        trace!(source = %src.id(), reactor = %self.id, "source added");
        Ok(())
    }

    /// Detaches a source; timers leave the wheel.
    ///
    /// # Errors
    ///
    /// [`ReactorError::NotOwner`] if this reactor does not hold the source.
    pub fn remove_source(&mut self, src: &Source) -> Result<(), ReactorError> {
        if !src.release(self.id) {
            return Err(ReactorError::NotOwner);
        }
        self.fd_sources.retain(|s| s != src);
        self.timers.retain(|s| s != src);
        self.wheel.remove(src.id());
        trace!(source = %src.id(), reactor = %self.id, "source removed");
        Ok(())
    }

    /// Enqueues `f` to run on the reactor thread; see [`ReactorHandle::dispatch_async`].
    ///
    /// # Errors
    ///
    /// Fails only if the wakeup pipe write fails.
    pub fn dispatch_async(
        &self,
        f: impl FnOnce(&mut Reactor) + Send + 'static,
    ) -> Result<(), ReactorError> {
        self.shared.enqueue(Box::new(f))
    }

    /// Runs `f` once after `delay_ms`, via an internal one-shot timer that
    /// removes itself on fire.
    ///
    /// # Errors
    ///
    /// Propagates source registration failures (not expected for a fresh
    /// timer).
    pub fn dispatch_after(
        &mut self,
        delay_ms: u64,
        f: impl FnOnce(&mut Reactor) + Send + 'static,
    ) -> Result<(), ReactorError> {
        let timer = Source::timer(delay_ms.max(1), false);
        let mut call = Some(f);
        timer.set_callback(move |reactor, src, reason| {
            if reason != Notify::TimerFired {
                return;
            }
            let _ = reactor.remove_source(src);
            if let Some(f) = call.take() {
                f(reactor);
            }
        });
        self.add_source(&timer)
    }

    /// Requests the run loop to exit; see [`ReactorHandle::stop`].
    pub fn stop(&self) -> bool {
        self.shared.request_stop()
    }

    /// Runs the event loop on the calling thread until stopped.
    ///
    /// # Errors
    ///
    /// [`ReactorError::AlreadyRunning`] when called re-entrantly or from a
    /// second thread; otherwise only fatal poll/pipe failures.
    pub fn run(&mut self) -> Result<(), ReactorError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(ReactorError::AlreadyRunning);
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        debug!(reactor = %self.id, "run loop entered");
        let result = self.run_loop();
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.stop.store(false, Ordering::SeqCst);
        debug!(reactor = %self.id, "run loop exited");
        result
    }

    fn run_loop(&mut self) -> Result<(), ReactorError> {
        loop {
            // Stop is only observed here, never mid-iteration.
            if self.shared.stop.load(Ordering::SeqCst) {
                return Ok(());
            }

            self.reconcile_timers();

            let timeout = self
                .wheel
                .timeout()
                .map_or(-1, |ms| i32::try_from(ms).unwrap_or(i32::MAX));

            let polled: Vec<(Source, RawFd)> = self
                .fd_sources
                .iter()
                .filter_map(|s| s.raw_fd().map(|raw| (s.clone(), raw)))
                .collect();

            let started = Instant::now();
            let revents = {
                let mut pollfds = Vec::with_capacity(polled.len() + 1);
                pollfds.push(PollFd::new(&self.wake_rx, PollFlags::IN));
                for (_, raw) in &polled {
                    // SAFETY: each raw fd is owned by a source registered on
                    // this reactor; the snapshot keeps the source alive and
                    // registration only changes on this thread, after poll
                    // returns.
                    let fd = unsafe { BorrowedFd::borrow_raw(*raw) };
                    pollfds.push(PollFd::from_borrowed_fd(
                        fd,
                        PollFlags::IN | PollFlags::PRI,
                    ));
                }
                match rustix::event::poll(&mut pollfds, timeout) {
                    Ok(_) | Err(Errno::INTR) => {}
                    Err(e) => return Err(e.into()),
                }
                pollfds.iter().map(PollFd::revents).collect::<Vec<_>>()
            };

            // The wheel advances by measured wall-clock time, not the
            // requested timeout: poll can return early or late.
            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            self.advance_timers(elapsed);

            for (index, (src, _)) in polled.iter().enumerate() {
                let flags = revents[index + 1];
                if flags.is_empty() || src.owner() != Some(self.id) {
                    continue;
                }
                let reason = if flags.contains(PollFlags::ERR) {
                    Notify::Error
                } else if flags.contains(PollFlags::HUP) {
                    Notify::Disconnected
                } else if flags.intersects(PollFlags::IN | PollFlags::PRI) {
                    Notify::CanRead
                } else {
                    continue;
                };
                self.dispatch(src, reason);
            }

            if revents[0].contains(PollFlags::IN) {
                self.consume_wake_byte()?;
            }
        }
    }

    /// Reads one wakeup byte; a TASK byte runs exactly one queued call.
    fn consume_wake_byte(&mut self) -> Result<(), ReactorError> {
        let mut byte = [0u8; 1];
        loop {
            match rustix::io::read(&self.wake_rx, &mut byte) {
                Ok(_) => break,
                Err(Errno::INTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if byte[0] == TASK_BYTE {
            let call = self.shared.queue.lock().pop_front();
            if let Some(call) = call {
                call(self);
            }
        }
        Ok(())
    }

    /// Re-inserts dirty timers into the wheel with their current settings.
    fn reconcile_timers(&mut self) {
        for src in &self.timers {
            if let Some((interval, _, active, dirty)) = src.timer_snapshot() {
                if !dirty {
                    continue;
                }
                if active {
                    self.wheel.add(src.id(), interval);
                } else {
                    self.wheel.remove(src.id());
                }
                src.clear_dirty();
            }
        }
    }

    fn reconcile_timer(&mut self, src: &Source) {
        if let Some((interval, _, active, _)) = src.timer_snapshot() {
            if active {
                self.wheel.add(src.id(), interval);
            } else {
                self.wheel.remove(src.id());
            }
            src.clear_dirty();
        }
    }

    /// Advances the wheel and dispatches expired timers in expiry order.
    fn advance_timers(&mut self, elapsed_ms: u64) {
        if elapsed_ms > 0 {
            self.wheel.step(elapsed_ms);
        }
        while let Some(id) = self.wheel.pop_ready() {
            let Some(src) = self.timers.iter().find(|t| t.id() == id).cloned() else {
                continue;
            };
            match src.timer_snapshot() {
                // Periodic and still active: rearm before the callback so a
                // mutation inside it lands on the fresh schedule.
                Some((interval, true, true, _)) => self.wheel.add(id, interval),
                _ => src.quiesce(),
            }
            self.dispatch(&src, Notify::TimerFired);
        }
    }

    /// Invokes a source callback with the callback slot emptied, so the
    /// callback may freely re-enter this reactor and the source.
    fn dispatch(&mut self, src: &Source, reason: Notify) {
        let Some(mut cb) = src.take_callback() else {
            return;
        };
        cb(self, src, reason);
        src.restore_callback(cb);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        debug_assert!(
            !self.shared.running.load(Ordering::SeqCst),
            "reactor dropped while running"
        );
        for src in self.fd_sources.drain(..).chain(self.timers.drain(..)) {
            src.release(self.id);
        }
        diag::reactor_dropped();
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("id", &self.id)
            .field("fd_sources", &self.fd_sources.len())
            .field("timers", &self.timers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn noop_callback(src: &Source) {
        src.set_callback(|_, _, _| {});
    }

    #[test]
    fn add_requires_callback() {
        let mut reactor = Reactor::new().unwrap();
        let timer = Source::timer(10, false);
        assert!(matches!(
            reactor.add_source(&timer),
            Err(ReactorError::NoCallback)
        ));
    }

    #[test]
    fn single_ownership_across_reactors() {
        let mut r1 = Reactor::new().unwrap();
        let mut r2 = Reactor::new().unwrap();
        let timer = Source::timer(10, false);
        noop_callback(&timer);

        reactor_ownership_roundtrip(&mut r1, &mut r2, &timer);
    }

    fn reactor_ownership_roundtrip(r1: &mut Reactor, r2: &mut Reactor, src: &Source) {
        r1.add_source(src).unwrap();
        assert!(matches!(
            r1.add_source(src),
            Err(ReactorError::AlreadyOwned)
        ));
        assert!(matches!(
            r2.add_source(src),
            Err(ReactorError::AlreadyOwned)
        ));
        assert!(matches!(r2.remove_source(src), Err(ReactorError::NotOwner)));

        r1.remove_source(src).unwrap();
        assert_eq!(src.owner(), None);
        r2.add_source(src).unwrap();
        assert_eq!(src.owner(), Some(r2.id()));
        r2.remove_source(src).unwrap();
    }

    #[test]
    fn async_calls_fifo_exactly_once() {
        let mut reactor = Reactor::new().unwrap();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        for i in 0..4u32 {
            let seen = Arc::clone(&seen);
            reactor
                .dispatch_async(move |r| {
                    seen.lock().unwrap().push(i);
                    if i == 3 {
                        r.stop();
                    }
                })
                .unwrap();
        }

        reactor.run().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn dispatch_after_fires_once_and_unregisters() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Arc::new(StdMutex::new(0u32));
        let counter = Arc::clone(&fired);
        reactor
            .dispatch_after(5, move |r| {
                *counter.lock().unwrap() += 1;
                // Leave the loop spinning a little longer to catch double fires.
                let _ = r.dispatch_after(20, |r| {
                    r.stop();
                });
            })
            .unwrap();

        reactor.run().unwrap();
        assert_eq!(*fired.lock().unwrap(), 1);
        assert!(reactor.timers.is_empty());
        assert!(reactor.wheel.is_empty());
    }

    #[test]
    fn periodic_timer_rearms_until_deactivated() {
        let mut reactor = Reactor::new().unwrap();
        let timer = Source::timer(5, true);
        let count = Arc::new(StdMutex::new(0u32));
        let counter = Arc::clone(&count);
        timer.set_callback(move |r, src, reason| {
            assert_eq!(reason, Notify::TimerFired);
            let mut n = counter.lock().unwrap();
            *n += 1;
            if *n == 3 {
                src.set_active(false);
                r.stop();
            }
        });
        reactor.add_source(&timer).unwrap();

        reactor.run().unwrap();
        assert_eq!(*count.lock().unwrap(), 3);
        assert!(!timer.is_active());
    }

    #[test]
    fn one_shot_timer_quiesces() {
        let mut reactor = Reactor::new().unwrap();
        let timer = Source::timer(5, false);
        timer.set_callback(|r, _, _| {
            r.stop();
        });
        reactor.add_source(&timer).unwrap();
        reactor.run().unwrap();
        assert!(!timer.is_active());
        // Inactive and clean: reconciliation must not revive it.
        assert!(reactor.wheel.is_empty());
    }

    #[test]
    fn stop_when_not_running_is_noop() {
        let reactor = Reactor::new().unwrap();
        assert!(!reactor.stop());
        assert!(!reactor.handle().stop());
    }

    #[test]
    fn fd_source_readable_dispatch() {
        let mut reactor = Reactor::new().unwrap();
        let (rx, tx) = rustix::pipe::pipe().unwrap();
        let src = Source::from_fd(rx);
        src.set_close_on_destruct(true);
        let got = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&got);
        src.set_callback(move |r, src, reason| {
            assert_eq!(reason, Notify::CanRead);
            let mut buf = [0u8; 8];
            let n = src.read(&mut buf).unwrap();
            sink.lock().unwrap().extend_from_slice(&buf[..n]);
            let _ = r.remove_source(src);
            r.stop();
        });
        reactor.add_source(&src).unwrap();

        rustix::io::write(&tx, b"ping").unwrap();
        reactor.run().unwrap();
        assert_eq!(&*got.lock().unwrap(), b"ping");
        assert_eq!(src.owner(), None);
    }
}
