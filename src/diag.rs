//! Process-wide diagnostic counters.
//!
//! Purely observational: the counters track live [`Source`] and [`Reactor`]
//! instances so tests can assert that teardown paths release everything.
//! Nothing in the runtime reads them.
//!
//! [`Source`]: crate::reactor::Source
//! [`Reactor`]: crate::reactor::Reactor

use std::sync::atomic::{AtomicUsize, Ordering};

static LIVE_SOURCES: AtomicUsize = AtomicUsize::new(0);
static LIVE_REACTORS: AtomicUsize = AtomicUsize::new(0);

/// Number of `Source` instances currently alive in this process.
#[must_use]
pub fn live_sources() -> usize {
    LIVE_SOURCES.load(Ordering::Relaxed)
}

/// Number of `Reactor` instances currently alive in this process.
#[must_use]
pub fn live_reactors() -> usize {
    LIVE_REACTORS.load(Ordering::Relaxed)
}

pub(crate) fn source_created() {
    LIVE_SOURCES.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn source_dropped() {
    LIVE_SOURCES.fetch_sub(1, Ordering::Relaxed);
}

pub(crate) fn reactor_created() {
    LIVE_REACTORS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn reactor_dropped() {
    LIVE_REACTORS.fetch_sub(1, Ordering::Relaxed);
}
