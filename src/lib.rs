//! `upc` — a small-footprint poll-based event loop (the [`Reactor`]) and a
//! framed client/service IPC transport built on top of it.
//!
//! The reactor multiplexes file-descriptor sources and timers on a single
//! thread: one call to [`Reactor::run`] blocks and dispatches every
//! notification for that reactor. Cross-thread interaction goes through
//! [`ReactorHandle`] (stop, async dispatch), which wakes the loop via a
//! self-pipe so `poll(2)` observes it like any other event.
//!
//! The transport layer ([`transport`]) exchanges length-prefixed binary
//! messages over unix-domain or TCP sockets, with connection admission
//! control on the service side and per-client proxies.
//!
//! [`Reactor`]: reactor::Reactor
//! [`Reactor::run`]: reactor::Reactor::run
//! [`ReactorHandle`]: reactor::ReactorHandle

pub mod diag;
pub mod net;
pub mod reactor;
pub mod transport;

mod trace;

pub use trace::init_tracing;
