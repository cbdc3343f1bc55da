//! Tracing shim for the reactor and transport.
//!
//! Built with `--features tracing` the macros forward to the `tracing`
//! crate; without it they compile to nothing, so hot loops carry no
//! logging overhead.

/// Installs a `tracing_subscriber` fmt layer with timestamps.
///
/// Call once at the start of a test or binary. Honors `RUST_LOG`, falling
/// back to `upc=debug`. A no-op when the `tracing` feature is disabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("upc=debug"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! noop_trace {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "tracing"))]
macro_rules! noop_debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "tracing"))]
macro_rules! noop_info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "tracing"))]
macro_rules! noop_warn {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use noop_debug as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use noop_info as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use noop_trace as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use noop_warn as warn;
