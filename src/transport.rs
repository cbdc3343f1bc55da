//! UPC: framed client/service IPC over reactor-managed sockets.
//!
//! A [`Service`] listens on a unix-domain socket in the well-known directory
//! (plus an optional TCP port) and admits clients through a
//! connection-request callback; a [`Client`] connects to an [`Endpoint`] and
//! exchanges [`Message`]s once the service's `Accepted` control frame
//! arrives. Each side owns a private reactor; every socket is a reactor
//! source and every callback runs on that reactor's thread.
//!
//! [`Endpoint`]: crate::net::Endpoint

pub mod client;
pub mod message;
pub mod proxy;
pub mod service;

pub use client::{Client, ConnectionState};
pub use message::{Message, MAX_PAYLOAD, USER_DATA_BASE};
pub use proxy::{ClientProxy, DisconnectReason};
pub use service::{Service, ServiceConfig};

use thiserror::Error;

use crate::net::SocketError;
use crate::reactor::ReactorError;

/// Transport-layer failures.
///
/// Configuration errors (`MissingCallback`, `AlreadyStarted`, `NotStarted`)
/// are raised synchronously before any resource exists. Everything else is
/// terminal for a single connection only; the core never retries.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Raw I/O failure on a connection.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer closed the connection (zero-length read).
    #[error("connection closed by peer")]
    ClosedByPeer,
    /// An advertised or outgoing payload exceeds [`MAX_PAYLOAD`].
    #[error("payload length {len} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Advertised or attempted length.
        len: usize,
        /// The compile-time bound.
        max: usize,
    },
    /// Typed payload encode/decode failure.
    #[error("payload codec error: {0}")]
    Codec(#[from] postcard::Error),
    /// The client is not connected (or not yet accepted).
    #[error("not connected")]
    NotConnected,
    /// The proxy is not writable: admission incomplete or teardown begun.
    #[error("client proxy is not writable")]
    NotWritable,
    /// A required callback was not set before start.
    #[error("missing {0} callback")]
    MissingCallback(&'static str),
    /// The service is already started.
    #[error("service already started")]
    AlreadyStarted,
    /// The service was never started.
    #[error("service not started")]
    NotStarted,
    /// One or more sends in a broadcast failed.
    #[error("broadcast reached {delivered} of {total} clients")]
    Broadcast {
        /// Clients that received the message.
        delivered: usize,
        /// Clients attempted.
        total: usize,
    },
    /// Reactor failure underneath the transport.
    #[error(transparent)]
    Reactor(#[from] ReactorError),
    /// Socket failure underneath the transport.
    #[error(transparent)]
    Socket(#[from] SocketError),
}
