//! Socket primitives for the transport layer.
//!
//! Listener/connect/accept helpers produce descriptor [`Source`]s ready to
//! register on a reactor. Sockets are created blocking on purpose: the
//! transport performs exact-count framed reads once readiness is reported.
//! Writes go through `send(2)` with `MSG_NOSIGNAL`, so a dead peer surfaces
//! as `EPIPE` instead of a signal.
//!
//! [`Source`]: crate::reactor::Source

pub mod endpoint;
pub mod socket;

pub use endpoint::{service_socket_path, Endpoint, WELL_KNOWN_DIR};
pub use socket::{
    accept, connect, connect_tcp, connect_unix, peer_credentials, tcp_listener, unix_listener,
    PeerCredentials, SocketError,
};
