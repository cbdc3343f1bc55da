//! Listener, connect and accept helpers.
//!
//! All helpers return a ready [`Source`] or an error; a failed helper never
//! yields a half-built source, so callers have nothing to register on
//! failure. Listeners get `SO_REUSEADDR` before bind; unix listeners unlink
//! a stale socket file first.

use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::path::Path;

use rustix::io::Errno;
use rustix::net::{
    AddressFamily, SocketAddrAny, SocketAddrUnix, SocketType,
};
use thiserror::Error;

use crate::net::Endpoint;
use crate::reactor::Source;
use crate::trace::debug;

/// Socket-layer failures (bind, listen, connect, accept, sockopt).
#[derive(Debug, Error)]
pub enum SocketError {
    /// Raw OS failure.
    #[error("socket error: {0}")]
    Io(#[from] Errno),
    /// The operation needs a descriptor source, not a timer.
    #[error("not a descriptor source")]
    NotADescriptor,
}

/// OS-level identity of a connected unix-domain peer (`SO_PEERCRED`).
///
/// Undefined for TCP peers; querying one returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Peer effective user id.
    pub uid: u32,
    /// Peer effective group id.
    pub gid: u32,
    /// Peer process id.
    pub pid: i32,
}

/// Creates a TCP listener on all interfaces.
///
/// # Errors
///
/// Any socket/bind/listen failure (e.g. the port is taken).
pub fn tcp_listener(port: u16, backlog: i32) -> Result<Source, SocketError> {
    let fd = rustix::net::socket(AddressFamily::INET, SocketType::STREAM, None)?;
    rustix::net::sockopt::set_socket_reuseaddr(&fd, true)?;
    rustix::net::bind_v4(
        &fd,
        &SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port),
    )?;
    rustix::net::listen(&fd, backlog)?;
    debug!(port, "tcp listener ready");
    let src = Source::from_fd(fd);
    Ok(src)
}

/// Creates a unix-domain listener, replacing any stale socket file.
///
/// # Errors
///
/// Any socket/bind/listen failure (e.g. the directory is not writable).
pub fn unix_listener(path: &Path, backlog: i32) -> Result<Source, SocketError> {
    // A previous instance may have left its socket file behind.
    let _ = std::fs::remove_file(path);
    let fd = rustix::net::socket(AddressFamily::UNIX, SocketType::STREAM, None)?;
    rustix::net::sockopt::set_socket_reuseaddr(&fd, true)?;
    let addr = SocketAddrUnix::new(path)?;
    rustix::net::bind_unix(&fd, &addr)?;
    rustix::net::listen(&fd, backlog)?;
    debug!(path = %path.display(), "unix listener ready");
    Ok(Source::from_fd(fd))
}

/// Connects to a TCP peer (blocking until established or refused).
///
/// # Errors
///
/// Any socket/connect failure.
pub fn connect_tcp(addr: IpAddr, port: u16) -> Result<Source, SocketError> {
    let fd = match addr {
        IpAddr::V4(v4) => {
            let fd = rustix::net::socket(AddressFamily::INET, SocketType::STREAM, None)?;
            rustix::net::sockopt::set_socket_reuseaddr(&fd, true)?;
            rustix::net::connect_v4(&fd, &SocketAddrV4::new(v4, port))?;
            fd
        }
        IpAddr::V6(v6) => {
            let fd = rustix::net::socket(AddressFamily::INET6, SocketType::STREAM, None)?;
            rustix::net::sockopt::set_socket_reuseaddr(&fd, true)?;
            rustix::net::connect_v6(&fd, &SocketAddrV6::new(v6, port, 0, 0))?;
            fd
        }
    };
    Ok(Source::from_fd(fd))
}

/// Connects to a unix-domain socket.
///
/// # Errors
///
/// Any socket/connect failure (e.g. no service is listening there).
pub fn connect_unix(path: &Path) -> Result<Source, SocketError> {
    let fd = rustix::net::socket(AddressFamily::UNIX, SocketType::STREAM, None)?;
    rustix::net::sockopt::set_socket_reuseaddr(&fd, true)?;
    let addr = SocketAddrUnix::new(path)?;
    rustix::net::connect_unix(&fd, &addr)?;
    Ok(Source::from_fd(fd))
}

/// Resolves an [`Endpoint`] and connects to it.
///
/// # Errors
///
/// Any socket/connect failure.
pub fn connect(endpoint: &Endpoint) -> Result<Source, SocketError> {
    match endpoint {
        Endpoint::Local { name } => connect_unix(&crate::net::service_socket_path(name)),
        Endpoint::Distant { addr, port } => connect_tcp(*addr, *port),
    }
}

/// Accepts one pending connection from a listener source.
///
/// Returns the connected source and the peer address for TCP peers
/// (anonymous unix peers have none).
///
/// # Errors
///
/// `NotADescriptor` for a timer source, otherwise any accept failure.
pub fn accept(listener: &Source) -> Result<(Source, Option<Endpoint>), SocketError> {
    let accepted = listener
        .with_fd(|fd| loop {
            match rustix::net::acceptfrom(fd) {
                Ok(pair) => return Ok(pair),
                Err(Errno::INTR) => {}
                Err(e) => return Err(e),
            }
        })
        .ok_or(SocketError::NotADescriptor)??;
    let (conn, peer) = accepted;
    let endpoint = match peer {
        Some(SocketAddrAny::V4(a)) => Some(Endpoint::distant(IpAddr::V4(*a.ip()), a.port())),
        Some(SocketAddrAny::V6(a)) => Some(Endpoint::distant(IpAddr::V6(*a.ip()), a.port())),
        _ => None,
    };
    Ok((Source::from_fd(conn), endpoint))
}

/// Queries `SO_PEERCRED` on a connected unix-domain source.
///
/// # Errors
///
/// `NotADescriptor` for a timer source; an OS error for sockets without
/// peer credentials (TCP peers included).
pub fn peer_credentials(src: &Source) -> Result<PeerCredentials, SocketError> {
    let cred = src
        .with_fd(|fd| rustix::net::sockopt::get_socket_peercred(fd))
        .ok_or(SocketError::NotADescriptor)??;
    Ok(PeerCredentials {
        uid: cred.uid.as_raw(),
        gid: cred.gid.as_raw(),
        pid: cred.pid.as_raw_nonzero().get(),
    })
}
