//! Service endpoint addressing.
//!
//! A service is reachable either locally, through a unix-domain socket in a
//! well-known directory, or distantly over TCP.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

/// Directory holding local service sockets.
pub const WELL_KNOWN_DIR: &str = "/var/tmp";

/// Resolves a service name to its unix-domain socket path.
#[must_use]
pub fn service_socket_path(name: &str) -> PathBuf {
    Path::new(WELL_KNOWN_DIR).join(name)
}

/// Address of a UPC service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A service on this host, named in the well-known directory.
    Local {
        /// Service name; resolves to `/var/tmp/<name>`.
        name: String,
    },
    /// A service on a (possibly) remote host, over TCP.
    Distant {
        /// Peer IP address.
        addr: IpAddr,
        /// Peer TCP port.
        port: u16,
    },
}

impl Endpoint {
    /// Creates a local endpoint from a service name.
    pub fn local(name: impl Into<String>) -> Self {
        Self::Local { name: name.into() }
    }

    /// Creates a distant endpoint.
    #[must_use]
    pub const fn distant(addr: IpAddr, port: u16) -> Self {
        Self::Distant { addr, port }
    }

    /// Creates a distant endpoint on 127.0.0.1.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::Distant {
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        }
    }

    /// The socket path for a local endpoint, `None` for a distant one.
    #[must_use]
    pub fn socket_path(&self) -> Option<PathBuf> {
        match self {
            Self::Local { name } => Some(service_socket_path(name)),
            Self::Distant { .. } => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { name } => write!(f, "local:{name}"),
            Self::Distant { addr, port } => write!(f, "{addr}:{port}"),
        }
    }
}
