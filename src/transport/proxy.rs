//! Service-side view of one connected client.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::net::{self, Endpoint, PeerCredentials, SocketError};
use crate::reactor::{Source, SourceId};

/// Which side ended a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer disconnected (hangup, error, or protocol violation).
    ByClient,
    /// The service called `close_and_remove_client`.
    ByService,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByClient => f.write_str("by-client"),
            Self::ByService => f.write_str("by-service"),
        }
    }
}

struct ProxyInner {
    /// Taken at teardown so the socket closes even if proxies outlive it.
    source: Mutex<Option<Source>>,
    id: SourceId,
    endpoint: Option<Endpoint>,
    /// False until admission completes; forced false on removal to block
    /// re-entrant sends during teardown.
    can_read_write: AtomicBool,
    torn_down: AtomicBool,
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

/// Non-owning handle to one connected client of a [`Service`].
///
/// Created on accept, valid until either peer disconnects or the service
/// closes the client. Clones share state.
///
/// [`Service`]: crate::transport::Service
#[derive(Clone)]
pub struct ClientProxy {
    inner: Arc<ProxyInner>,
}

impl ClientProxy {
    pub(crate) fn new(source: Source, endpoint: Option<Endpoint>) -> Self {
        let id = source.id();
        Self {
            inner: Arc::new(ProxyInner {
                source: Mutex::new(Some(source)),
                id,
                endpoint,
                can_read_write: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
                context: Mutex::new(None),
            }),
        }
    }

    /// Stable identity of this client connection.
    #[must_use]
    pub fn id(&self) -> SourceId {
        self.inner.id
    }

    /// Peer address for TCP clients; `None` for unix-domain clients.
    #[must_use]
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.endpoint.clone()
    }

    /// Whether sends to this client are currently allowed.
    #[must_use]
    pub fn can_read_write(&self) -> bool {
        self.inner.can_read_write.load(Ordering::SeqCst)
    }

    /// OS credentials of the peer (unix-domain connections only).
    ///
    /// # Errors
    ///
    /// Fails for TCP peers and after the connection is torn down.
    pub fn peer_credentials(&self) -> Result<PeerCredentials, SocketError> {
        let slot = self.inner.source.lock();
        match slot.as_ref() {
            Some(src) => net::peer_credentials(src),
            None => Err(SocketError::NotADescriptor),
        }
    }

    /// Attaches an opaque application context to this client.
    pub fn set_context(&self, context: impl Any + Send) {
        *self.inner.context.lock() = Some(Box::new(context));
    }

    /// Removes and returns the application context.
    #[must_use]
    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.inner.context.lock().take()
    }

    /// Borrows the application context as `T` inside `f`.
    pub fn with_context<T: Any, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut slot = self.inner.context.lock();
        f(slot.as_mut().and_then(|ctx| ctx.downcast_mut::<T>()))
    }

    pub(crate) fn source(&self) -> Option<Source> {
        self.inner.source.lock().clone()
    }

    pub(crate) fn set_writable(&self, writable: bool) {
        self.inner.can_read_write.store(writable, Ordering::SeqCst);
    }

    /// First caller wins; later teardown attempts become no-ops.
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.inner.torn_down.swap(true, Ordering::SeqCst)
    }

    /// Releases the socket handle, closing it once the reactor lets go.
    pub(crate) fn release_source(&self) -> Option<Source> {
        self.inner.source.lock().take()
    }
}

impl PartialEq for ClientProxy {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ClientProxy {}

impl fmt::Debug for ClientProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientProxy")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("can_read_write", &self.can_read_write())
            .finish_non_exhaustive()
    }
}
