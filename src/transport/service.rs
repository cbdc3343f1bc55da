//! UPC service: listeners, admission control, and the live client set.
//!
//! Responsibilities:
//! - Own the unix-domain listener (always) and TCP listener (when a port is
//!   configured), both registered on a private reactor.
//! - Admit or reject incoming connections via the connection-request
//!   callback; admitted clients get one `Accepted` control frame before any
//!   user traffic.
//! - Demux framed messages from live clients to the data callback.
//! - Tear down exactly one connection on any transport or protocol error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::net::{self, service_socket_path};
use crate::reactor::{Notify, Reactor, ReactorHandle, Source};
use crate::trace::{debug, info, warn};
use crate::transport::message::{self, Frame, CONTROL_ACCEPTED};
use crate::transport::{ClientProxy, DisconnectReason, Message, TransportError};

type ConnectionRequestFn = dyn Fn(&Service, &ClientProxy) -> bool + Send + Sync;
type DataFn = dyn Fn(&Service, &ClientProxy, Message) + Send + Sync;
type DisconnectedFn = dyn Fn(&Service, &ClientProxy, DisconnectReason) + Send + Sync;

/// Static service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Service name; local clients reach it at `/var/tmp/<name>`.
    pub name: String,
    /// TCP listener port; no TCP listener is created when `None`.
    pub tcp_port: Option<u16>,
    /// Listen backlog for both listeners.
    pub backlog: i32,
}

impl ServiceConfig {
    /// Configuration with defaults: no TCP listener, backlog 16.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tcp_port: None,
            backlog: 16,
        }
    }

    /// Additionally listens on the given TCP port.
    #[must_use]
    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = Some(port);
        self
    }
}

/// Callback set snapshotted at start; immutable afterwards.
struct Callbacks {
    on_connection_request: Arc<ConnectionRequestFn>,
    on_data: Arc<DataFn>,
    on_disconnected: Arc<DisconnectedFn>,
}

#[derive(Default)]
struct PendingCallbacks {
    on_connection_request: Option<Arc<ConnectionRequestFn>>,
    on_data: Option<Arc<DataFn>>,
    on_disconnected: Option<Arc<DisconnectedFn>>,
}

struct ServiceInner {
    config: ServiceConfig,
    /// `None` while `run()` has the reactor on its stack.
    reactor: Mutex<Option<Reactor>>,
    handle: Mutex<Option<ReactorHandle>>,
    pending: Mutex<PendingCallbacks>,
    callbacks: Mutex<Option<Arc<Callbacks>>>,
    clients: Mutex<Vec<ClientProxy>>,
    listeners: Mutex<Vec<Source>>,
    started: AtomicBool,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        // Socket callbacks hold proxy clones; break the cycles explicitly.
        for proxy in self.clients.get_mut().drain(..) {
            if let Some(socket) = proxy.release_source() {
                socket.clear_callback();
            }
        }
        for listener in self.listeners.get_mut().drain(..) {
            listener.clear_callback();
        }
        if self.started.load(Ordering::SeqCst) {
            let _ = std::fs::remove_file(service_socket_path(&self.config.name));
        }
    }
}

/// A UPC service endpoint.
///
/// Cloneable handle; callbacks receive one, so they can send, broadcast and
/// close clients re-entrantly. All callbacks run on the thread calling
/// [`run`](Self::run).
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                config,
                reactor: Mutex::new(None),
                handle: Mutex::new(None),
                pending: Mutex::new(PendingCallbacks::default()),
                callbacks: Mutex::new(None),
                clients: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Decides whether an accepted connection is admitted.
    ///
    /// The proxy passed to the callback is not yet registered anywhere;
    /// reads and writes are refused, so the only legal use is endpoint and
    /// credential inspection.
    pub fn set_on_connection_request(
        &self,
        f: impl Fn(&Service, &ClientProxy) -> bool + Send + Sync + 'static,
    ) {
        self.inner.pending.lock().on_connection_request = Some(Arc::new(f));
    }

    /// Receives every user message from a live client.
    pub fn set_on_data(&self, f: impl Fn(&Service, &ClientProxy, Message) + Send + Sync + 'static) {
        self.inner.pending.lock().on_data = Some(Arc::new(f));
    }

    /// Fires exactly once when a live client goes away, with the reason.
    pub fn set_on_disconnected(
        &self,
        f: impl Fn(&Service, &ClientProxy, DisconnectReason) + Send + Sync + 'static,
    ) {
        self.inner.pending.lock().on_disconnected = Some(Arc::new(f));
    }

    /// Creates the listeners and registers them on the owned reactor.
    ///
    /// # Errors
    ///
    /// `MissingCallback`/`AlreadyStarted` before anything is allocated;
    /// socket errors if a listener cannot be created (partial listeners are
    /// unwound).
    pub fn start(&self) -> Result<(), TransportError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }
        match self.start_inner() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.unwind_start();
                self.inner.started.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn start_inner(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        let callbacks = {
            let pending = inner.pending.lock();
            Arc::new(Callbacks {
                on_connection_request: pending
                    .on_connection_request
                    .clone()
                    .ok_or(TransportError::MissingCallback("connection-request"))?,
                on_data: pending
                    .on_data
                    .clone()
                    .ok_or(TransportError::MissingCallback("data"))?,
                on_disconnected: pending
                    .on_disconnected
                    .clone()
                    .ok_or(TransportError::MissingCallback("disconnection"))?,
            })
        };
        *inner.callbacks.lock() = Some(callbacks);

        let mut slot = inner.reactor.lock();
        if slot.is_none() {
            *slot = Some(Reactor::new()?);
        }
        let reactor = slot.as_mut().expect("reactor just created");
        *inner.handle.lock() = Some(reactor.handle());

        let path = service_socket_path(&inner.config.name);
        let unix = net::unix_listener(&path, inner.config.backlog)?;
        self.install_listener(reactor, unix)?;
        if let Some(port) = inner.config.tcp_port {
            let tcp = net::tcp_listener(port, inner.config.backlog)?;
            self.install_listener(reactor, tcp)?;
        }
        info!(service = %inner.config.name, "service started");
        Ok(())
    }

    fn install_listener(
        &self,
        reactor: &mut Reactor,
        listener: Source,
    ) -> Result<(), TransportError> {
        listener.set_close_on_destruct(true);
        let weak = Arc::downgrade(&self.inner);
        listener.set_callback(move |reactor, listener, reason| {
            let Some(inner) = weak.upgrade() else { return };
            if reason == Notify::CanRead {
                Service::admit(&inner, reactor, listener);
            }
        });
        reactor.add_source(&listener)?;
        self.inner.listeners.lock().push(listener);
        Ok(())
    }

    fn unwind_start(&self) {
        let inner = &self.inner;
        let listeners: Vec<Source> = inner.listeners.lock().drain(..).collect();
        if let Some(reactor) = inner.reactor.lock().as_mut() {
            for listener in &listeners {
                let _ = reactor.remove_source(listener);
            }
        }
        for listener in &listeners {
            listener.clear_callback();
        }
        *inner.callbacks.lock() = None;
    }

    /// Runs the owned reactor on the calling thread until stopped.
    ///
    /// # Errors
    ///
    /// `NotStarted` before `start()`; otherwise reactor failures.
    pub fn run(&self) -> Result<(), TransportError> {
        let mut reactor = self
            .inner
            .reactor
            .lock()
            .take()
            .ok_or(TransportError::NotStarted)?;
        let result = reactor.run();
        *self.inner.reactor.lock() = Some(reactor);
        result.map_err(Into::into)
    }

    /// Requests the run loop to exit. `false` if it is not running.
    pub fn stop(&self) -> bool {
        self.inner
            .handle
            .lock()
            .as_ref()
            .is_some_and(ReactorHandle::stop)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .handle
            .lock()
            .as_ref()
            .is_some_and(ReactorHandle::is_running)
    }

    /// Handle to the owned reactor, available after `start()`.
    #[must_use]
    pub fn reactor_handle(&self) -> Option<ReactorHandle> {
        self.inner.handle.lock().clone()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Snapshot of the live client set, in admission order.
    #[must_use]
    pub fn clients(&self) -> Vec<ClientProxy> {
        self.inner.clients.lock().clone()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Sends raw payload bytes to one client.
    ///
    /// # Errors
    ///
    /// `NotWritable` while admission is incomplete or teardown has begun;
    /// otherwise framing/socket errors.
    pub fn send_message(
        &self,
        proxy: &ClientProxy,
        kind: i32,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if !proxy.can_read_write() {
            return Err(TransportError::NotWritable);
        }
        let socket = proxy.source().ok_or(TransportError::NotWritable)?;
        message::write_user(&socket, kind, payload)
    }

    /// Serializes `value` and sends it to one client.
    ///
    /// # Errors
    ///
    /// As [`send_message`](Self::send_message), plus codec failures.
    pub fn send_value<T: Serialize>(
        &self,
        proxy: &ClientProxy,
        kind: i32,
        value: &T,
    ) -> Result<(), TransportError> {
        let msg = Message::encode(kind, value)?;
        self.send_message(proxy, kind, &msg.payload)
    }

    /// Sends to every live client; succeeds only if every send succeeded.
    ///
    /// # Errors
    ///
    /// [`TransportError::Broadcast`] with the delivery count on any failure.
    pub fn broadcast_message(&self, kind: i32, payload: &[u8]) -> Result<(), TransportError> {
        let clients = self.clients();
        let total = clients.len();
        let mut delivered = 0;
        for proxy in &clients {
            if self.send_message(proxy, kind, payload).is_ok() {
                delivered += 1;
            }
        }
        if delivered == total {
            Ok(())
        } else {
            Err(TransportError::Broadcast { delivered, total })
        }
    }

    /// Serializes once and broadcasts; succeeds only if every send succeeded.
    ///
    /// # Errors
    ///
    /// Codec failures, or [`TransportError::Broadcast`].
    pub fn broadcast_value<T: Serialize>(&self, kind: i32, value: &T) -> Result<(), TransportError> {
        let msg = Message::encode(kind, value)?;
        self.broadcast_message(kind, &msg.payload)
    }

    /// Closes a client from the service side.
    ///
    /// Fires the disconnection callback with [`DisconnectReason::ByService`].
    /// Returns `false` if the client was already gone.
    pub fn close_and_remove_client(&self, proxy: &ClientProxy) -> bool {
        Self::teardown_client(&self.inner, None, proxy, DisconnectReason::ByService)
    }

    // --- reactor-thread paths ----------------------------------------------

    fn admit(inner: &Arc<ServiceInner>, reactor: &mut Reactor, listener: &Source) {
        let (socket, endpoint) = match net::accept(listener) {
            Ok(pair) => pair,
            Err(_err) => {
                warn!(error = %_err, "accept failed");
                return;
            }
        };
        socket.set_close_on_destruct(true);
        let proxy = ClientProxy::new(socket.clone(), endpoint);
        let service = Service {
            inner: Arc::clone(inner),
        };
        let Some(callbacks) = inner.callbacks.lock().clone() else {
            return;
        };
        // The proxy is not yet on the reactor and not writable: the request
        // callback can only inspect the endpoint and credentials.
        if !(callbacks.on_connection_request)(&service, &proxy) {
            debug!(client = %proxy.id(), "connection rejected");
            return;
        }
        if let Err(_err) = message::write_control(&socket, CONTROL_ACCEPTED) {
            warn!(client = %proxy.id(), error = %_err, "accept frame failed");
            return;
        }
        let weak = Arc::downgrade(inner);
        let client = proxy.clone();
        socket.set_callback(move |reactor, _src, reason| {
            let Some(inner) = weak.upgrade() else { return };
            match reason {
                Notify::CanRead => Service::client_readable(&inner, reactor, &client),
                Notify::Disconnected | Notify::Error => {
                    Service::teardown_client(
                        &inner,
                        Some(reactor),
                        &client,
                        DisconnectReason::ByClient,
                    );
                }
                Notify::TimerFired => {}
            }
        });
        if let Err(_err) = reactor.add_source(&socket) {
            warn!(client = %proxy.id(), error = %_err, "client registration failed");
            return;
        }
        inner.clients.lock().push(proxy.clone());
        proxy.set_writable(true);
        info!(client = %proxy.id(), "client admitted");
    }

    fn client_readable(inner: &Arc<ServiceInner>, reactor: &mut Reactor, proxy: &ClientProxy) {
        let Some(socket) = proxy.source() else { return };
        match message::read_frame(&socket) {
            Ok(Frame::User(msg)) => {
                let Some(callbacks) = inner.callbacks.lock().clone() else {
                    return;
                };
                let service = Service {
                    inner: Arc::clone(inner),
                };
                (callbacks.on_data)(&service, proxy, msg);
            }
            Ok(Frame::Control(_code)) => {
                // Reserved range; no control codes are defined client→service.
                warn!(client = %proxy.id(), code = _code, "reserved control frame ignored");
            }
            Err(_err) => {
                debug!(client = %proxy.id(), error = %_err, "client read failed");
                Service::teardown_client(inner, Some(reactor), proxy, DisconnectReason::ByClient);
            }
        }
    }

    /// Removes one client: gate closed, proxy unlinked, socket released,
    /// disconnection callback fired exactly once.
    fn teardown_client(
        inner: &Arc<ServiceInner>,
        reactor: Option<&mut Reactor>,
        proxy: &ClientProxy,
        reason: DisconnectReason,
    ) -> bool {
        if !proxy.begin_teardown() {
            return false;
        }
        proxy.set_writable(false);
        inner.clients.lock().retain(|p| p != proxy);
        if let Some(socket) = proxy.release_source() {
            socket.clear_callback();
            match reactor {
                Some(reactor) => {
                    let _ = reactor.remove_source(&socket);
                }
                None => Self::remove_source_remotely(inner, socket),
            }
        }
        info!(client = %proxy.id(), reason = %reason, "client removed");
        // Guard must drop before the callback: it may re-enter teardown.
        let callbacks = inner.callbacks.lock().clone();
        if let Some(callbacks) = callbacks {
            let service = Service {
                inner: Arc::clone(inner),
            };
            (callbacks.on_disconnected)(&service, proxy, reason);
        }
        true
    }

    /// Source removal must happen on the reactor thread; route accordingly.
    fn remove_source_remotely(inner: &Arc<ServiceInner>, socket: Source) {
        let handle = inner.handle.lock().clone();
        match handle {
            Some(handle) if handle.is_running() => {
                let _ = handle.dispatch_async(move |reactor| {
                    let _ = reactor.remove_source(&socket);
                });
            }
            _ => {
                if let Some(reactor) = inner.reactor.lock().as_mut() {
                    let _ = reactor.remove_source(&socket);
                }
            }
        }
    }
}
