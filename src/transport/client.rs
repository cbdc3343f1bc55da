//! UPC client: one framed connection to a service.
//!
//! Responsibilities:
//! - Resolve an [`Endpoint`] to a connected socket and register it on a
//!   private reactor.
//! - Track the admission handshake: sends stay refused until the service's
//!   `Accepted` control frame arrives.
//! - Demux user frames to the data callback; tear the connection down
//!   exactly once on any transport or protocol error.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::net::{self, Endpoint};
use crate::reactor::{Notify, Reactor, ReactorHandle, Source};
use crate::trace::{debug, info, warn};
use crate::transport::message::{self, Frame, CONTROL_ACCEPTED};
use crate::transport::{Message, TransportError};

/// Connection lifecycle. `Connecting` covers the window between the socket
/// connect and the service's `Accepted` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type ConnectedFn = dyn Fn(&Client) + Send + Sync;
type DataFn = dyn Fn(&Client, Message) + Send + Sync;
type DisconnectedFn = dyn Fn(&Client) + Send + Sync;

#[derive(Default)]
struct CallbackSlots {
    on_connected: Option<Arc<ConnectedFn>>,
    on_data: Option<Arc<DataFn>>,
    on_disconnected: Option<Arc<DisconnectedFn>>,
}

struct ClientInner {
    /// `None` while `run()` has the reactor on its stack.
    reactor: Mutex<Option<Reactor>>,
    handle: Mutex<Option<ReactorHandle>>,
    socket: Mutex<Option<Source>>,
    state: Mutex<ConnectionState>,
    callbacks: Mutex<CallbackSlots>,
}

/// A UPC client endpoint.
///
/// Cloneable handle; callbacks receive one, so they can send and reconnect
/// re-entrantly. All callbacks run on the thread calling [`run`](Self::run).
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClientInner {
                reactor: Mutex::new(None),
                handle: Mutex::new(None),
                socket: Mutex::new(None),
                state: Mutex::new(ConnectionState::Disconnected),
                callbacks: Mutex::new(CallbackSlots::default()),
            }),
        }
    }

    /// Fires when the service admits the connection. Optional.
    pub fn set_on_connected(&self, f: impl Fn(&Client) + Send + Sync + 'static) {
        self.inner.callbacks.lock().on_connected = Some(Arc::new(f));
    }

    /// Receives every user message. Optional; undelivered messages are
    /// drained and dropped.
    pub fn set_on_data(&self, f: impl Fn(&Client, Message) + Send + Sync + 'static) {
        self.inner.callbacks.lock().on_data = Some(Arc::new(f));
    }

    /// Fires exactly once when the connection is lost. Not fired for a
    /// self-initiated [`disconnect`](Self::disconnect). Optional.
    pub fn set_on_disconnected(&self, f: impl Fn(&Client) + Send + Sync + 'static) {
        self.inner.callbacks.lock().on_disconnected = Some(Arc::new(f));
    }

    /// Connects to a service, dropping any prior connection first.
    ///
    /// Never blocks on the handshake: this returns once the socket is
    /// registered, and the state stays `Connecting` until the service's
    /// accept frame arrives. When the reactor is already running on another
    /// thread the registration is re-routed onto it.
    ///
    /// # Errors
    ///
    /// Socket or registration failures; a deferred connect reports failures
    /// through the disconnect path instead.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<(), TransportError> {
        {
            let mut slot = self.inner.reactor.lock();
            if slot.is_none() {
                let reactor = Reactor::new()?;
                *self.inner.handle.lock() = Some(reactor.handle());
                *slot = Some(reactor);
            }
            if let Some(reactor) = slot.as_mut() {
                return self.connect_on(reactor, endpoint);
            }
        }
        // `run()` holds the reactor; hand the work to the loop thread.
        let handle = self
            .inner
            .handle
            .lock()
            .clone()
            .ok_or(TransportError::NotStarted)?;
        let client = self.clone();
        let endpoint = endpoint.clone();
        handle.dispatch_async(move |reactor| {
            if let Err(_err) = client.connect_on(reactor, &endpoint) {
                warn!(error = %_err, "deferred connect failed");
            }
        })?;
        Ok(())
    }

    fn connect_on(&self, reactor: &mut Reactor, endpoint: &Endpoint) -> Result<(), TransportError> {
        self.teardown(Some(reactor), false);
        let socket = net::connect(endpoint)?;
        socket.set_close_on_destruct(true);
        let weak = Arc::downgrade(&self.inner);
        socket.set_callback(move |reactor, socket, reason| {
            let Some(inner) = weak.upgrade() else { return };
            let client = Client { inner };
            match reason {
                Notify::CanRead => client.socket_readable(reactor, socket),
                Notify::Disconnected | Notify::Error => {
                    client.teardown(Some(reactor), true);
                }
                Notify::TimerFired => {}
            }
        });
        reactor.add_source(&socket)?;
        *self.inner.socket.lock() = Some(socket);
        *self.inner.state.lock() = ConnectionState::Connecting;
        debug!(endpoint = %endpoint, "connecting");
        Ok(())
    }

    /// Runs the owned reactor on the calling thread until stopped.
    ///
    /// # Errors
    ///
    /// `NotStarted` before the first `connect()`; otherwise reactor failures.
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

    /// Handle to the owned reactor, available after the first `connect()`.
    #[must_use]
    pub fn reactor_handle(&self) -> Option<ReactorHandle> {
        self.inner.handle.lock().clone()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Drops the connection without firing the disconnect callback.
    /// Idempotent; a no-op when already disconnected.
    pub fn disconnect(&self) {
        self.teardown(None, false);
    }

    /// Sends raw payload bytes.
    ///
    /// # Errors
    ///
    /// `NotConnected` unless admission has completed; otherwise
    /// framing/socket errors.
    pub fn send_message(&self, kind: i32, payload: &[u8]) -> Result<(), TransportError> {
        if *self.inner.state.lock() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let socket = self
            .inner
            .socket
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        message::write_user(&socket, kind, payload)
    }

    /// Serializes `value` and sends it.
    ///
    /// # Errors
    ///
    /// As [`send_message`](Self::send_message), plus codec failures.
    pub fn send_value<T: Serialize>(&self, kind: i32, value: &T) -> Result<(), TransportError> {
        let msg = Message::encode(kind, value)?;
        self.send_message(kind, &msg.payload)
    }

    // --- reactor-thread paths ----------------------------------------------

    fn socket_readable(&self, reactor: &mut Reactor, socket: &Source) {
        match message::read_frame(socket) {
            Ok(Frame::Control(CONTROL_ACCEPTED)) => {
                let mut state = self.inner.state.lock();
                if *state == ConnectionState::Connecting {
                    *state = ConnectionState::Connected;
                    drop(state);
                    info!("connection accepted");
                    let cb = self.inner.callbacks.lock().on_connected.clone();
                    if let Some(cb) = cb {
                        cb(self);
                    }
                }
            }
            Ok(Frame::Control(_code)) => {
                debug!(code = _code, "unknown control frame ignored");
            }
            Ok(Frame::User(msg)) => {
                let cb = self.inner.callbacks.lock().on_data.clone();
                if let Some(cb) = cb {
                    cb(self, msg);
                }
            }
            Err(_err) => {
                debug!(error = %_err, "read failed");
                self.teardown(Some(reactor), true);
            }
        }
    }

    /// Drops the socket and resets the state; at most one caller observes
    /// the transition and fires the disconnect callback.
    fn teardown(&self, reactor: Option<&mut Reactor>, fire: bool) -> bool {
        let prior = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut *state, ConnectionState::Disconnected)
        };
        let socket = self.inner.socket.lock().take();
        if prior == ConnectionState::Disconnected && socket.is_none() {
            return false;
        }
        if let Some(socket) = socket {
            socket.clear_callback();
            match reactor {
                Some(reactor) => {
                    let _ = reactor.remove_source(&socket);
                }
                None => self.remove_source_remotely(socket),
            }
        }
        if fire {
            let cb = self.inner.callbacks.lock().on_disconnected.clone();
            if let Some(cb) = cb {
                cb(self);
            }
        }
        true
    }

    /// Source removal must happen on the reactor thread; route accordingly.
    fn remove_source_remotely(&self, socket: Source) {
        let handle = self.inner.handle.lock().clone();
        match handle {
            Some(handle) if handle.is_running() => {
                let _ = handle.dispatch_async(move |reactor| {
                    let _ = reactor.remove_source(&socket);
                });
            }
            _ => {
                if let Some(reactor) = self.inner.reactor.lock().as_mut() {
                    let _ = reactor.remove_source(&socket);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::service_socket_path;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique_name(tag: &str) -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "upc-test-{}-{}-{}",
            std::process::id(),
            tag,
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn fresh_client_is_disconnected() {
        let client = Client::new();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert!(!client.stop());
    }

    #[test]
    fn send_refused_before_connected() {
        let client = Client::new();
        assert!(matches!(
            client.send_message(1, b"hello"),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn connect_to_absent_service_fails() {
        let client = Client::new();
        let endpoint = Endpoint::local(unique_name("absent"));
        assert!(client.connect(&endpoint).is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connect_reaches_connecting_without_handshake() {
        let name = unique_name("pending");
        let listener = net::unix_listener(&service_socket_path(&name), 4).unwrap();
        listener.set_close_on_destruct(true);

        let client = Client::new();
        client.connect(&Endpoint::local(name.as_str())).unwrap();
        // No accept frame yet: sends stay refused.
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert!(matches!(
            client.send_message(1, b"early"),
            Err(TransportError::NotConnected)
        ));

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        let _ = std::fs::remove_file(service_socket_path(&name));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let client = Client::new();
        client.disconnect();
        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn reconnect_replaces_prior_socket() {
        let name = unique_name("replace");
        let listener = net::unix_listener(&service_socket_path(&name), 4).unwrap();
        listener.set_close_on_destruct(true);

        let client = Client::new();
        client.connect(&Endpoint::local(name.as_str())).unwrap();
        let first = client.inner.socket.lock().clone().unwrap();
        client.connect(&Endpoint::local(name.as_str())).unwrap();
        let second = client.inner.socket.lock().clone().unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(client.state(), ConnectionState::Connecting);

        client.disconnect();
        let _ = std::fs::remove_file(service_socket_path(&name));
    }
}
