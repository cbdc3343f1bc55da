//! End-to-end transport tests: a service and clients exchanging framed
//! messages over a local socket.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use upc::net::{service_socket_path, Endpoint};
use upc::transport::{
    Client, DisconnectReason, Service, ServiceConfig, TransportError, MAX_PAYLOAD,
};

const PING: i32 = 1;
const PONG: i32 = 2;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Ping {
    seq: u32,
    text: String,
}

fn init() {
    #[cfg(feature = "tracing")]
    {
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(upc::init_tracing);
    }
}

fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "upc-it-{}-{}-{}",
        std::process::id(),
        tag,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn spawn_service(service: &Service) -> thread::JoinHandle<()> {
    let svc = service.clone();
    let handle = thread::spawn(move || svc.run().unwrap());
    for _ in 0..200 {
        if service.is_running() {
            return handle;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("service loop did not come up");
}

#[test]
fn ping_pong_over_local_socket() {
    init();
    let name = unique_name("pingpong");

    let service = Service::new(ServiceConfig::new(name.clone()));
    service.set_on_connection_request(|_, _| true);
    service.set_on_data(|service, proxy, msg| {
        assert_eq!(msg.kind, PING);
        let ping: Ping = msg.decode().unwrap();
        let reply = Ping {
            seq: ping.seq + 1,
            text: ping.text,
        };
        service.send_value(proxy, PONG, &reply).unwrap();
    });
    service.set_on_disconnected(|_, _, _| {});
    service.start().unwrap();
    let svc_thread = spawn_service(&service);

    let (tx, rx) = mpsc::channel();
    let client = Client::new();
    client.set_on_connected(|client| {
        let ping = Ping {
            seq: 1,
            text: "ping".to_owned(),
        };
        client.send_value(PING, &ping).unwrap();
    });
    client.set_on_data(move |client, msg| {
        tx.send(msg).unwrap();
        client.stop();
    });
    client.connect(&Endpoint::local(name.as_str())).unwrap();
    // Watchdog so a lost frame fails the test instead of hanging it.
    let watchdog = client.reactor_handle().unwrap();
    watchdog
        .dispatch_after(10_000, |reactor| {
            reactor.stop();
        })
        .unwrap();
    client.run().unwrap();

    let pong = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(pong.kind, PONG);
    assert_eq!(
        pong.decode::<Ping>().unwrap(),
        Ping {
            seq: 2,
            text: "ping".to_owned(),
        }
    );
    assert!(client.is_connected());
    assert_eq!(service.client_count(), 1);

    assert!(service.stop());
    svc_thread.join().unwrap();
    client.disconnect();
}

#[test]
fn oversized_frame_drops_the_client() {
    init();
    let name = unique_name("oversize");

    let data_count = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let service = Service::new(ServiceConfig::new(name.clone()));
    service.set_on_connection_request(|_, _| true);
    let counted = Arc::clone(&data_count);
    service.set_on_data(move |_, _, _| {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    service.set_on_disconnected(move |service, _, reason| {
        tx.send((reason, service.client_count())).unwrap();
    });
    service.start().unwrap();
    let svc_thread = spawn_service(&service);

    let mut stream = UnixStream::connect(service_socket_path(&name)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    // Drain the 8-byte accept frame so the bogus header is unambiguous.
    let mut accept = [0u8; 8];
    stream.read_exact(&mut accept).unwrap();
    // Header advertising a body the service will refuse to allocate.
    let mut header = Vec::new();
    header.extend_from_slice(&150i32.to_ne_bytes());
    header.extend_from_slice(&(MAX_PAYLOAD as u32 + 1).to_ne_bytes());
    stream.write_all(&header).unwrap();

    let (reason, remaining) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(reason, DisconnectReason::ByClient);
    assert_eq!(remaining, 0);
    assert_eq!(data_count.load(Ordering::SeqCst), 0);
    // Our end now reads EOF: the service closed the socket.
    assert_eq!(stream.read(&mut [0u8; 16]).unwrap(), 0);

    assert!(service.stop());
    svc_thread.join().unwrap();
}

#[test]
fn rejected_connection_is_dropped_silently() {
    init();
    let name = unique_name("reject");

    let disconnects = Arc::new(AtomicUsize::new(0));
    let service = Service::new(ServiceConfig::new(name.clone()));
    service.set_on_connection_request(|_, _| false);
    service.set_on_data(|_, _, _| {});
    let counted = Arc::clone(&disconnects);
    service.set_on_disconnected(move |_, _, _| {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    service.start().unwrap();
    let svc_thread = spawn_service(&service);

    let mut stream = UnixStream::connect(service_socket_path(&name)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    // No accept frame is ever sent; the first read observes EOF.
    assert_eq!(stream.read(&mut [0u8; 8]).unwrap(), 0);
    assert_eq!(service.client_count(), 0);
    // A rejected connection was never live, so no disconnect fires.
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);

    assert!(service.stop());
    svc_thread.join().unwrap();
}

#[test]
fn service_side_close_notifies_the_client() {
    init();
    let name = unique_name("svcclose");

    let service = Service::new(ServiceConfig::new(name.clone()));
    service.set_on_connection_request(|_, _| true);
    // First message from a client gets it evicted.
    service.set_on_data(|service, proxy, _| {
        assert!(service.close_and_remove_client(proxy));
    });
    let (svc_tx, svc_rx) = mpsc::channel();
    service.set_on_disconnected(move |_, _, reason| {
        svc_tx.send(reason).unwrap();
    });
    service.start().unwrap();
    let svc_thread = spawn_service(&service);

    let (tx, rx) = mpsc::channel();
    let client = Client::new();
    client.set_on_connected(|client| {
        client.send_message(PING, b"evict me").unwrap();
    });
    let dropped = tx.clone();
    client.set_on_disconnected(move |client| {
        dropped.send(()).unwrap();
        client.stop();
    });
    client.connect(&Endpoint::local(name.as_str())).unwrap();
    let watchdog = client.reactor_handle().unwrap();
    watchdog
        .dispatch_after(10_000, |reactor| {
            reactor.stop();
        })
        .unwrap();
    client.run().unwrap();

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(
        svc_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        DisconnectReason::ByService
    );
    assert!(!client.is_connected());
    assert!(matches!(
        client.send_message(PING, b"too late"),
        Err(TransportError::NotConnected)
    ));
    assert_eq!(service.client_count(), 0);

    assert!(service.stop());
    svc_thread.join().unwrap();
}
