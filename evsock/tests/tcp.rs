#![expect(missing_docs, reason = "tests")]

use std::cell::RefCell;
use std::net::Ipv6Addr;
use std::rc::Rc;
use std::time::Duration;

use evsock::{
    Address, AddressFamily, EventFlags, Socket, SocketError, SocketEvent, SocketId, SocketKind, SocketStatus,
    SocketSystem,
};
use pretty_assertions::assert_eq;

const TICK: Duration = Duration::from_millis(20);

type Log = Rc<RefCell<Vec<(SocketId, SocketEvent)>>>;

fn recorder(log: &Log) -> impl FnMut(SocketId, SocketEvent) + 'static {
    let log = log.clone();
    move |socket: SocketId, event: SocketEvent| log.borrow_mut().push((socket, event))
}

/// Polls until `done` holds, failing the test after a few seconds.
fn poll_until(system: &SocketSystem, mut done: impl FnMut() -> bool) {
    for _ in 0..250 {
        if done() {
            return;
        }
        system.poll(Some(TICK)).unwrap();
    }
    panic!("condition not reached while polling");
}

fn listener(system: &SocketSystem) -> (Socket, Address) {
    let socket = system.socket(SocketKind::Stream).unwrap();
    socket.set_non_blocking(true).unwrap();
    socket.set_reusable().unwrap();
    socket.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    socket.listen().unwrap();
    let address = socket.local().unwrap();
    (socket, address)
}

fn unused_port() -> Address {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = probe.local_addr().unwrap();
    drop(probe);
    Address::from(address)
}

#[test]
fn non_blocking_connect_without_listener() {
    let system = SocketSystem::new().unwrap();
    let log = Log::default();

    let socket = system.socket(SocketKind::Stream).unwrap();
    socket.set_non_blocking(true).unwrap();
    socket
        .set_handler_for(EventFlags::CONNECTION | EventFlags::LOST, recorder(&log))
        .unwrap();

    match socket.connect(&unused_port()) {
        Err(SocketError::WouldBlock) => {
            assert_eq!(socket.status(), SocketStatus::Connecting);
            poll_until(&system, || !log.borrow().is_empty());
            assert_eq!(*log.borrow(), [(socket.id(), SocketEvent::Lost)]);
        }
        Err(SocketError::Io(std::io::ErrorKind::ConnectionRefused)) => {}
        other => panic!("unexpected connect result {other:?}"),
    }
    assert_eq!(socket.status(), SocketStatus::Closed);
    assert_eq!(
        socket.last_error(),
        Some(SocketError::Io(std::io::ErrorKind::ConnectionRefused))
    );
}

#[test]
fn blocking_connect_without_listener_fails() {
    let system = SocketSystem::new().unwrap();
    let socket = system.socket(SocketKind::Stream).unwrap();
    socket.set_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(
        socket.connect(&unused_port()),
        Err(SocketError::Io(std::io::ErrorKind::ConnectionRefused))
    );
    assert_eq!(socket.status(), SocketStatus::Closed);
}

#[test]
fn listener_sees_one_connection() {
    let system = SocketSystem::new().unwrap();
    let log = Log::default();
    let (server, address) = listener(&system);
    server
        .set_handler(SocketEvent::Connection, recorder(&log))
        .unwrap();

    let client = system.socket(SocketKind::Stream).unwrap();
    client.set_non_blocking(true).unwrap();
    match client.connect(&address) {
        Ok(()) | Err(SocketError::WouldBlock) => {}
        Err(error) => panic!("connect failed: {error}"),
    }

    poll_until(&system, || !log.borrow().is_empty());
    // Disarmed until accepted, even though the connection is still pending.
    system.poll(Some(TICK)).unwrap();
    assert_eq!(*log.borrow(), [(server.id(), SocketEvent::Connection)]);

    let accepted = server.accept().unwrap();
    assert_eq!(accepted.status(), SocketStatus::Connected);
    assert_eq!(accepted.kind(), SocketKind::Stream);
    assert_eq!(accepted.local().unwrap(), address);
    assert_eq!(server.accept().unwrap_err(), SocketError::WouldBlock);

    system.poll(Some(TICK)).unwrap();
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(system.live_sockets(), 3);
}

#[test]
fn client_sees_connection_then_output() {
    let system = SocketSystem::new().unwrap();
    let log = Log::default();
    let (_server, address) = listener(&system);

    let client = system.socket(SocketKind::Stream).unwrap();
    client.set_non_blocking(true).unwrap();
    client
        .set_handler_for(
            EventFlags::CONNECTION | EventFlags::OUTPUT | EventFlags::LOST,
            recorder(&log),
        )
        .unwrap();

    match client.connect(&address) {
        Ok(()) => {
            assert_eq!(client.status(), SocketStatus::Connected);
            poll_until(&system, || !log.borrow().is_empty());
            assert_eq!(*log.borrow(), [(client.id(), SocketEvent::Output)]);
        }
        Err(SocketError::WouldBlock) => {
            poll_until(&system, || !log.borrow().is_empty());
            assert_eq!(
                *log.borrow(),
                [
                    (client.id(), SocketEvent::Connection),
                    (client.id(), SocketEvent::Output),
                ]
            );
            assert_eq!(client.status(), SocketStatus::Connected);
        }
        Err(error) => panic!("connect failed: {error}"),
    }
    assert_eq!(client.peer().unwrap(), address);
}

#[test]
fn connect_completes_without_connection_handler() {
    let system = SocketSystem::new().unwrap();
    let log = Log::default();
    let (_server, address) = listener(&system);

    let client = system.socket(SocketKind::Stream).unwrap();
    client.set_non_blocking(true).unwrap();
    client
        .set_handler_for(EventFlags::INPUT | EventFlags::OUTPUT, recorder(&log))
        .unwrap();
    match client.connect(&address) {
        Ok(()) | Err(SocketError::WouldBlock) => {}
        Err(error) => panic!("connect failed: {error}"),
    }

    poll_until(&system, || client.status() == SocketStatus::Connected);
    poll_until(&system, || !log.borrow().is_empty());
    assert_eq!(*log.borrow(), [(client.id(), SocketEvent::Output)]);
    assert_eq!(client.write(b"ready").unwrap(), 5);
}

#[test]
fn select_completes_pending_connect() {
    let system = SocketSystem::new().unwrap();
    let (_server, address) = listener(&system);

    let client = system.socket(SocketKind::Stream).unwrap();
    client.set_non_blocking(true).unwrap();
    if client.connect(&address) == Err(SocketError::WouldBlock) {
        for _ in 0..250 {
            if client.select(EventFlags::CONNECTION).unwrap() == EventFlags::CONNECTION {
                break;
            }
            std::thread::sleep(TICK);
        }
    }
    assert_eq!(client.status(), SocketStatus::Connected);
    assert_eq!(client.select(EventFlags::OUTPUT).unwrap(), EventFlags::OUTPUT);
    assert_eq!(client.write(b"ready").unwrap(), 5);
}

#[test]
fn blocking_connect_is_established() {
    let system = SocketSystem::new().unwrap();
    let (server, address) = listener(&system);

    let client = system.socket(SocketKind::Stream).unwrap();
    client.set_timeout(Duration::from_secs(5)).unwrap();
    client.connect(&address).unwrap();
    assert_eq!(client.status(), SocketStatus::Connected);
    assert_eq!(client.write(b"at once").unwrap(), 7);

    server.set_non_blocking(false).unwrap();
    server.set_timeout(Duration::from_secs(5)).unwrap();
    let accepted = server.accept().unwrap();
    accepted.set_timeout(Duration::from_secs(5)).unwrap();
    let mut buffer = [0; 16];
    let read = accepted.read(&mut buffer).unwrap();
    assert_eq!(&buffer[..read], b"at once");
}

#[test]
fn ipv6_loopback_stream() {
    if std::net::TcpListener::bind((Ipv6Addr::LOCALHOST, 0)).is_err() {
        // The host has no IPv6 loopback.
        return;
    }
    let system = SocketSystem::new().unwrap();

    let mut any_port = Address::new();
    any_port.inet6_set_host_address(Ipv6Addr::LOCALHOST).unwrap();
    any_port.inet6_set_port(0).unwrap();

    let server = system.socket(SocketKind::Stream).unwrap();
    server.set_timeout(Duration::from_secs(5)).unwrap();
    server.bind(&any_port).unwrap();
    server.listen().unwrap();
    let address = server.local().unwrap();
    assert_eq!(address.family(), AddressFamily::Inet6);
    assert_eq!(address.inet6_host_address(), Ok(Ipv6Addr::LOCALHOST));
    assert_ne!(address.inet6_port().unwrap(), 0);

    let client = system.socket(SocketKind::Stream).unwrap();
    client.set_timeout(Duration::from_secs(5)).unwrap();
    client.connect(&address).unwrap();
    assert_eq!(client.peer().unwrap().socket_addr(), address.socket_addr());

    let accepted = server.accept().unwrap();
    accepted.set_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(accepted.peer().unwrap().family(), AddressFamily::Inet6);

    assert_eq!(client.write(b"over v6").unwrap(), 7);
    let mut buffer = [0; 16];
    let read = accepted.read(&mut buffer).unwrap();
    assert_eq!(&buffer[..read], b"over v6");
}

#[test]
fn data_then_lost() {
    let system = SocketSystem::new().unwrap();
    let log = Log::default();
    let (server, address) = listener(&system);

    let client = system.socket(SocketKind::Stream).unwrap();
    client.set_timeout(Duration::from_secs(5)).unwrap();
    client.connect(&address).unwrap();
    assert_eq!(client.status(), SocketStatus::Connected);

    server.set_non_blocking(false).unwrap();
    server.set_timeout(Duration::from_secs(5)).unwrap();
    let accepted = server.accept().unwrap();
    accepted
        .set_handler_for(EventFlags::INPUT | EventFlags::LOST, recorder(&log))
        .unwrap();

    assert_eq!(client.write(b"hello").unwrap(), 5);
    poll_until(&system, || !log.borrow().is_empty());
    assert_eq!(*log.borrow(), [(accepted.id(), SocketEvent::Input)]);
    assert_eq!(
        accepted.select(EventFlags::INPUT | EventFlags::OUTPUT).unwrap(),
        EventFlags::INPUT | EventFlags::OUTPUT
    );

    let mut buffer = [0; 16];
    let read = accepted.read(&mut buffer).unwrap();
    assert_eq!(&buffer[..read], b"hello");

    client.close();
    poll_until(&system, || log.borrow().len() == 2);
    assert_eq!(log.borrow()[1], (accepted.id(), SocketEvent::Lost));
    assert_eq!(accepted.status(), SocketStatus::Closed);
    assert_eq!(accepted.read(&mut buffer), Err(SocketError::InvalidOperation));
}

#[test]
fn end_of_stream_without_lost_handler() {
    let system = SocketSystem::new().unwrap();
    let log = Log::default();
    let (server, address) = listener(&system);

    let client = system.socket(SocketKind::Stream).unwrap();
    client.connect(&address).unwrap();
    server.set_non_blocking(false).unwrap();
    let accepted = server.accept().unwrap();
    accepted
        .set_handler(SocketEvent::Input, recorder(&log))
        .unwrap();

    client.close();
    poll_until(&system, || !log.borrow().is_empty());
    assert_eq!(accepted.read(&mut [0; 4]), Ok(0));
    assert_eq!(accepted.status(), SocketStatus::Connected);
}

#[test]
fn blocking_read_times_out() {
    let system = SocketSystem::new().unwrap();
    let (server, address) = listener(&system);

    let client = system.socket(SocketKind::Stream).unwrap();
    client.connect(&address).unwrap();
    client.set_timeout(Duration::from_millis(50)).unwrap();
    assert_eq!(client.read(&mut [0; 4]), Err(SocketError::TimedOut));

    client.set_non_blocking(true).unwrap();
    assert_eq!(client.read(&mut [0; 4]), Err(SocketError::WouldBlock));
    assert_eq!(client.last_error(), Some(SocketError::WouldBlock));
    drop(server);
}

#[test]
fn udp_echo() {
    let system = SocketSystem::new().unwrap();
    let log = Log::default();

    let server = system.socket(SocketKind::Datagram).unwrap();
    server.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    server
        .set_handler(SocketEvent::Input, recorder(&log))
        .unwrap();

    let client = system.socket(SocketKind::Datagram).unwrap();
    client.set_timeout(Duration::from_secs(5)).unwrap();
    client.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    client.set_peer(&server.local().unwrap()).unwrap();
    assert_eq!(client.write(b"ping").unwrap(), 4);

    poll_until(&system, || !log.borrow().is_empty());
    let mut buffer = [0; 16];
    let read = server.read(&mut buffer).unwrap();
    assert_eq!(&buffer[..read], b"ping");
    assert_eq!(server.peer().unwrap(), client.local().unwrap());

    assert_eq!(server.write(b"pong").unwrap(), 4);
    let read = client.read(&mut buffer).unwrap();
    assert_eq!(&buffer[..read], b"pong");
}
