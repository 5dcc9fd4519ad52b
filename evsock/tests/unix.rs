#![expect(missing_docs, reason = "tests")]

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use evsock::{
    Address, AddressFamily, EventFlags, SocketError, SocketEvent, SocketKind, SocketStatus,
    SocketSystem,
};
use pretty_assertions::assert_eq;

fn socket_path(dir: &tempfile::TempDir, name: &str) -> Address {
    let path = dir.path().join(name);
    path.to_str().unwrap().parse().unwrap()
}

#[test]
fn stream_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let address = socket_path(&dir, "stream.sock");
    assert_eq!(address.family(), AddressFamily::Unix);

    let system = SocketSystem::new().unwrap();
    let server = system.socket(SocketKind::Stream).unwrap();
    server.set_timeout(Duration::from_secs(5)).unwrap();
    server.bind(&address).unwrap();
    server.listen().unwrap();
    assert_eq!(server.local().unwrap(), address);

    let connected = Rc::new(Cell::new(false));
    let seen = connected.clone();
    server
        .set_handler(SocketEvent::Connection, move |_, _| seen.set(true))
        .unwrap();

    let client = system.socket(SocketKind::Stream).unwrap();
    client.set_timeout(Duration::from_secs(5)).unwrap();
    client.connect(&address).unwrap();

    for _ in 0..100 {
        if connected.get() {
            break;
        }
        system.poll(Some(Duration::from_millis(20))).unwrap();
    }
    assert!(connected.get());

    let accepted = server.accept().unwrap();
    assert_eq!(accepted.status(), SocketStatus::Connected);

    assert_eq!(client.write(b"over unix").unwrap(), 9);
    let mut buffer = [0; 32];
    let read = accepted.read(&mut buffer).unwrap();
    assert_eq!(&buffer[..read], b"over unix");
    assert_eq!(
        accepted.select(EventFlags::INPUT).unwrap(),
        EventFlags::empty()
    );
}

#[test]
fn bound_path_is_in_use() {
    let dir = tempfile::tempdir().unwrap();
    let address = socket_path(&dir, "taken.sock");

    let system = SocketSystem::new().unwrap();
    let first = system.socket(SocketKind::Stream).unwrap();
    first.bind(&address).unwrap();

    let second = system.socket(SocketKind::Stream).unwrap();
    assert_eq!(second.bind(&address), Err(SocketError::InvalidAddress));
    assert_eq!(second.status(), SocketStatus::Uninitialized);
}

#[test]
fn datagram_reply_to_sender() {
    let dir = tempfile::tempdir().unwrap();
    let server_address = socket_path(&dir, "server.sock");
    let client_address = socket_path(&dir, "client.sock");

    let system = SocketSystem::new().unwrap();
    let server = system.socket(SocketKind::Datagram).unwrap();
    server.set_timeout(Duration::from_secs(5)).unwrap();
    server.bind(&server_address).unwrap();

    let client = system.socket(SocketKind::Datagram).unwrap();
    client.set_timeout(Duration::from_secs(5)).unwrap();
    client.bind(&client_address).unwrap();
    client.set_peer(&server_address).unwrap();
    assert_eq!(client.write(b"request").unwrap(), 7);

    let mut buffer = [0; 32];
    let read = server.read(&mut buffer).unwrap();
    assert_eq!(&buffer[..read], b"request");
    assert_eq!(server.peer().unwrap(), client_address);

    assert_eq!(server.write(b"reply").unwrap(), 5);
    let read = client.read(&mut buffer).unwrap();
    assert_eq!(&buffer[..read], b"reply");
}
