//! OS socket handles.
//!
//! Stream sockets stay [`socket2::Socket`]s for their whole life. Datagram sockets are converted
//! into the typed std sockets so receiving can report the sender without touching uninitialized
//! memory.

use std::io::{Read, Write};
use std::mem::MaybeUninit;
use std::net::UdpSocket;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixDatagram;

use socket2::{Domain, SockRef, Socket, Type};

use crate::address::Address;
use crate::error::{IntoSocketError, Result, SocketError};

/// What a one byte peek on a stream socket found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputProbe {
    /// Data is waiting to be read.
    Data,
    /// The peer closed the connection or it failed.
    Closed,
    /// Nothing to read right now.
    Empty,
}

#[derive(Debug)]
pub(crate) enum OsHandle {
    Stream(Socket),
    Udp(UdpSocket),
    UnixDatagram(UnixDatagram),
}

impl OsHandle {
    /// Creates a non-blocking stream socket.
    pub(crate) fn stream(domain: Domain) -> Result<Self> {
        let socket =
            Socket::new(domain, Type::STREAM, None).map_err(IntoSocketError::into_socket_error)?;
        socket
            .set_nonblocking(true)
            .map_err(IntoSocketError::into_socket_error)?;
        Ok(OsHandle::Stream(socket))
    }

    /// Creates a non-blocking datagram socket.
    pub(crate) fn datagram(domain: Domain) -> Result<Self> {
        let socket =
            Socket::new(domain, Type::DGRAM, None).map_err(IntoSocketError::into_socket_error)?;
        socket
            .set_nonblocking(true)
            .map_err(IntoSocketError::into_socket_error)?;
        if domain == Domain::UNIX {
            Ok(OsHandle::UnixDatagram(UnixDatagram::from(socket)))
        } else {
            Ok(OsHandle::Udp(UdpSocket::from(socket)))
        }
    }

    pub(crate) fn from_accepted(socket: Socket) -> Result<Self> {
        // Accepted sockets do not inherit `O_NONBLOCK` on every platform.
        socket
            .set_nonblocking(true)
            .map_err(IntoSocketError::into_socket_error)?;
        Ok(OsHandle::Stream(socket))
    }

    pub(crate) fn sock_ref(&self) -> SockRef<'_> {
        SockRef::from(self)
    }

    pub(crate) fn bind(&self, address: &Address) -> Result<()> {
        self.sock_ref()
            .bind(&address.to_sock_addr()?)
            .map_err(IntoSocketError::into_socket_error)
    }

    pub(crate) fn listen(&self, backlog: i32) -> Result<()> {
        self.sock_ref()
            .listen(backlog)
            .map_err(IntoSocketError::into_socket_error)
    }

    /// Starts connecting, `WouldBlock` means the connection is in progress.
    pub(crate) fn connect(&self, address: &Address) -> Result<()> {
        self.sock_ref()
            .connect(&address.to_sock_addr()?)
            .map_err(IntoSocketError::into_socket_error)
    }

    pub(crate) fn accept(&self) -> Result<(OsHandle, Address)> {
        let OsHandle::Stream(socket) = self else {
            return Err(SocketError::InvalidOperation);
        };
        let (socket, address) = socket.accept().map_err(IntoSocketError::into_socket_error)?;
        Ok((
            OsHandle::from_accepted(socket)?,
            Address::from_sock_addr(&address),
        ))
    }

    /// Reads into `buffer`, returning the sender for datagram sockets.
    pub(crate) fn read(&self, buffer: &mut [u8]) -> Result<(usize, Option<Address>)> {
        let result = match self {
            OsHandle::Stream(socket) => {
                let mut socket: &Socket = socket;
                socket.read(buffer).map(|read| (read, None))
            }
            OsHandle::Udp(socket) => socket
                .recv_from(buffer)
                .map(|(read, from)| (read, Some(Address::from(from)))),
            OsHandle::UnixDatagram(socket) => socket
                .recv_from(buffer)
                .map(|(read, from)| (read, Some(Address::from_unix_socket_addr(&from)))),
        };
        result.map_err(IntoSocketError::into_socket_error)
    }

    /// Writes `buffer`, sending datagrams to `peer` when given.
    pub(crate) fn write(&self, buffer: &[u8], peer: Option<&Address>) -> Result<usize> {
        let result = match (self, peer) {
            (OsHandle::Stream(socket), _) => {
                let mut socket: &Socket = socket;
                socket.write(buffer)
            }
            (OsHandle::Udp(socket), Some(peer)) => {
                let peer = peer.socket_addr().ok_or(SocketError::InvalidAddress)?;
                socket.send_to(buffer, peer)
            }
            (OsHandle::Udp(socket), None) => socket.send(buffer),
            (OsHandle::UnixDatagram(socket), Some(peer)) => {
                socket.send_to(buffer, peer.unix_path()?.as_std_path())
            }
            (OsHandle::UnixDatagram(socket), None) => socket.send(buffer),
        };
        result.map_err(IntoSocketError::into_socket_error)
    }

    pub(crate) fn probe_input(&self) -> InputProbe {
        let OsHandle::Stream(socket) = self else {
            return InputProbe::Data;
        };
        let mut probe = [MaybeUninit::<u8>::uninit()];
        match socket.peek(&mut probe) {
            Ok(0) => InputProbe::Closed,
            Ok(_) => InputProbe::Data,
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => InputProbe::Empty,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => InputProbe::Empty,
            Err(_) => InputProbe::Closed,
        }
    }

    /// Returns the pending error of the socket, `Ok(())` if there is none.
    pub(crate) fn take_error(&self) -> Result<()> {
        match self.sock_ref().take_error() {
            Ok(None) => Ok(()),
            Ok(Some(error)) | Err(error) => Err(error.into_socket_error()),
        }
    }

    pub(crate) fn local_address(&self) -> Result<Address> {
        self.sock_ref()
            .local_addr()
            .map(|address| Address::from_sock_addr(&address))
            .map_err(IntoSocketError::into_socket_error)
    }

    pub(crate) fn peer_address(&self) -> Result<Address> {
        self.sock_ref()
            .peer_addr()
            .map(|address| Address::from_sock_addr(&address))
            .map_err(IntoSocketError::into_socket_error)
    }

    pub(crate) fn set_reuse_address(&self) -> Result<()> {
        self.sock_ref()
            .set_reuse_address(true)
            .map_err(|_| SocketError::InvalidOption)
    }

    pub(crate) fn set_broadcast(&self, broadcast: bool) -> Result<()> {
        self.sock_ref()
            .set_broadcast(broadcast)
            .map_err(|_| SocketError::InvalidOption)
    }
}

impl AsFd for OsHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            OsHandle::Stream(socket) => socket.as_fd(),
            OsHandle::Udp(socket) => socket.as_fd(),
            OsHandle::UnixDatagram(socket) => socket.as_fd(),
        }
    }
}

impl AsRawFd for OsHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}
