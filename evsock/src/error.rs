//! Error taxonomy shared by addresses, sockets and managers.

use std::io::ErrorKind;

/// A result with the [`SocketError`] error.
pub type Result<T, E = SocketError> = core::result::Result<T, E>;

/// Errors that can occur when using addresses and sockets.
///
/// Every operation reports failures through this type; nothing is retried automatically.
/// [`SocketError::WouldBlock`] and [`SocketError::TimedOut`] ask the caller to retry once the
/// manager signals readiness.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketError {
    /// The operation is not valid for the current state of the socket or address.
    #[error("invalid operation for the current state")]
    InvalidOperation,

    /// The operating system reported an I/O failure.
    #[error("I/O error: {0}")]
    Io(ErrorKind),

    /// The address is malformed, of the wrong family, or already in use.
    #[error("invalid address")]
    InvalidAddress,

    /// The socket has no usable OS handle.
    #[error("invalid socket")]
    InvalidSocket,

    /// The host name could not be resolved.
    #[error("host not found")]
    NoHost,

    /// The port or service name is invalid.
    #[error("invalid port")]
    InvalidPort,

    /// The socket is non-blocking and the operation would have to wait.
    #[error("operation would block")]
    WouldBlock,

    /// The blocking wait exceeded the socket timeout.
    #[error("operation timed out")]
    TimedOut,

    /// Run out of memory during the operation.
    #[error("out of memory")]
    OutOfMemory,

    /// A socket option could not be applied.
    #[error("invalid socket option")]
    InvalidOption,

    /// The caller supplied buffer cannot hold the value.
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall {
        /// Number of bytes the value needs.
        required: usize,
    },
}

/// Helper trait to convert OS errors into socket errors.
///
/// We cannot implement `From` as that would be part of the public API.
pub(crate) trait IntoSocketError {
    /// Converts the error into a [`SocketError`].
    fn into_socket_error(self) -> SocketError;
}

impl IntoSocketError for std::io::Error {
    fn into_socket_error(self) -> SocketError {
        match self.kind() {
            ErrorKind::WouldBlock => SocketError::WouldBlock,
            ErrorKind::TimedOut => SocketError::TimedOut,
            ErrorKind::AddrInUse | ErrorKind::AddrNotAvailable => SocketError::InvalidAddress,
            ErrorKind::OutOfMemory => SocketError::OutOfMemory,
            ErrorKind::InvalidInput => SocketError::InvalidAddress,
            kind => {
                // `EINPROGRESS` has no dedicated kind.
                if self.raw_os_error() == Some(nix::libc::EINPROGRESS) {
                    SocketError::WouldBlock
                } else {
                    SocketError::Io(kind)
                }
            }
        }
    }
}

impl IntoSocketError for nix::Error {
    fn into_socket_error(self) -> SocketError {
        std::io::Error::from(self).into_socket_error()
    }
}
