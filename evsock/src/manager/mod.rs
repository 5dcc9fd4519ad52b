//! Socket managers adapt the socket engine to the host environment.
//!
//! A manager decides how readiness of socket descriptors is observed: a `poll(2)` loop for
//! console programs ([`PollManager`]), or notifications fed in by a foreign event loop
//! ([`ManualManager`]). Sockets call the hooks below; managers call back into
//! [`SocketRef::dispatch`] when a descriptor becomes ready.
//!
//! Exactly one manager serves a [`SocketSystem`](crate::SocketSystem) and it is chosen before
//! the system, and therefore before any socket, exists.

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::error::Result;
use crate::event::SocketEvent;
use crate::socket::SocketRef;

mod manual;
mod poll;

pub use manual::{ManagerCall, ManualManager};
pub use poll::PollManager;
pub(crate) use poll::{poll_timeout, readiness_from_poll};

bitflags::bitflags! {
    /// Readiness conditions a manager observed on a socket descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Readiness: u8 {
        /// The descriptor is readable.
        const READABLE = 1 << 0;
        /// The descriptor is writable.
        const WRITABLE = 1 << 1;
        /// The peer hung up.
        const HANGUP = 1 << 2;
        /// An error condition is pending on the descriptor.
        const ERROR = 1 << 3;
    }
}

/// The descriptor direction an event kind is observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Wait for the descriptor to become readable.
    Input,
    /// Wait for the descriptor to become writable.
    Output,
}

/// Hooks through which sockets register with the readiness mechanism.
///
/// All hooks are invoked by sockets and the [`SocketSystem`](crate::SocketSystem), never
/// directly by applications. None of them is called while the socket's internal state is
/// borrowed, so implementations may query the passed [`SocketRef`].
pub trait SocketManager: fmt::Debug {
    /// Sets up the polling mechanism, called once when the socket system starts.
    fn on_init(&self) -> Result<()>;

    /// Tears down the polling mechanism, called once when the socket system stops.
    fn on_exit(&self);

    /// Registers a newly created socket; a failure aborts the socket's construction.
    fn init_socket(&self, socket: &SocketRef) -> Result<()>;

    /// Forgets a socket, called exactly once when it closes.
    ///
    /// Pending notifications for the socket must be discarded.
    fn destroy_socket(&self, socket: &SocketRef);

    /// Starts watching the descriptor for `event`.
    fn install_callback(&self, socket: &SocketRef, event: SocketEvent);

    /// Stops watching the descriptor for `event`.
    fn uninstall_callback(&self, socket: &SocketRef, event: SocketEvent);

    /// Resumes delivery for the socket after [`SocketManager::disable_events`].
    fn enable_events(&self, socket: &SocketRef);

    /// Suspends all delivery for the socket while keeping its registrations.
    fn disable_events(&self, socket: &SocketRef);

    /// Runs one polling cycle, waiting at most `timeout` (`None` waits indefinitely).
    ///
    /// Returns the number of notifications dispatched to sockets.
    fn poll_events(&self, timeout: Option<Duration>) -> Result<usize>;
}

/// Returns the manager used by console programs on this platform.
pub fn default_manager() -> Rc<dyn SocketManager> {
    Rc::new(PollManager::new())
}
