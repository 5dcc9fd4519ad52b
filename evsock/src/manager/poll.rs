//! `poll(2)` based manager for console programs.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::os::fd::AsFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};

use super::{Direction, Readiness, SocketManager};
use crate::error::{IntoSocketError, Result, SocketError};
use crate::event::{EventFlags, SocketEvent};
use crate::socket::{SocketId, SocketRef};

/// Converts a wait duration into a `poll(2)` timeout, saturating at the largest representable
/// value.
pub(crate) fn poll_timeout(timeout: Option<Duration>) -> Result<PollTimeout> {
    let Some(timeout) = timeout else {
        return Ok(PollTimeout::NONE);
    };
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    PollTimeout::try_from(millis).map_err(|_| SocketError::InvalidOption)
}

pub(crate) fn readiness_from_poll(flags: PollFlags) -> Readiness {
    let mut readiness = Readiness::empty();
    if flags.intersects(PollFlags::POLLIN | PollFlags::POLLPRI) {
        readiness |= Readiness::READABLE;
    }
    if flags.contains(PollFlags::POLLOUT) {
        readiness |= Readiness::WRITABLE;
    }
    if flags.contains(PollFlags::POLLHUP) {
        readiness |= Readiness::HANGUP;
    }
    if flags.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
        readiness |= Readiness::ERROR;
    }
    readiness
}

fn poll_flags(direction: Direction) -> PollFlags {
    match direction {
        Direction::Input => PollFlags::POLLIN,
        Direction::Output => PollFlags::POLLOUT,
    }
}

#[derive(Debug)]
struct Registration {
    socket: SocketRef,
    interest: EventFlags,
    enabled: bool,
}

/// A manager driving all sockets of the system from one `poll(2)` call per cycle.
///
/// Only event kinds with an installed callback are watched, so a socket that just delivered an
/// event is not polled for it again until the event is re-armed. A pending connection is always
/// watched for its completion.
#[derive(Debug, Default)]
pub struct PollManager {
    registrations: RefCell<BTreeMap<SocketId, Registration>>,
    initialized: Cell<bool>,
}

impl PollManager {
    /// Creates a manager without registered sockets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of registered sockets.
    pub fn registered(&self) -> usize {
        self.registrations.borrow().len()
    }

    fn update(&self, socket: &SocketRef, update: impl FnOnce(&mut Registration)) {
        match self.registrations.borrow_mut().get_mut(&socket.id()) {
            Some(registration) => update(registration),
            None => tracing::warn!(socket = %socket.id(), "socket is not registered"),
        }
    }

    /// Collects the readiness of every watched descriptor, waiting at most `timeout`.
    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<(SocketRef, Readiness)>> {
        let watched: Vec<_> = self
            .registrations
            .borrow()
            .values()
            .filter(|registration| registration.enabled && !registration.interest.is_empty())
            .filter_map(|registration| {
                let core = registration.socket.upgrade()?;
                let flags = registration
                    .interest
                    .events()
                    .fold(PollFlags::empty(), |flags, event| {
                        flags | poll_flags(core.direction(event))
                    });
                Some((registration.socket.clone(), core, flags))
            })
            .collect();

        let handles: Vec<_> = watched
            .iter()
            .filter_map(|(socket, core, flags)| Some((socket, core.handle()?, *flags)))
            .collect();

        if handles.is_empty() && timeout.is_none() {
            // Nothing could ever wake us up.
            return Ok(Vec::new());
        }

        let mut fds: Vec<PollFd<'_>> = handles
            .iter()
            .map(|(_, handle, flags)| PollFd::new(handle.as_fd(), *flags))
            .collect();

        match nix::poll::poll(&mut fds, poll_timeout(timeout)?) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(error) => return Err(error.into_socket_error()),
        }

        Ok(fds
            .iter()
            .zip(&handles)
            .filter_map(|(fd, (socket, _, _))| {
                let readiness = readiness_from_poll(fd.revents()?);
                (!readiness.is_empty()).then(|| ((*socket).clone(), readiness))
            })
            .collect())
    }
}

impl SocketManager for PollManager {
    fn on_init(&self) -> Result<()> {
        if self.initialized.replace(true) {
            tracing::warn!("poll manager initialized twice");
        }
        Ok(())
    }

    fn on_exit(&self) {
        self.initialized.set(false);
        let remaining = self.registrations.take().len();
        if remaining > 0 {
            tracing::warn!(remaining, "poll manager stopped with registered sockets");
        }
    }

    fn init_socket(&self, socket: &SocketRef) -> Result<()> {
        let previous = self.registrations.borrow_mut().insert(
            socket.id(),
            Registration {
                socket: socket.clone(),
                interest: EventFlags::empty(),
                enabled: true,
            },
        );
        if previous.is_some() {
            tracing::warn!(socket = %socket.id(), "socket registered twice");
        }
        Ok(())
    }

    fn destroy_socket(&self, socket: &SocketRef) {
        self.registrations.borrow_mut().remove(&socket.id());
    }

    fn install_callback(&self, socket: &SocketRef, event: SocketEvent) {
        self.update(socket, |registration| registration.interest.insert(event.flag()));
    }

    fn uninstall_callback(&self, socket: &SocketRef, event: SocketEvent) {
        self.update(socket, |registration| registration.interest.remove(event.flag()));
    }

    fn enable_events(&self, socket: &SocketRef) {
        self.update(socket, |registration| registration.enabled = true);
    }

    fn disable_events(&self, socket: &SocketRef) {
        self.update(socket, |registration| registration.enabled = false);
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn poll_events(&self, timeout: Option<Duration>) -> Result<usize> {
        let mut dispatched = 0;
        for (socket, readiness) in self.wait(timeout)? {
            // A callback earlier in this cycle may have closed or suspended the socket.
            let deliver = self
                .registrations
                .borrow()
                .get(&socket.id())
                .is_some_and(|registration| registration.enabled);
            if deliver && socket.dispatch(readiness) {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::Duration;

    use nix::poll::PollFlags;

    use super::{poll_timeout, readiness_from_poll};
    use crate::manager::Readiness;

    #[test]
    fn readiness_mapping() {
        assert_eq!(
            readiness_from_poll(PollFlags::POLLIN | PollFlags::POLLHUP),
            Readiness::READABLE | Readiness::HANGUP
        );
        assert_eq!(
            readiness_from_poll(PollFlags::POLLOUT | PollFlags::POLLERR),
            Readiness::WRITABLE | Readiness::ERROR
        );
        assert_eq!(readiness_from_poll(PollFlags::empty()), Readiness::empty());
    }

    #[test]
    fn timeouts_saturate() {
        assert!(poll_timeout(None).is_ok());
        assert!(poll_timeout(Some(Duration::ZERO)).is_ok());
        assert!(poll_timeout(Some(Duration::from_secs(u64::MAX))).is_ok());
    }
}
