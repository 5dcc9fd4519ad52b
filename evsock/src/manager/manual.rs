//! Manager fed by an external event loop.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use super::{Readiness, SocketManager};
use crate::error::{Result, SocketError};
use crate::event::{EventFlags, SocketEvent};
use crate::socket::{SocketId, SocketRef};

/// A hook invocation recorded by [`ManualManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerCall {
    /// [`SocketManager::on_init`].
    Init,
    /// [`SocketManager::on_exit`].
    Exit,
    /// [`SocketManager::init_socket`].
    InitSocket(SocketId),
    /// [`SocketManager::destroy_socket`].
    DestroySocket(SocketId),
    /// [`SocketManager::install_callback`].
    Install(SocketId, SocketEvent),
    /// [`SocketManager::uninstall_callback`].
    Uninstall(SocketId, SocketEvent),
    /// [`SocketManager::enable_events`].
    Enable(SocketId),
    /// [`SocketManager::disable_events`].
    Disable(SocketId),
}

#[derive(Debug)]
struct Registration {
    socket: SocketRef,
    interest: EventFlags,
    enabled: bool,
}

/// A manager whose readiness notifications come from the host application.
///
/// The host calls [`ManualManager::notify`] whenever its own event loop observes a socket
/// descriptor becoming ready; the notification is queued and handed to the socket on the next
/// [`SocketManager::poll_events`]. Every hook invocation is recorded, which makes this manager
/// the natural fake for exercising socket behavior without real readiness.
///
/// It never waits: [`SocketManager::poll_events`] ignores its timeout and returns as soon as
/// the queued notifications are delivered, so `SocketSystem::poll(Some(..))` does not block.
#[derive(Debug, Default)]
pub struct ManualManager {
    registrations: RefCell<BTreeMap<SocketId, Registration>>,
    pending: RefCell<VecDeque<(SocketId, Readiness)>>,
    calls: RefCell<Vec<ManagerCall>>,
    init_failure: Cell<Option<SocketError>>,
}

impl ManualManager {
    /// Creates a manager with nothing registered or queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next [`SocketManager::init_socket`] call fail with `error`.
    pub fn fail_socket_init(&self, error: SocketError) {
        self.init_failure.set(Some(error));
    }

    /// Queues a readiness notification for the socket `id`.
    pub fn notify(&self, id: SocketId, readiness: Readiness) {
        tracing::trace!(socket = %id, ?readiness, "readiness queued");
        self.pending.borrow_mut().push_back((id, readiness));
    }

    /// Returns the number of queued notifications.
    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Returns every hook invocation so far, oldest first.
    pub fn calls(&self) -> Vec<ManagerCall> {
        self.calls.borrow().clone()
    }

    /// Returns the event kinds currently watched for the socket `id`.
    pub fn interest(&self, id: SocketId) -> Option<EventFlags> {
        self.registrations
            .borrow()
            .get(&id)
            .map(|registration| registration.interest)
    }

    /// Returns whether the socket `id` is registered.
    pub fn is_registered(&self, id: SocketId) -> bool {
        self.registrations.borrow().contains_key(&id)
    }

    /// Returns whether delivery is enabled for the socket `id`.
    pub fn is_enabled(&self, id: SocketId) -> bool {
        self.registrations
            .borrow()
            .get(&id)
            .is_some_and(|registration| registration.enabled)
    }

    fn record(&self, call: ManagerCall) {
        self.calls.borrow_mut().push(call);
    }

    fn update(&self, id: SocketId, update: impl FnOnce(&mut Registration)) {
        if let Some(registration) = self.registrations.borrow_mut().get_mut(&id) {
            update(registration);
        }
    }
}

impl SocketManager for ManualManager {
    fn on_init(&self) -> Result<()> {
        self.record(ManagerCall::Init);
        Ok(())
    }

    fn on_exit(&self) {
        self.record(ManagerCall::Exit);
        self.pending.borrow_mut().clear();
        self.registrations.borrow_mut().clear();
    }

    fn init_socket(&self, socket: &SocketRef) -> Result<()> {
        self.record(ManagerCall::InitSocket(socket.id()));
        if let Some(error) = self.init_failure.take() {
            return Err(error);
        }
        self.registrations.borrow_mut().insert(
            socket.id(),
            Registration {
                socket: socket.clone(),
                interest: EventFlags::empty(),
                enabled: true,
            },
        );
        Ok(())
    }

    fn destroy_socket(&self, socket: &SocketRef) {
        let id = socket.id();
        self.record(ManagerCall::DestroySocket(id));
        self.registrations.borrow_mut().remove(&id);
        self.pending.borrow_mut().retain(|(pending, _)| *pending != id);
    }

    fn install_callback(&self, socket: &SocketRef, event: SocketEvent) {
        self.record(ManagerCall::Install(socket.id(), event));
        self.update(socket.id(), |registration| {
            registration.interest.insert(event.flag())
        });
    }

    fn uninstall_callback(&self, socket: &SocketRef, event: SocketEvent) {
        self.record(ManagerCall::Uninstall(socket.id(), event));
        self.update(socket.id(), |registration| {
            registration.interest.remove(event.flag())
        });
    }

    fn enable_events(&self, socket: &SocketRef) {
        self.record(ManagerCall::Enable(socket.id()));
        self.update(socket.id(), |registration| registration.enabled = true);
    }

    fn disable_events(&self, socket: &SocketRef) {
        self.record(ManagerCall::Disable(socket.id()));
        self.update(socket.id(), |registration| registration.enabled = false);
    }

    fn poll_events(&self, _timeout: Option<Duration>) -> Result<usize> {
        let pending: Vec<_> = self.pending.borrow_mut().drain(..).collect();
        let mut dispatched = 0;
        for (id, readiness) in pending {
            // Looked up per notification, callbacks may close or suspend other sockets.
            let socket = self
                .registrations
                .borrow()
                .get(&id)
                .filter(|registration| registration.enabled)
                .map(|registration| registration.socket.clone());
            let Some(socket) = socket else {
                tracing::trace!(socket = %id, "notification dropped");
                continue;
            };
            if socket.dispatch(readiness) {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    use pretty_assertions::assert_eq;

    use super::ManualManager;
    use crate::SocketSystem;
    use crate::manager::{Readiness, SocketManager};
    use crate::socket::{SocketId, SocketKind};

    #[test]
    fn poll_never_waits() {
        let manager = ManualManager::new();
        let started = Instant::now();
        assert_eq!(manager.poll_events(Some(Duration::from_secs(30))), Ok(0));
        assert_eq!(manager.poll_events(None), Ok(0));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn unknown_sockets_are_dropped() {
        let manager = Rc::new(ManualManager::new());
        let system = SocketSystem::builder()
            .manager(manager.clone())
            .build()
            .unwrap();
        let socket = system.socket(SocketKind::Datagram).unwrap();

        manager.notify(SocketId::from_raw(u64::MAX), Readiness::READABLE);
        manager.notify(socket.id(), Readiness::READABLE);
        assert_eq!(manager.pending(), 2);
        assert_eq!(system.poll(Some(Duration::from_secs(30))), Ok(0));
        assert_eq!(manager.pending(), 0);
    }
}
