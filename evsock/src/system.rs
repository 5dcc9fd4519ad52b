//! Lifecycle of the socket engine.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use crate::config::SocketConfig;
use crate::error::{Result, SocketError};
use crate::manager::{SocketManager, default_manager};
use crate::socket::{Socket, SocketId, SocketKind};
use crate::traits::AppTraits;

thread_local! {
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// State shared between a system and its sockets.
#[derive(Debug)]
pub(crate) struct SystemShared {
    pub(crate) manager: Rc<dyn SocketManager>,
    config: SocketConfig,
    next_id: Cell<u64>,
    live: Cell<usize>,
}

impl SystemShared {
    pub(crate) fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub(crate) fn allocate_id(&self) -> SocketId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        SocketId::from_raw(id)
    }

    pub(crate) fn socket_opened(&self) {
        self.live.set(self.live.get() + 1);
    }

    pub(crate) fn socket_closed(&self) {
        self.live.set(self.live.get().saturating_sub(1));
    }
}

/// Configures a [`SocketSystem`] before it starts.
#[derive(Debug, Default)]
pub struct SocketSystemBuilder {
    manager: Option<Rc<dyn SocketManager>>,
    config: SocketConfig,
}

impl SocketSystemBuilder {
    /// Uses `manager` instead of the platform default.
    pub fn manager(mut self, manager: Rc<dyn SocketManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Uses the manager supplied by the application traits.
    pub fn app_traits(self, traits: &dyn AppTraits) -> Self {
        self.manager(traits.socket_manager())
    }

    /// Sets the initial options of every socket.
    pub fn config(mut self, config: SocketConfig) -> Self {
        self.config = config;
        self
    }

    /// Starts the system, initializing the manager.
    ///
    /// Fails with [`SocketError::InvalidOperation`] if another system is running on this thread.
    pub fn build(self) -> Result<SocketSystem> {
        if ACTIVE.get() {
            tracing::warn!("socket system already running on this thread");
            return Err(SocketError::InvalidOperation);
        }
        let manager = self.manager.unwrap_or_else(default_manager);
        manager.on_init()?;
        ACTIVE.set(true);
        tracing::debug!(?manager, config = ?self.config, "socket system started");
        Ok(SocketSystem {
            shared: Rc::new(SystemShared {
                manager,
                config: self.config,
                next_id: Cell::new(1),
                live: Cell::new(0),
            }),
            running: true,
        })
    }
}

/// The socket engine of one thread: a manager plus the sockets registered with it.
///
/// Only one system runs per thread at a time. The manager is fixed for the lifetime of the
/// system, so it is always chosen before the first socket exists.
///
/// ```no_run
/// use evsock::{SocketEvent, SocketKind, SocketSystem};
///
/// let system = SocketSystem::new()?;
/// let listener = system.socket(SocketKind::Stream)?;
/// listener.bind(&"127.0.0.1:8080".parse().unwrap())?;
/// listener.listen()?;
/// listener.set_handler(SocketEvent::Connection, |socket, event| println!("{socket}: {event}"))?;
///
/// system.poll(None)?;
/// let client = listener.accept()?;
/// # drop(client);
/// # Ok::<(), evsock::SocketError>(())
/// ```
#[derive(Debug)]
pub struct SocketSystem {
    shared: Rc<SystemShared>,
    running: bool,
}

impl SocketSystem {
    /// Returns a builder to choose the manager and socket defaults.
    pub fn builder() -> SocketSystemBuilder {
        SocketSystemBuilder::default()
    }

    /// Starts a system with the platform default manager and default options.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Creates a socket registered with the manager of this system.
    pub fn socket(&self, kind: SocketKind) -> Result<Socket> {
        if !self.running {
            return Err(SocketError::InvalidOperation);
        }
        Socket::new(&self.shared, kind)
    }

    /// Runs one polling cycle of the manager, dispatching notifications to socket handlers.
    ///
    /// Waits at most `timeout`, or indefinitely for `None`, and returns the number of
    /// notifications dispatched.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<usize> {
        self.shared.manager.poll_events(timeout)
    }

    /// Returns the manager serving this system.
    pub fn manager(&self) -> &Rc<dyn SocketManager> {
        &self.shared.manager
    }

    /// Returns the initial options of new sockets.
    pub fn config(&self) -> &SocketConfig {
        &self.shared.config
    }

    /// Returns the number of sockets that have not been closed.
    pub fn live_sockets(&self) -> usize {
        self.shared.live.get()
    }

    /// Stops the system, tearing down the manager.
    pub fn cleanup(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !std::mem::replace(&mut self.running, false) {
            return;
        }
        let live = self.live_sockets();
        if live > 0 {
            tracing::warn!(live, "socket system stopped with open sockets");
        }
        self.shared.manager.on_exit();
        ACTIVE.set(false);
        tracing::debug!("socket system stopped");
    }
}

impl Drop for SocketSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Starts a [`SocketSystem`] with the platform default manager.
pub fn init() -> Result<SocketSystem> {
    SocketSystem::new()
}

/// Stops `system`, see [`SocketSystem::cleanup`].
pub fn cleanup(system: SocketSystem) {
    system.cleanup();
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::rc::Rc;

    use pretty_assertions::assert_eq;

    use super::SocketSystem;
    use crate::error::SocketError;
    use crate::manager::{ManagerCall, ManualManager};
    use crate::socket::SocketKind;
    use crate::traits::ConsoleAppTraits;

    #[test]
    fn one_system_per_thread() {
        let first = SocketSystem::new().unwrap();
        assert_eq!(
            SocketSystem::new().unwrap_err(),
            SocketError::InvalidOperation
        );
        first.cleanup();
        let second = SocketSystem::builder()
            .app_traits(&ConsoleAppTraits)
            .build()
            .unwrap();
        drop(second);
        assert!(super::init().is_ok());
    }

    #[test]
    fn manager_sees_init_and_exit_once() {
        let manager = Rc::new(ManualManager::new());
        let system = SocketSystem::builder()
            .manager(manager.clone())
            .build()
            .unwrap();
        let socket = system.socket(SocketKind::Datagram).unwrap();
        let id = socket.id();
        assert_eq!(system.live_sockets(), 1);
        drop(socket);
        assert_eq!(system.live_sockets(), 0);
        super::cleanup(system);

        assert_eq!(
            manager.calls(),
            [
                ManagerCall::Init,
                ManagerCall::InitSocket(id),
                ManagerCall::DestroySocket(id),
                ManagerCall::Exit,
            ]
        );
    }

    #[tracing_test::traced_test]
    #[test]
    fn warns_about_open_sockets() {
        let system = SocketSystem::new().unwrap();
        let socket = system.socket(SocketKind::Stream).unwrap();
        system.cleanup();
        assert!(logs_contain("socket system stopped with open sockets"));
        drop(socket);
    }
}
