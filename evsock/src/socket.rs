//! The socket state machine and its event dispatch.
//!
//! A [`Socket`] wraps at most one OS handle and moves through [`SocketStatus`]:
//!
//! ```text
//! Uninitialized --bind--> Bound --listen--> Listening
//!       |                   |
//!       +------connect------+--> Connecting --> Connected
//!                                    |              |
//!                                    +---failure----+--> Closed
//! ```
//!
//! The OS handle is always non-blocking. Blocking mode is emulated by waiting for readiness on
//! the socket's own descriptor, bounded by the socket timeout.
//!
//! Notifications are edge triggered: an event kind that fired is disarmed until the operation
//! consuming it re-arms it. [`Socket::read`] re-arms [`SocketEvent::Input`],
//! [`Socket::accept`] re-arms [`SocketEvent::Connection`] and a [`Socket::write`] that would
//! block re-arms [`SocketEvent::Output`]. [`Socket::enable_event`] re-arms explicitly.

use std::cell::{Ref, RefCell};
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags};

use crate::address::{Address, AddressFamily};
use crate::config::SocketConfig;
use crate::error::{IntoSocketError, Result, SocketError};
use crate::event::{EventFlags, EventHandler, Handlers, SocketEvent};
use crate::handle::{InputProbe, OsHandle};
use crate::manager::{Direction, Readiness, poll_timeout, readiness_from_poll};
use crate::system::SystemShared;

/// Identifies a socket within its [`SocketSystem`](crate::SocketSystem).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    /// Creates an identifier from its raw value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value of the identifier.
    pub const fn into_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport semantics of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// Connection oriented byte stream.
    Stream,
    /// Connectionless datagrams.
    Datagram,
}

/// Connection state of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketStatus {
    /// Created, no OS handle yet.
    Uninitialized,
    /// Bound to a local address.
    Bound,
    /// A non-blocking connect is in progress.
    Connecting,
    /// Connected to a peer.
    Connected,
    /// Accepting connections.
    Listening,
    /// Closed; every further operation fails with [`SocketError::InvalidOperation`].
    Closed,
}

/// What a readiness notification means for a socket in its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Events(EventFlags),
    /// The peer shut the stream down in an orderly way.
    PeerClosed,
    /// The connection or the connection attempt failed.
    Failed(SocketError),
}

fn classify(
    kind: SocketKind,
    status: SocketStatus,
    handle: &OsHandle,
    readiness: Readiness,
) -> Outcome {
    let failure = Readiness::ERROR | Readiness::HANGUP;
    match status {
        SocketStatus::Listening if readiness.intersects(Readiness::READABLE | failure) => {
            Outcome::Events(EventFlags::CONNECTION)
        }
        SocketStatus::Connecting if !readiness.is_empty() => {
            if handle.peer_address().is_ok() {
                return Outcome::Events(EventFlags::CONNECTION | EventFlags::OUTPUT);
            }
            if !readiness.intersects(failure) {
                return Outcome::Events(EventFlags::empty());
            }
            match handle.take_error() {
                Err(error) => Outcome::Failed(error),
                Ok(()) => Outcome::Failed(SocketError::Io(std::io::ErrorKind::NotConnected)),
            }
        }
        SocketStatus::Connected | SocketStatus::Bound => {
            let mut events = EventFlags::empty();
            if readiness.intersects(Readiness::READABLE | failure) {
                match (kind, handle.probe_input()) {
                    (SocketKind::Datagram, _) | (SocketKind::Stream, InputProbe::Data) => {
                        events |= EventFlags::INPUT;
                    }
                    (SocketKind::Stream, InputProbe::Empty) => {}
                    (SocketKind::Stream, InputProbe::Closed) => {
                        return match handle.take_error() {
                            Err(error) => Outcome::Failed(error),
                            Ok(()) => Outcome::PeerClosed,
                        };
                    }
                }
            }
            if readiness.contains(Readiness::WRITABLE) {
                events |= EventFlags::OUTPUT;
            }
            Outcome::Events(events)
        }
        _ => Outcome::Events(EventFlags::empty()),
    }
}

/// Waits until `handle` is ready in `direction`, at most `timeout`.
fn wait_ready(handle: &OsHandle, direction: Direction, timeout: Duration) -> Result<Readiness> {
    let flags = match direction {
        Direction::Input => PollFlags::POLLIN,
        Direction::Output => PollFlags::POLLOUT,
    };
    let mut fds = [PollFd::new(handle.as_fd(), flags)];
    match nix::poll::poll(&mut fds, poll_timeout(Some(timeout))?) {
        Ok(0) => Err(SocketError::TimedOut),
        Ok(_) => Ok(fds[0]
            .revents()
            .map(readiness_from_poll)
            .unwrap_or_default()),
        Err(Errno::EINTR) => Ok(Readiness::empty()),
        Err(error) => Err(error.into_socket_error()),
    }
}

#[derive(Debug)]
struct SocketState {
    status: SocketStatus,
    handle: Option<OsHandle>,
    local: Option<Address>,
    peer: Option<Address>,

    non_blocking: bool,
    timeout: Duration,
    reusable: bool,
    broadcast: bool,
    backlog: u32,

    /// Event kinds the application wants delivered.
    enabled: EventFlags,
    /// Event kinds that fired and wait to be re-armed.
    detected: EventFlags,
    /// Event kinds the manager currently watches.
    armed: EventFlags,
    suspended: bool,
    last_error: Option<SocketError>,
}

impl SocketState {
    fn new(config: &SocketConfig) -> Self {
        Self {
            status: SocketStatus::Uninitialized,
            handle: None,
            local: None,
            peer: None,
            non_blocking: config.non_blocking,
            timeout: config.timeout,
            reusable: config.reusable,
            broadcast: config.broadcast,
            backlog: config.backlog,
            enabled: EventFlags::empty(),
            detected: EventFlags::empty(),
            armed: EventFlags::empty(),
            suspended: false,
            last_error: None,
        }
    }

    fn check_open(&self) -> Result<()> {
        match self.status {
            SocketStatus::Closed => Err(SocketError::InvalidOperation),
            _ => Ok(()),
        }
    }

    fn handle(&self) -> Result<&OsHandle> {
        self.handle.as_ref().ok_or(SocketError::InvalidSocket)
    }

    /// Event kinds that can occur in the current state.
    fn applicable(&self, kind: SocketKind) -> EventFlags {
        match (self.status, kind) {
            (SocketStatus::Listening, _) => EventFlags::CONNECTION,
            (SocketStatus::Connecting, _) => EventFlags::CONNECTION | EventFlags::LOST,
            (SocketStatus::Connected, SocketKind::Stream) => {
                EventFlags::INPUT | EventFlags::OUTPUT | EventFlags::LOST
            }
            (SocketStatus::Connected | SocketStatus::Bound, SocketKind::Datagram) => {
                EventFlags::INPUT | EventFlags::OUTPUT
            }
            _ => EventFlags::empty(),
        }
    }

    /// Event kinds the manager should watch, given the installed handlers.
    fn interest(&self, kind: SocketKind, installed: EventFlags) -> EventFlags {
        let mut interest = (installed & self.enabled & self.applicable(kind)) - self.detected;
        if self.detected.contains(EventFlags::INPUT) {
            // Lost is observed on input readiness, which stays pending until the next read.
            interest.remove(EventFlags::LOST);
        }
        if self.status == SocketStatus::Connecting {
            // A pending connection completes whether or not anyone listens for it.
            interest.insert(EventFlags::CONNECTION);
        }
        interest
    }
}

/// The shared part of a socket, referenced weakly by its manager.
#[derive(Debug)]
pub(crate) struct SocketCore {
    this: Weak<SocketCore>,
    id: SocketId,
    kind: SocketKind,
    system: Rc<SystemShared>,
    state: RefCell<SocketState>,
    handlers: RefCell<Handlers>,
}

enum Fire {
    Events(EventFlags),
    Lost { deliver: bool },
}

impl SocketCore {
    fn socket_ref(&self) -> SocketRef {
        SocketRef {
            id: self.id,
            core: self.this.clone(),
        }
    }

    fn is_closed(&self) -> bool {
        self.state.borrow().status == SocketStatus::Closed
    }

    pub(crate) fn handle(&self) -> Option<Ref<'_, OsHandle>> {
        Ref::filter_map(self.state.borrow(), |state| state.handle.as_ref()).ok()
    }

    /// The descriptor direction `event` is observed on in the current state.
    pub(crate) fn direction(&self, event: SocketEvent) -> Direction {
        match event {
            SocketEvent::Input | SocketEvent::Lost => Direction::Input,
            SocketEvent::Output => Direction::Output,
            SocketEvent::Connection => match self.state.borrow().status {
                SocketStatus::Listening => Direction::Input,
                _ => Direction::Output,
            },
        }
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            self.state.borrow_mut().last_error = Some(*error);
        }
        result
    }

    /// Tells the manager about every change of the watched event kinds.
    fn sync_interest(&self) {
        let installed = self.handlers.borrow().installed();
        let (added, removed) = {
            let mut state = self.state.borrow_mut();
            if state.status == SocketStatus::Closed {
                return;
            }
            let interest = state.interest(self.kind, installed);
            let changes = (interest - state.armed, state.armed - interest);
            state.armed = interest;
            changes
        };
        let manager = &self.system.manager;
        let socket = self.socket_ref();
        for event in removed.events() {
            manager.uninstall_callback(&socket, event);
        }
        for event in added.events() {
            manager.install_callback(&socket, event);
        }
    }

    fn rearm(&self, event: SocketEvent) {
        self.state.borrow_mut().detected.remove(event.flag());
        self.sync_interest();
    }

    /// Runs `operation`, waiting for readiness in `direction` while it would block, unless the
    /// socket is non-blocking.
    fn blocking<T>(
        &self,
        direction: Direction,
        mut operation: impl FnMut(&OsHandle) -> Result<T>,
    ) -> Result<T> {
        let state = self.state.borrow();
        let handle = state.handle()?;
        let deadline = Instant::now() + state.timeout;
        loop {
            match operation(handle) {
                Err(SocketError::WouldBlock) if !state.non_blocking => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(SocketError::TimedOut);
                    }
                    wait_ready(handle, direction, remaining)?;
                }
                result => return result,
            }
        }
    }

    /// Completes a pending connection attempt, waiting for it in blocking mode if `wait` holds.
    ///
    /// Fails with [`SocketError::WouldBlock`] while the attempt is still in progress. A failed
    /// attempt closes the socket.
    fn finish_connect(&self, wait: bool) -> Result<()> {
        let completed = {
            let state = self.state.borrow();
            if state.status != SocketStatus::Connecting {
                return Ok(());
            }
            let handle = state.handle()?;
            let wait = wait && !state.non_blocking;
            let deadline = Instant::now() + state.timeout;
            let mut readiness = Readiness::empty();
            loop {
                if handle.peer_address().is_ok() {
                    break Ok(true);
                }
                if let Err(error) = handle.take_error() {
                    break Err(error);
                }
                if readiness.intersects(Readiness::ERROR | Readiness::HANGUP) {
                    break Err(SocketError::Io(std::io::ErrorKind::NotConnected));
                }
                if !wait {
                    break Ok(false);
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break Err(SocketError::TimedOut);
                }
                // Interrupted waits report no readiness and simply wait again.
                match wait_ready(handle, Direction::Output, remaining) {
                    Ok(ready) => readiness = ready,
                    Err(error) => break Err(error),
                }
            }
        };
        match completed {
            Ok(true) => {
                self.state.borrow_mut().status = SocketStatus::Connected;
                tracing::debug!(socket = %self.id, "connection established");
                self.sync_interest();
                Ok(())
            }
            Ok(false) => Err(SocketError::WouldBlock),
            Err(error) => {
                tracing::debug!(socket = %self.id, %error, "connection failed");
                self.state.borrow_mut().last_error = Some(error);
                self.close();
                Err(error)
            }
        }
    }

    fn invoke(&self, event: SocketEvent) {
        let Some(mut handler) = self.handlers.borrow_mut().take(event) else {
            return;
        };
        tracing::trace!(socket = %self.id, %event, "invoking handler");
        handler.handle_event(self.id, event);
        if !self.is_closed() {
            self.handlers.borrow_mut().restore(event, handler);
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(socket = %self.id))]
    fn dispatch(&self, readiness: Readiness) -> bool {
        let installed = self.handlers.borrow().installed();
        let fire = {
            let mut state = self.state.borrow_mut();
            if state.status == SocketStatus::Closed || state.suspended {
                return false;
            }
            let Some(handle) = state.handle.as_ref() else {
                return false;
            };
            let outcome = classify(self.kind, state.status, handle, readiness);
            let armed = (installed & state.enabled) - state.detected;
            match outcome {
                Outcome::Events(events) => {
                    if state.status == SocketStatus::Connecting
                        && events.contains(EventFlags::CONNECTION)
                    {
                        tracing::debug!(socket = %self.id, "connection established");
                        state.status = SocketStatus::Connected;
                    }
                    let fire = events & armed;
                    state.detected |= fire;
                    Fire::Events(fire)
                }
                Outcome::PeerClosed if armed.contains(EventFlags::LOST) => {
                    Fire::Lost { deliver: true }
                }
                Outcome::PeerClosed => {
                    // Without a lost handler the reader observes the end of the stream.
                    let fire = armed & EventFlags::INPUT;
                    state.detected |= fire;
                    Fire::Events(fire)
                }
                Outcome::Failed(error) => {
                    tracing::debug!(socket = %self.id, %error, "connection failed");
                    state.last_error = Some(error);
                    Fire::Lost {
                        deliver: armed.contains(EventFlags::LOST),
                    }
                }
            }
        };

        match fire {
            Fire::Events(events) => {
                self.sync_interest();
                for event in events.events() {
                    if self.is_closed() {
                        break;
                    }
                    self.invoke(event);
                }
                self.sync_interest();
                !events.is_empty()
            }
            Fire::Lost { deliver } => {
                let handler = if deliver {
                    self.handlers.borrow_mut().take(SocketEvent::Lost)
                } else {
                    None
                };
                self.close();
                match handler {
                    Some(mut handler) => {
                        tracing::trace!(socket = %self.id, "invoking lost handler");
                        handler.handle_event(self.id, SocketEvent::Lost);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    fn close(&self) {
        let handle = {
            let mut state = self.state.borrow_mut();
            if state.status == SocketStatus::Closed {
                return;
            }
            state.status = SocketStatus::Closed;
            state.armed = EventFlags::empty();
            state.detected = EventFlags::empty();
            state.handle.take()
        };
        let handlers = std::mem::take(&mut *self.handlers.borrow_mut());
        self.system.manager.destroy_socket(&self.socket_ref());
        self.system.socket_closed();
        drop(handle);
        drop(handlers);
        tracing::debug!(socket = %self.id, "socket closed");
    }
}

/// A weak reference to a socket, held by managers.
///
/// It does not keep the socket alive; once the socket is dropped all operations become no-ops.
#[derive(Debug, Clone)]
pub struct SocketRef {
    id: SocketId,
    core: Weak<SocketCore>,
}

impl SocketRef {
    /// Returns the identifier of the referenced socket.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Returns whether the socket still exists and is not closed.
    pub fn is_alive(&self) -> bool {
        self.upgrade().is_some_and(|core| !core.is_closed())
    }

    /// Returns the descriptor direction `event` is observed on in the socket's current state.
    pub fn direction(&self, event: SocketEvent) -> Option<Direction> {
        Some(self.upgrade()?.direction(event))
    }

    /// Returns the OS descriptor, if the socket has one.
    pub fn raw_fd(&self) -> Option<RawFd> {
        let core = self.upgrade()?;
        core.handle().map(|handle| handle.as_raw_fd())
    }

    /// Hands a readiness notification to the socket.
    ///
    /// Returns whether at least one handler was invoked. Closed, suspended and dropped sockets
    /// ignore notifications.
    pub fn dispatch(&self, readiness: Readiness) -> bool {
        self.upgrade().is_some_and(|core| core.dispatch(readiness))
    }

    pub(crate) fn upgrade(&self) -> Option<Rc<SocketCore>> {
        self.core.upgrade()
    }
}

/// Shares one handler between several event kinds.
struct SharedHandler<H>(Rc<RefCell<H>>);

impl<H: EventHandler> EventHandler for SharedHandler<H> {
    fn handle_event(&mut self, socket: SocketId, event: SocketEvent) {
        match self.0.try_borrow_mut() {
            Ok(mut handler) => handler.handle_event(socket, event),
            Err(_) => tracing::warn!(%socket, %event, "shared handler re-entered, event dropped"),
        }
    }
}

/// A generic socket.
///
/// Created through [`SocketSystem::socket`](crate::SocketSystem::socket). Dropping the socket
/// closes it.
#[derive(Debug)]
pub struct Socket {
    core: Rc<SocketCore>,
}

impl Socket {
    pub(crate) fn new(system: &Rc<SystemShared>, kind: SocketKind) -> Result<Self> {
        let id = system.allocate_id();
        let core = Rc::new_cyclic(|this| SocketCore {
            this: this.clone(),
            id,
            kind,
            system: system.clone(),
            state: RefCell::new(SocketState::new(system.config())),
            handlers: RefCell::default(),
        });
        if let Err(error) = system.manager.init_socket(&core.socket_ref()) {
            tracing::warn!(socket = %id, %error, "manager refused socket");
            return Err(error);
        }
        system.socket_opened();
        tracing::debug!(socket = %id, ?kind, "socket created");
        Ok(Self { core })
    }

    /// Returns the identifier passed to handlers of this socket.
    pub fn id(&self) -> SocketId {
        self.core.id
    }

    /// Returns whether this is a stream or datagram socket.
    pub fn kind(&self) -> SocketKind {
        self.core.kind
    }

    /// Returns the connection state.
    pub fn status(&self) -> SocketStatus {
        self.core.state.borrow().status
    }

    /// Returns the error of the most recent failed operation.
    pub fn last_error(&self) -> Option<SocketError> {
        self.core.state.borrow().last_error
    }

    /// Returns a weak reference to this socket.
    pub fn socket_ref(&self) -> SocketRef {
        self.core.socket_ref()
    }

    /// Binds the socket to a local address.
    ///
    /// Only valid before the socket has been bound or connected.
    pub fn bind(&self, address: &Address) -> Result<()> {
        let result = self.bind_inner(address);
        self.core.record(result)
    }

    fn bind_inner(&self, address: &Address) -> Result<()> {
        {
            let mut state = self.core.state.borrow_mut();
            state.check_open()?;
            if state.status != SocketStatus::Uninitialized {
                return Err(SocketError::InvalidOperation);
            }
            let handle = self.open_handle(&state, address)?;
            handle.bind(address)?;
            state.local = Some(handle.local_address().unwrap_or_else(|_| address.clone()));
            state.handle = Some(handle);
            state.status = SocketStatus::Bound;
            tracing::debug!(socket = %self.core.id, %address, "socket bound");
        }
        self.core.sync_interest();
        Ok(())
    }

    fn open_handle(&self, state: &SocketState, address: &Address) -> Result<OsHandle> {
        let domain = address.domain()?;
        let handle = match self.core.kind {
            SocketKind::Stream => OsHandle::stream(domain)?,
            SocketKind::Datagram => OsHandle::datagram(domain)?,
        };
        if state.reusable {
            handle.set_reuse_address()?;
        }
        if state.broadcast && self.core.kind == SocketKind::Datagram {
            handle.set_broadcast(true)?;
        }
        Ok(handle)
    }

    /// Starts accepting connections on a bound stream socket.
    pub fn listen(&self) -> Result<()> {
        let result = self.listen_inner();
        self.core.record(result)
    }

    fn listen_inner(&self) -> Result<()> {
        {
            let mut state = self.core.state.borrow_mut();
            state.check_open()?;
            if state.status != SocketStatus::Bound || self.core.kind != SocketKind::Stream {
                return Err(SocketError::InvalidOperation);
            }
            let backlog = i32::try_from(state.backlog).unwrap_or(i32::MAX);
            state.handle()?.listen(backlog)?;
            state.status = SocketStatus::Listening;
            tracing::debug!(socket = %self.core.id, backlog, "socket listening");
        }
        self.core.sync_interest();
        Ok(())
    }

    /// Accepts a pending connection, returning a connected socket.
    ///
    /// The new socket inherits the options and enabled event kinds of the listener, but no
    /// handlers. Re-arms [`SocketEvent::Connection`] on the listener.
    #[tracing::instrument(level = "debug", skip(self), fields(socket = %self.core.id))]
    pub fn accept(&self) -> Result<Socket> {
        let result = self.accept_inner();
        self.core.record(result)
    }

    fn accept_inner(&self) -> Result<Socket> {
        let inherited = {
            let state = self.core.state.borrow();
            state.check_open()?;
            if state.status != SocketStatus::Listening {
                return Err(SocketError::InvalidOperation);
            }
            SocketState {
                status: SocketStatus::Connected,
                enabled: state.enabled - EventFlags::CONNECTION,
                ..SocketState::new(&SocketConfig {
                    non_blocking: state.non_blocking,
                    timeout: state.timeout,
                    reusable: state.reusable,
                    broadcast: state.broadcast,
                    backlog: state.backlog,
                })
            }
        };

        let accepted = self.core.blocking(Direction::Input, OsHandle::accept);
        self.core.rearm(SocketEvent::Connection);
        let (handle, peer) = accepted?;

        let socket = Socket::new(&self.core.system, SocketKind::Stream)?;
        {
            let mut state = socket.core.state.borrow_mut();
            *state = inherited;
            state.local = handle.local_address().ok();
            state.peer = Some(peer);
            state.handle = Some(handle);
        }
        tracing::debug!(
            socket = %socket.core.id,
            peer = ?socket.core.state.borrow().peer,
            "connection accepted",
        );
        Ok(socket)
    }

    /// Connects to `address`.
    ///
    /// A stream socket in non-blocking mode returns [`SocketError::WouldBlock`] while the
    /// connection is in progress; [`SocketEvent::Connection`] reports its completion and
    /// [`SocketEvent::Lost`] its failure. In blocking mode the call waits at most the socket
    /// timeout. A failed connection closes the socket.
    ///
    /// Connecting a datagram socket only fixes its default peer.
    #[tracing::instrument(level = "debug", skip(self, address), fields(socket = %self.core.id, %address))]
    pub fn connect(&self, address: &Address) -> Result<()> {
        let result = self.connect_inner(address);
        self.core.record(result)
    }

    fn connect_inner(&self, address: &Address) -> Result<()> {
        let started = {
            let mut state = self.core.state.borrow_mut();
            state.check_open()?;
            match (state.status, self.core.kind) {
                (SocketStatus::Uninitialized | SocketStatus::Bound, _)
                | (SocketStatus::Connected, SocketKind::Datagram) => {}
                _ => return Err(SocketError::InvalidOperation),
            }
            if state.handle.is_none() {
                let handle = self.open_handle(&state, address)?;
                state.handle = Some(handle);
            }
            state.peer = Some(address.clone());
            state.handle()?.connect(address)
        };

        let status = match started {
            Ok(()) => SocketStatus::Connected,
            Err(SocketError::WouldBlock) if self.core.kind == SocketKind::Stream => {
                SocketStatus::Connecting
            }
            Err(error) => {
                self.core.close();
                return Err(error);
            }
        };
        {
            let mut state = self.core.state.borrow_mut();
            state.status = status;
            if state.local.is_none() {
                state.local = state.handle()?.local_address().ok();
            }
        }
        self.core.sync_interest();

        if status == SocketStatus::Connected {
            tracing::debug!("connected");
            return Ok(());
        }
        self.core.finish_connect(true)
    }

    /// Reads available data into `buffer`, returning the number of bytes read.
    ///
    /// Zero on a stream socket means the peer closed the connection. A datagram socket records
    /// the sender as its peer. Re-arms [`SocketEvent::Input`].
    ///
    /// A pending connection is completed first, see [`Socket::connect`].
    pub fn read(&self, buffer: &mut [u8]) -> Result<usize> {
        let result = self.read_inner(buffer);
        self.core.record(result)
    }

    fn read_inner(&self, buffer: &mut [u8]) -> Result<usize> {
        self.core.finish_connect(true)?;
        {
            let state = self.core.state.borrow();
            state.check_open()?;
            match (state.status, self.core.kind) {
                (SocketStatus::Connected, _) | (SocketStatus::Bound, SocketKind::Datagram) => {}
                _ => return Err(SocketError::InvalidOperation),
            }
        }
        let result = self
            .core
            .blocking(Direction::Input, |handle| handle.read(&mut *buffer));
        if let Ok((_, Some(sender))) = &result {
            self.core.state.borrow_mut().peer = Some(sender.clone());
        }
        self.core.rearm(SocketEvent::Input);
        result.map(|(read, _)| read)
    }

    /// Writes `buffer`, returning the number of bytes written.
    ///
    /// Datagram sockets send to their peer, see [`Socket::set_peer`]. A write that would block
    /// re-arms [`SocketEvent::Output`]. A pending connection is completed first.
    pub fn write(&self, buffer: &[u8]) -> Result<usize> {
        let result = self.write_inner(buffer);
        self.core.record(result)
    }

    fn write_inner(&self, buffer: &[u8]) -> Result<usize> {
        self.core.finish_connect(true)?;
        let peer = {
            let mut state = self.core.state.borrow_mut();
            state.check_open()?;
            match (state.status, self.core.kind) {
                (SocketStatus::Connected, SocketKind::Stream) => None,
                (SocketStatus::Connected, SocketKind::Datagram) => None,
                (SocketStatus::Uninitialized | SocketStatus::Bound, SocketKind::Datagram) => {
                    let peer = state.peer.clone().ok_or(SocketError::InvalidAddress)?;
                    if state.handle.is_none() {
                        // The OS binds an unbound datagram socket on its first send.
                        let handle = self.open_handle(&state, &peer)?;
                        state.handle = Some(handle);
                        state.status = SocketStatus::Bound;
                    }
                    Some(peer)
                }
                _ => return Err(SocketError::InvalidOperation),
            }
        };
        let result = self
            .core
            .blocking(Direction::Output, |handle| handle.write(buffer, peer.as_ref()));
        if result == Err(SocketError::WouldBlock) {
            self.core.rearm(SocketEvent::Output);
        } else {
            self.core.sync_interest();
        }
        result
    }

    /// Sets the destination of a datagram socket.
    pub fn set_peer(&self, address: &Address) -> Result<()> {
        let result = {
            let mut state = self.core.state.borrow_mut();
            state.check_open().and_then(|()| {
                if self.core.kind != SocketKind::Datagram {
                    return Err(SocketError::InvalidOperation);
                }
                if address.family() == AddressFamily::None {
                    return Err(SocketError::InvalidAddress);
                }
                state.peer = Some(address.clone());
                Ok(())
            })
        };
        self.core.record(result)
    }

    /// Returns the local address, querying the OS if it is not known yet.
    pub fn local(&self) -> Result<Address> {
        let result = {
            let mut state = self.core.state.borrow_mut();
            state.check_open().and_then(|()| {
                if let Some(local) = &state.local {
                    return Ok(local.clone());
                }
                let local = state.handle()?.local_address()?;
                state.local = Some(local.clone());
                Ok(local)
            })
        };
        self.core.record(result)
    }

    /// Returns the peer address, querying the OS if it is not known yet.
    pub fn peer(&self) -> Result<Address> {
        let result = {
            let mut state = self.core.state.borrow_mut();
            state.check_open().and_then(|()| {
                if let Some(peer) = &state.peer {
                    return Ok(peer.clone());
                }
                let peer = state.handle()?.peer_address()?;
                state.peer = Some(peer.clone());
                Ok(peer)
            })
        };
        self.core.record(result)
    }

    fn update_option(&self, update: impl FnOnce(&mut SocketState) -> Result<()>) -> Result<()> {
        let result = {
            let mut state = self.core.state.borrow_mut();
            state.check_open().and_then(|()| update(&mut state))
        };
        self.core.record(result)
    }

    /// Switches between non-blocking and blocking operation.
    pub fn set_non_blocking(&self, non_blocking: bool) -> Result<()> {
        self.update_option(|state| {
            state.non_blocking = non_blocking;
            Ok(())
        })
    }

    /// Sets how long blocking operations wait.
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.update_option(|state| {
            state.timeout = timeout;
            Ok(())
        })
    }

    /// Allows binding to an address in `TIME_WAIT`, must be called before binding.
    pub fn set_reusable(&self) -> Result<()> {
        self.update_option(|state| {
            if state.status != SocketStatus::Uninitialized {
                return Err(SocketError::InvalidOperation);
            }
            state.reusable = true;
            Ok(())
        })
    }

    /// Allows a datagram socket to send to broadcast addresses.
    pub fn set_broadcast(&self, broadcast: bool) -> Result<()> {
        let kind = self.core.kind;
        self.update_option(|state| {
            if kind != SocketKind::Datagram {
                return Err(SocketError::InvalidOption);
            }
            if let Some(handle) = &state.handle {
                handle.set_broadcast(broadcast)?;
            }
            state.broadcast = broadcast;
            Ok(())
        })
    }

    /// Sets the length of the pending connection queue used by [`Socket::listen`].
    pub fn set_backlog(&self, backlog: u32) -> Result<()> {
        self.update_option(|state| {
            if backlog == 0 {
                return Err(SocketError::InvalidOption);
            }
            state.backlog = backlog;
            Ok(())
        })
    }

    /// Returns which of `flags` hold right now, without waiting and without invoking handlers.
    ///
    /// Completes a pending connection that has succeeded; a failed one closes the socket and
    /// reports [`SocketEvent::Lost`].
    pub fn select(&self, flags: EventFlags) -> Result<EventFlags> {
        let result = self.select_inner(flags);
        self.core.record(result)
    }

    fn select_inner(&self, flags: EventFlags) -> Result<EventFlags> {
        let connecting = self.status() == SocketStatus::Connecting;
        match self.core.finish_connect(false) {
            Ok(()) if connecting => {
                return Ok((EventFlags::CONNECTION | EventFlags::OUTPUT) & flags);
            }
            Ok(()) | Err(SocketError::WouldBlock) => {}
            Err(_) => return Ok(EventFlags::LOST & flags),
        }
        let state = self.core.state.borrow();
        state.check_open()?;
        let Some(handle) = state.handle.as_ref() else {
            return Ok(EventFlags::empty());
        };
        let mut fds = [PollFd::new(
            handle.as_fd(),
            PollFlags::POLLIN | PollFlags::POLLOUT,
        )];
        match nix::poll::poll(&mut fds, poll_timeout(Some(Duration::ZERO))?) {
            Ok(_) | Err(Errno::EINTR) => {}
            Err(error) => return Err(error.into_socket_error()),
        }
        let readiness = fds[0]
            .revents()
            .map(readiness_from_poll)
            .unwrap_or_default();
        let observed = match classify(self.core.kind, state.status, handle, readiness) {
            Outcome::Events(events) => events,
            Outcome::PeerClosed | Outcome::Failed(_) => EventFlags::LOST,
        };
        Ok(observed & flags)
    }

    /// Installs `handler` for `event` and enables the event kind.
    ///
    /// Replaces any handler previously installed for `event`.
    pub fn set_handler<F>(&self, event: SocketEvent, handler: F) -> Result<()>
    where
        F: FnMut(SocketId, SocketEvent) + 'static,
    {
        let mut handler = Some(handler);
        self.install(event.flag(), |_| match handler.take() {
            Some(handler) => Box::new(handler),
            None => Box::new(|_: SocketId, _: SocketEvent| {}),
        })
    }

    /// Installs one closure for every event kind in `flags` and enables them.
    pub fn set_handler_for<F>(&self, flags: EventFlags, handler: F) -> Result<()>
    where
        F: FnMut(SocketId, SocketEvent) + 'static,
    {
        self.set_event_handler(flags, handler)
    }

    /// Installs one [`EventHandler`] for every event kind in `flags` and enables them.
    pub fn set_event_handler<H>(&self, flags: EventFlags, handler: H) -> Result<()>
    where
        H: EventHandler + 'static,
    {
        let shared = Rc::new(RefCell::new(handler));
        self.install(flags, |_| Box::new(SharedHandler(shared.clone())))
    }

    fn install(
        &self,
        flags: EventFlags,
        mut make: impl FnMut(SocketEvent) -> Box<dyn EventHandler>,
    ) -> Result<()> {
        self.update_option(|state| {
            state.enabled |= flags;
            state.detected -= flags;
            Ok(())
        })?;
        {
            let mut handlers = self.core.handlers.borrow_mut();
            for event in flags.events() {
                handlers.set(event, make(event));
            }
        }
        self.core.sync_interest();
        Ok(())
    }

    /// Removes the handlers of every event kind in `flags`.
    pub fn unset_handler(&self, flags: EventFlags) -> Result<()> {
        self.update_option(|state| {
            state.enabled -= flags;
            Ok(())
        })?;
        let removed: Vec<_> = {
            let mut handlers = self.core.handlers.borrow_mut();
            flags.events().filter_map(|event| handlers.take(event)).collect()
        };
        self.core.sync_interest();
        drop(removed);
        Ok(())
    }

    /// Enables delivery of `event` and re-arms it.
    pub fn enable_event(&self, event: SocketEvent) -> Result<()> {
        self.update_option(|state| {
            state.enabled.insert(event.flag());
            state.detected.remove(event.flag());
            Ok(())
        })?;
        self.core.sync_interest();
        Ok(())
    }

    /// Stops delivery of `event` until it is enabled again.
    pub fn disable_event(&self, event: SocketEvent) -> Result<()> {
        self.update_option(|state| {
            state.enabled.remove(event.flag());
            Ok(())
        })?;
        self.core.sync_interest();
        Ok(())
    }

    /// Resumes delivery after [`Socket::disable_events`].
    pub fn enable_events(&self) -> Result<()> {
        self.set_suspended(false)
    }

    /// Suspends delivery of all events while keeping handlers and registrations.
    pub fn disable_events(&self) -> Result<()> {
        self.set_suspended(true)
    }

    fn set_suspended(&self, suspended: bool) -> Result<()> {
        let mut changed = false;
        self.update_option(|state| {
            changed = state.suspended != suspended;
            state.suspended = suspended;
            Ok(())
        })?;
        if changed {
            let manager = &self.core.system.manager;
            if suspended {
                manager.disable_events(&self.socket_ref());
            } else {
                manager.enable_events(&self.socket_ref());
            }
        }
        Ok(())
    }

    /// Closes the socket, releasing the OS handle. Safe to call in any state and more than once.
    ///
    /// No handler of this socket runs afterwards, even for notifications already queued by the
    /// manager.
    pub fn close(&self) {
        self.core.close();
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.core.close();
    }
}
