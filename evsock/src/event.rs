//! Event kinds, event masks and the handler abstraction used for notifications.

use std::fmt;

use crate::socket::SocketId;

/// The kind of a socket notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SocketEvent {
    /// Data can be read without blocking.
    Input,
    /// Data can be written without blocking.
    Output,
    /// A pending connection can be accepted (listening sockets) or an outgoing connection was
    /// established (connecting sockets).
    Connection,
    /// The connection was closed by the peer or failed.
    Lost,
}

impl SocketEvent {
    /// All event kinds, in dispatch order.
    ///
    /// A completed connection is reported before the input and output it enables.
    pub const ALL: [SocketEvent; 4] = [
        SocketEvent::Connection,
        SocketEvent::Input,
        SocketEvent::Output,
        SocketEvent::Lost,
    ];

    /// Returns the single-bit mask for this event kind.
    pub const fn flag(self) -> EventFlags {
        match self {
            SocketEvent::Input => EventFlags::INPUT,
            SocketEvent::Output => EventFlags::OUTPUT,
            SocketEvent::Connection => EventFlags::CONNECTION,
            SocketEvent::Lost => EventFlags::LOST,
        }
    }

    const fn index(self) -> usize {
        match self {
            SocketEvent::Input => 0,
            SocketEvent::Output => 1,
            SocketEvent::Connection => 2,
            SocketEvent::Lost => 3,
        }
    }
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketEvent::Input => "input",
            SocketEvent::Output => "output",
            SocketEvent::Connection => "connection",
            SocketEvent::Lost => "lost",
        };
        f.write_str(name)
    }
}

bitflags::bitflags! {
    /// A set of [`SocketEvent`] kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventFlags: u8 {
        /// See [`SocketEvent::Input`].
        const INPUT = 1 << 0;
        /// See [`SocketEvent::Output`].
        const OUTPUT = 1 << 1;
        /// See [`SocketEvent::Connection`].
        const CONNECTION = 1 << 2;
        /// See [`SocketEvent::Lost`].
        const LOST = 1 << 3;
    }
}

impl EventFlags {
    /// Iterates over the event kinds contained in this mask, in dispatch order.
    pub fn events(self) -> impl Iterator<Item = SocketEvent> {
        SocketEvent::ALL
            .into_iter()
            .filter(move |event| self.contains(event.flag()))
    }
}

impl From<SocketEvent> for EventFlags {
    fn from(event: SocketEvent) -> Self {
        event.flag()
    }
}

/// Receives notifications for a socket.
///
/// Implemented for every `FnMut(SocketId, SocketEvent)` closure, so the typed context of a
/// handler is whatever the closure captures.
pub trait EventHandler {
    /// Called once per readiness edge for every enabled event kind.
    fn handle_event(&mut self, socket: SocketId, event: SocketEvent);
}

impl<F> EventHandler for F
where
    F: FnMut(SocketId, SocketEvent),
{
    fn handle_event(&mut self, socket: SocketId, event: SocketEvent) {
        self(socket, event)
    }
}

/// Per-event-kind handler slots of one socket.
#[derive(Default)]
pub(crate) struct Handlers {
    slots: [Option<Box<dyn EventHandler>>; 4],
}

impl Handlers {
    pub(crate) fn take(&mut self, event: SocketEvent) -> Option<Box<dyn EventHandler>> {
        self.slots[event.index()].take()
    }

    /// Restores a handler taken for dispatch unless the slot was refilled in the meantime.
    pub(crate) fn restore(&mut self, event: SocketEvent, handler: Box<dyn EventHandler>) {
        let slot = &mut self.slots[event.index()];
        if slot.is_none() {
            *slot = Some(handler);
        }
    }

    pub(crate) fn set(&mut self, event: SocketEvent, handler: Box<dyn EventHandler>) {
        self.slots[event.index()] = Some(handler);
    }

    pub(crate) fn installed(&self) -> EventFlags {
        SocketEvent::ALL
            .into_iter()
            .filter(|event| self.slots[event.index()].is_some())
            .fold(EventFlags::empty(), |flags, event| flags | event.flag())
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("installed", &self.installed())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::{EventFlags, EventHandler, Handlers, SocketEvent};
    use crate::socket::SocketId;

    #[test]
    fn flags_iterate_in_dispatch_order() {
        let flags = EventFlags::LOST | EventFlags::INPUT | EventFlags::CONNECTION;
        let events: Vec<_> = flags.events().collect();
        assert_eq!(
            events,
            [SocketEvent::Connection, SocketEvent::Input, SocketEvent::Lost]
        );
    }

    #[test]
    fn restore_keeps_replacement() {
        let calls = Rc::new(Cell::new(0));
        let mut handlers = Handlers::default();

        let first = calls.clone();
        handlers.set(
            SocketEvent::Input,
            Box::new(move |_: SocketId, _: SocketEvent| first.set(first.get() + 1)),
        );

        let taken = handlers.take(SocketEvent::Input).unwrap();
        assert_eq!(handlers.installed(), EventFlags::empty());

        let second = calls.clone();
        handlers.set(
            SocketEvent::Input,
            Box::new(move |_: SocketId, _: SocketEvent| second.set(second.get() + 10)),
        );
        handlers.restore(SocketEvent::Input, taken);

        let mut current = handlers.take(SocketEvent::Input).unwrap();
        current.handle_event(SocketId::from_raw(1), SocketEvent::Input);
        assert_eq!(calls.get(), 10);
    }
}
