//! Application traits: how the hosting application supplies platform services.

use std::rc::Rc;

use crate::manager::{SocketManager, default_manager};

/// Platform services an application provides to the socket engine.
///
/// GUI toolkits implement this to hand out a manager integrated with their event loop; console
/// programs use [`ConsoleAppTraits`].
pub trait AppTraits {
    /// Returns the manager sockets of this application register with.
    fn socket_manager(&self) -> Rc<dyn SocketManager>;
}

/// Application traits of programs without a foreign event loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleAppTraits;

impl AppTraits for ConsoleAppTraits {
    fn socket_manager(&self) -> Rc<dyn SocketManager> {
        default_manager()
    }
}
