//! Generic sockets with pluggable readiness managers.
//!
//! Stream and datagram sockets over IPv4, IPv6 and Unix domain addresses, driven by a
//! single-threaded event model: a [`SocketManager`] observes descriptor readiness and the
//! sockets turn it into per-kind notifications (input, output, connection, lost) delivered to
//! typed handlers.
//!
//! ```no_run
//! use evsock::{Address, SocketEvent, SocketKind, SocketSystem};
//!
//! let system = SocketSystem::new()?;
//! let client = system.socket(SocketKind::Stream)?;
//! client.set_non_blocking(true)?;
//! client.set_handler(SocketEvent::Connection, |socket, _| println!("{socket} connected"))?;
//!
//! let address: Address = "127.0.0.1:7".parse().unwrap();
//! match client.connect(&address) {
//!     Ok(()) | Err(evsock::SocketError::WouldBlock) => {}
//!     Err(error) => return Err(error),
//! }
//! system.poll(None)?;
//! # Ok::<(), evsock::SocketError>(())
//! ```
//!
//! Managers are chosen before the [`SocketSystem`] starts: [`PollManager`] for console programs
//! (the default), [`ManualManager`] for hosts that observe readiness in their own event loop.

#![forbid(unsafe_code)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

#[cfg(not(unix))]
compile_error!("evsock supports Unix platforms only");

mod address;
mod config;
mod error;
mod event;
mod handle;
pub mod manager;
mod services;
mod socket;
mod system;
mod traits;

pub use address::{Address, AddressFamily, AddressParseError, UNIX_PATH_MAX};
pub use config::{DEFAULT_BACKLOG, DEFAULT_TIMEOUT, SocketConfig};
pub use error::{Result, SocketError};
pub use event::{EventFlags, EventHandler, SocketEvent};
pub use manager::{ManualManager, PollManager, Readiness, SocketManager};
pub use socket::{Socket, SocketId, SocketKind, SocketRef, SocketStatus};
pub use system::{SocketSystem, SocketSystemBuilder, cleanup, init};
pub use traits::{AppTraits, ConsoleAppTraits};
