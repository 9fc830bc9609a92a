//! Socket transports for servers and clients.
//!
//! [`SocketListener`] binds a configured endpoint and accepts connections on a
//! background thread, handing each to a [`ConnectionHandler`]. [`connect`]
//! dials the same endpoints from the client side.

mod connect;
mod errors;
mod handler;
mod listener;

pub use self::connect::{CONNECTION_TIMEOUT, connect};
pub use self::errors::ListenerError;
pub use self::handler::{ConnectionHandler, ConnectionStream};
pub use self::listener::{ListenerHandle, SocketListener};
#[cfg(test)]
pub(crate) use self::listener_tests::AcceptLog;

const LISTENER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");
