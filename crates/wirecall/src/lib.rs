//! Request/response RPC over byte streams.
//!
//! A [`Server`] maps numeric commands to typed handlers and serves each
//! connection with one reader loop, running every request on its own thread
//! and writing replies under a per-connection send lock. A [`Client`] issues
//! calls over one connection, matching replies to callers by sequence number
//! and expiring calls whose deadline passes.
//!
//! Framing is pluggable: the binary codec writes consecutive `bincode`
//! records, and the JSON codec writes one newline-terminated object per
//! message. Both implement the traits in [`codec`].
//!
//! Handlers report failures as numeric [`ErrorCode`]s. Two codes are
//! reserved: [`ErrorCode::UNKNOWN_REQUEST`] for requests the server could not
//! route or decode, and [`ErrorCode::FAILURE`] for handler errors without a
//! code, unencodable replies, and panics.
//!
//! Endpoints, codec choice, logging, and the default call deadline are read
//! through [`wirecall_config::Config`].

pub mod client;
pub mod codec;
mod dispatch;
mod errors;
pub mod free_list;
mod header;
pub mod server;
pub mod telemetry;
pub mod transport;

pub use client::{Call, Client};
pub use dispatch::{CallContext, Registration};
pub use errors::{BoxError, CallError, CodecError, ConnectError, ErrorCode};
pub use header::{RequestHeader, ResponseHeader};
pub use server::{QueuedCall, Server};
pub use telemetry::{TelemetryError, TelemetryHandle};
pub use wirecall_config::{CodecKind, Config, SocketEndpoint};

#[cfg(test)]
mod tests;
