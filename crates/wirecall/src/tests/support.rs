//! Shared fixtures: loopback connections and a small arithmetic service.

use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::CallContext;
use crate::errors::ErrorCode;
use crate::server::Server;

/// Adds two numbers.
pub(crate) const ADD: u32 = 100;
/// Always fails with code 777.
pub(crate) const FAIL: u32 = 101;
/// Sleeps for the requested number of milliseconds.
pub(crate) const SLOW: u32 = 102;
/// Takes no parameters and answers `"pong"`.
pub(crate) const PING: u32 = 103;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AddArgs {
    pub(crate) a: u64,
    pub(crate) b: u64,
}

/// Server with every test command registered.
pub(crate) fn service() -> Server<()> {
    let mut server = Server::new();
    server.register(ADD, |_: &CallContext<()>, args: AddArgs, sum: &mut u64| {
        *sum = args.a + args.b;
        Ok::<(), ErrorCode>(())
    });
    server.register(FAIL, |_: &CallContext<()>, (): (), _: &mut ()| {
        Err(ErrorCode(777))
    });
    server.register(SLOW, |_: &CallContext<()>, millis: u64, _: &mut ()| {
        thread::sleep(Duration::from_millis(millis));
        Ok::<(), ErrorCode>(())
    });
    server.register(PING, |_: &CallContext<()>, (): (), reply: &mut String| {
        "pong".clone_into(reply);
        Ok::<(), ErrorCode>(())
    });
    server
}

/// Connected loopback pair: `(client side, server side)`.
pub(crate) fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind loopback");
    let address = listener.local_addr().expect("local addr");
    let client = TcpStream::connect(address).expect("connect loopback");
    let (server, _) = listener.accept().expect("accept loopback");
    (client, server)
}
