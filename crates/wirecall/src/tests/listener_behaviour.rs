//! Behavioural tests for the socket listener.

use std::cell::RefCell;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tempfile::TempDir;

use wirecall_config::SocketEndpoint;

use crate::transport::{AcceptLog, ListenerHandle, SocketListener, connect};

struct ListenerWorld {
    endpoint: SocketEndpoint,
    listener: Option<ListenerHandle>,
    accepted: Arc<AcceptLog>,
    start_error: Option<String>,
    reserved: Option<TcpListener>,
    directory: Option<TempDir>,
}

impl ListenerWorld {
    fn new() -> Self {
        Self {
            endpoint: SocketEndpoint::tcp("127.0.0.1", 0),
            listener: None,
            accepted: AcceptLog::new(),
            start_error: None,
            reserved: None,
            directory: None,
        }
    }

    fn start(&mut self) {
        let log = AcceptLog::new();
        self.accepted = Arc::clone(&log);
        let started =
            SocketListener::bind(&self.endpoint).and_then(|listener| listener.start(log));
        match started {
            Ok(handle) => {
                self.endpoint = handle.endpoint().clone();
                self.listener = Some(handle);
            }
            Err(error) => self.start_error = Some(error.to_string()),
        }
    }

    fn reserve_port(&mut self) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind reserved port");
        let port = listener.local_addr().expect("local addr").port();
        self.endpoint = SocketEndpoint::tcp("127.0.0.1", port);
        self.reserved = Some(listener);
    }

    #[cfg(unix)]
    fn leave_stale_socket(&mut self) {
        let directory = tempfile::tempdir().expect("temp dir");
        let path = directory.path().join("wirecall.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).expect("bind stale socket"));
        self.endpoint = SocketEndpoint::unix(path.to_str().expect("utf8 path"));
        self.directory = Some(directory);
    }
}

impl Drop for ListenerWorld {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.take() {
            handle.shutdown();
            if handle.join().is_err() && !thread::panicking() {
                panic!("listener thread panicked");
            }
        }
        self.reserved = None;
        self.directory = None;
    }
}

#[fixture]
fn world() -> RefCell<ListenerWorld> {
    RefCell::new(ListenerWorld::new())
}

#[given("a TCP socket listener is running")]
fn given_tcp_listener(world: &RefCell<ListenerWorld>) {
    world.borrow_mut().start();
    assert_started(world);
}

#[given("a TCP port is already bound")]
fn given_port_in_use(world: &RefCell<ListenerWorld>) {
    world.borrow_mut().reserve_port();
}

#[cfg(unix)]
#[given("a stale Unix socket file exists")]
fn given_stale_socket(world: &RefCell<ListenerWorld>) {
    world.borrow_mut().leave_stale_socket();
}

#[cfg(unix)]
#[given("a Unix socket listener is running on it")]
fn given_unix_listener(world: &RefCell<ListenerWorld>) {
    world.borrow_mut().start();
    assert_started(world);
}

#[when("the listener starts on the same port")]
fn when_listener_restarts(world: &RefCell<ListenerWorld>) {
    world.borrow_mut().start();
}

#[when("{count} client connects")]
fn when_one_client_connects(world: &RefCell<ListenerWorld>, count: usize) {
    connect_clients(world, count);
}

#[when("{count} clients connect")]
fn when_clients_connect(world: &RefCell<ListenerWorld>, count: usize) {
    connect_clients(world, count);
}

#[then("the listener records {count} connection")]
fn then_records_singular(world: &RefCell<ListenerWorld>, count: usize) {
    assert_records(world, count);
}

#[then("the listener records {count} connections")]
fn then_records_plural(world: &RefCell<ListenerWorld>, count: usize) {
    assert_records(world, count);
}

#[then("starting the listener fails")]
fn then_start_fails(world: &RefCell<ListenerWorld>) {
    assert!(
        world.borrow().start_error.is_some(),
        "expected the listener to fail to start"
    );
}

fn assert_started(world: &RefCell<ListenerWorld>) {
    let world = world.borrow();
    assert!(
        world.start_error.is_none(),
        "listener start failed: {:?}",
        world.start_error
    );
}

fn connect_clients(world: &RefCell<ListenerWorld>, count: usize) {
    let endpoint = world.borrow().endpoint.clone();
    for _ in 0..count {
        connect(&endpoint).expect("connect client");
    }
}

fn assert_records(world: &RefCell<ListenerWorld>, count: usize) {
    let world = world.borrow();
    assert!(
        world.accepted.wait_for(count),
        "expected {count} connections, got {}",
        world.accepted.accepted()
    );
}

#[scenario(
    path = "tests/features/socket_listener.feature",
    name = "A TCP listener accepts a connection"
)]
fn tcp_single_connection(world: RefCell<ListenerWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/socket_listener.feature",
    name = "A TCP listener accepts several connections"
)]
fn tcp_several_connections(world: RefCell<ListenerWorld>) {
    drop(world);
}

#[cfg(unix)]
#[scenario(
    path = "tests/features/socket_listener.feature",
    name = "A Unix listener replaces a stale socket file"
)]
fn unix_stale_socket(world: RefCell<ListenerWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/socket_listener.feature",
    name = "Binding an occupied TCP port fails"
)]
fn occupied_port(world: RefCell<ListenerWorld>) {
    drop(world);
}
