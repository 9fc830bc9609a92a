//! RPC client over a single connection.
//!
//! Requests are written under a send lock; one receive thread matches
//! responses to outstanding calls by sequence number and one deadline thread
//! expires timed calls. Expiry is logical: the call is removed from the
//! pending table and a late response for it is discarded.

mod pending;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use wirecall_config::{CodecKind, Config, SocketEndpoint};

use self::pending::{Completion, PendingTable};
use crate::codec::{
    BinaryClientCodec, ClientCodec, Encoding, JsonClientCodec, RequestWriter, ResponseReader,
    decode_body,
};
use crate::errors::{CallError, CodecError, ConnectError};
use crate::header::{RequestHeader, ResponseHeader};
use crate::transport::connect;

const CLIENT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::client");

/// Completed call delivered by [`Client::go`].
#[derive(Debug)]
pub struct Call<R> {
    /// Command that was invoked.
    pub command: u32,
    /// Sequence number the call used, or 0 when it never reached the wire.
    pub sequence: u32,
    /// Decoded reply or the reason the call failed.
    pub result: Result<R, CallError>,
}

struct Shared {
    writer: Mutex<Box<dyn RequestWriter>>,
    pending: PendingTable,
    encoding: Encoding,
}

impl Shared {
    /// Closes the connection and fails every outstanding call.
    fn shutdown(&self) -> Result<(), CodecError> {
        let closed = self
            .writer
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .close();
        let abandoned = self.pending.close();
        if !abandoned.is_empty() {
            debug!(
                target: CLIENT_TARGET,
                calls = abandoned.len(),
                "failing outstanding calls on shutdown"
            );
        }
        for (sequence, call) in abandoned {
            call.finish(sequence, Err(CallError::Shutdown));
        }
        closed
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Deadline {
    at: Instant,
    sequence: u32,
    ticket: u64,
}

/// Connection to an RPC server.
///
/// Calls may be issued concurrently from any number of threads through a
/// shared reference. Dropping the client closes it.
pub struct Client {
    shared: Arc<Shared>,
    deadlines: Sender<Deadline>,
    default_timeout: Option<Duration>,
}

impl fmt::Debug for Client {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Client")
            .field("encoding", &self.shared.encoding)
            .field("pending", &self.shared.pending.len())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connects to `address` on `network` (`tcp`, `tcp4`, `tcp6` or `unix`)
    /// using the binary codec.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] when the address is invalid or the
    /// connection cannot be established.
    pub fn dial(network: &str, address: &str) -> Result<Self, ConnectError> {
        let endpoint = SocketEndpoint::from_network(network, address)
            .map_err(|source| ConnectError::Address { source })?;
        Self::dial_endpoint(&endpoint)
    }

    /// Connects to `endpoint` using the binary codec.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] when the connection cannot be established.
    pub fn dial_endpoint(endpoint: &SocketEndpoint) -> Result<Self, ConnectError> {
        Self::dial_with(endpoint, CodecKind::Binary)
    }

    /// Connects to `endpoint` using the requested codec.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] when the connection cannot be established.
    pub fn dial_with(endpoint: &SocketEndpoint, codec: CodecKind) -> Result<Self, ConnectError> {
        let stream = connect(endpoint)?;
        debug!(target: CLIENT_TARGET, %endpoint, %codec, "connected");
        match codec {
            CodecKind::Binary => Self::with_codec(
                BinaryClientCodec::new(stream).map_err(|source| ConnectError::Codec { source })?,
            ),
            CodecKind::Json => Self::with_codec(
                JsonClientCodec::new(stream).map_err(|source| ConnectError::Codec { source })?,
            ),
        }
    }

    /// Connects using the endpoint, codec and default deadline in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] when the connection cannot be established.
    pub fn from_config(config: &Config) -> Result<Self, ConnectError> {
        let client = Self::dial_with(config.endpoint(), config.codec())?;
        Ok(client.with_default_timeout(config.call_timeout()))
    }

    /// Starts a client on an already connected codec.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Spawn`] when the worker threads cannot be
    /// started.
    pub fn with_codec<C: ClientCodec>(codec: C) -> Result<Self, ConnectError> {
        let encoding = codec.encoding();
        let (reader, writer) = codec.split();
        let shared = Arc::new(Shared {
            writer: Mutex::new(Box::new(writer)),
            pending: PendingTable::new(),
            encoding,
        });

        let receiving = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("wirecall-client-recv".to_owned())
            .spawn(move || receive(reader, &receiving));
        if let Err(source) = spawned {
            return Err(spawn_failed(&shared, source));
        }

        let (deadlines, expiring) = crossbeam_channel::unbounded();
        let expiring_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("wirecall-client-deadline".to_owned())
            .spawn(move || expire(&expiring, &expiring_shared));
        if let Err(source) = spawned {
            return Err(spawn_failed(&shared, source));
        }

        Ok(Self {
            shared,
            deadlines,
            default_timeout: None,
        })
    }

    /// Sets the deadline applied by [`Client::call_default`].
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Invokes `command` and waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Remote`] with the server's error code,
    /// [`CallError::Shutdown`] when the connection closed first, or
    /// [`CallError::Codec`] when the argument or reply could not be
    /// encoded or decoded.
    pub fn call<A, R>(&self, command: u32, argument: &A, reply: &mut R) -> Result<(), CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.wait(command, argument, reply, None)
    }

    /// Like [`Client::call`], failing with [`CallError::Timeout`] when no
    /// reply arrives within `timeout`.
    ///
    /// # Errors
    ///
    /// As [`Client::call`], plus [`CallError::Timeout`].
    pub fn call_with_timeout<A, R>(
        &self,
        command: u32,
        argument: &A,
        reply: &mut R,
        timeout: Duration,
    ) -> Result<(), CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.wait(command, argument, reply, Some(timeout))
    }

    /// Like [`Client::call`], applying the client's default deadline if one
    /// is configured.
    ///
    /// # Errors
    ///
    /// As [`Client::call_with_timeout`].
    pub fn call_default<A, R>(
        &self,
        command: u32,
        argument: &A,
        reply: &mut R,
    ) -> Result<(), CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.wait(command, argument, reply, self.default_timeout)
    }

    /// Issues `command` without waiting and returns its sequence number.
    ///
    /// The completed [`Call`] is sent on `done`. Delivery never blocks: if
    /// `done` is full the result is dropped with a warning, so the channel
    /// needs room for every call routed to it.
    pub fn go<A, R>(&self, command: u32, argument: &A, done: Sender<Call<R>>) -> u32
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.start(command, argument, None, done)
    }

    /// Like [`Client::go`], delivering a [`CallError::Timeout`] result if no
    /// reply arrives within `timeout`.
    pub fn go_with_timeout<A, R>(
        &self,
        command: u32,
        argument: &A,
        timeout: Duration,
        done: Sender<Call<R>>,
    ) -> u32
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.start(command, argument, Some(timeout), done)
    }

    /// Closes the connection and fails every outstanding call with
    /// [`CallError::Shutdown`]. Repeated calls succeed without effect.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Codec`] when the transport fails to shut down.
    pub fn close(&self) -> Result<(), CallError> {
        self.shared.shutdown().map_err(CallError::from)
    }

    fn wait<A, R>(
        &self,
        command: u32,
        argument: &A,
        reply: &mut R,
        timeout: Option<Duration>,
    ) -> Result<(), CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let (done, completed) = crossbeam_channel::bounded(1);
        self.start(command, argument, timeout, done);
        let call: Call<R> = completed.recv().map_err(|_| CallError::Shutdown)?;
        *reply = call.result?;
        Ok(())
    }

    fn start<A, R>(
        &self,
        command: u32,
        argument: &A,
        timeout: Option<Duration>,
        done: Sender<Call<R>>,
    ) -> u32
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let complete: Completion = Box::new(move |sequence, result| {
            let result = result.and_then(|body| decode_body(body.as_ref()).map_err(CallError::from));
            deliver(
                &done,
                Call {
                    command,
                    sequence,
                    result,
                },
            );
        });

        let body = match self.shared.encoding.encode_argument(argument) {
            Ok(body) => body,
            Err(error) => {
                complete(0, Err(error.into()));
                return 0;
            }
        };
        let (sequence, ticket) = match self.shared.pending.insert(command, complete) {
            Ok(slot) => slot,
            Err(call) => {
                call.finish(0, Err(CallError::Shutdown));
                return 0;
            }
        };
        if let Some(timeout) = timeout {
            let deadline = Deadline {
                at: Instant::now() + timeout,
                sequence,
                ticket,
            };
            if self.deadlines.send(deadline).is_err() {
                warn!(
                    target: CLIENT_TARGET,
                    sequence,
                    "deadline thread has stopped; call will not time out"
                );
            }
        }

        let header = RequestHeader { command, sequence };
        let written = self
            .shared
            .writer
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .write_request(&header, body.as_ref());
        if let Err(error) = written {
            let Some(call) = self.shared.pending.remove_if(sequence, ticket) else {
                return sequence;
            };
            match error {
                CodecError::Closed => call.finish(sequence, Err(CallError::Shutdown)),
                error => {
                    warn!(
                        target: CLIENT_TARGET,
                        command,
                        sequence,
                        error = %error,
                        "failed to write request; closing connection"
                    );
                    call.finish(sequence, Err(error.into()));
                    if let Err(close_error) = self.shared.shutdown() {
                        debug!(
                            target: CLIENT_TARGET,
                            error = %close_error,
                            "failed to close connection"
                        );
                    }
                }
            }
        }
        sequence
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(error) = self.shared.shutdown() {
            debug!(
                target: CLIENT_TARGET,
                error = %error,
                "failed to close connection on drop"
            );
        }
    }
}

/// Closes a half-built client whose worker thread could not start.
fn spawn_failed(shared: &Shared, source: io::Error) -> ConnectError {
    if let Err(error) = shared.shutdown() {
        debug!(
            target: CLIENT_TARGET,
            error = %error,
            "failed to close connection after spawn failure"
        );
    }
    ConnectError::Spawn { source }
}

fn deliver<R>(done: &Sender<Call<R>>, call: Call<R>) {
    match done.try_send(call) {
        Ok(()) => {}
        Err(TrySendError::Full(call)) => warn!(
            target: CLIENT_TARGET,
            command = call.command,
            sequence = call.sequence,
            "completion channel full; dropping call result"
        ),
        Err(TrySendError::Disconnected(call)) => debug!(
            target: CLIENT_TARGET,
            command = call.command,
            sequence = call.sequence,
            "caller stopped waiting for call result"
        ),
    }
}

fn receive<R: ResponseReader>(mut reader: R, shared: &Shared) {
    let mut header = ResponseHeader::default();
    loop {
        match reader.read_response_header(&mut header) {
            Ok(()) => {}
            Err(CodecError::EndOfStream) => {
                debug!(target: CLIENT_TARGET, "server closed connection");
                break;
            }
            Err(error) => {
                if !shared.pending.is_closed() {
                    warn!(
                        target: CLIENT_TARGET,
                        error = %error,
                        "failed to read response header"
                    );
                }
                break;
            }
        }
        let body = match reader.read_response_body() {
            Ok(body) => body,
            Err(error) => {
                warn!(
                    target: CLIENT_TARGET,
                    sequence = header.sequence,
                    error = %error,
                    "failed to read response body"
                );
                break;
            }
        };

        let Some(call) = shared.pending.remove(header.sequence) else {
            debug!(
                target: CLIENT_TARGET,
                command = header.command,
                sequence = header.sequence,
                "discarding response with no pending call"
            );
            continue;
        };
        let result = if header.error.is_success() {
            Ok(body)
        } else {
            Err(CallError::Remote(header.error))
        };
        call.finish(header.sequence, result);
    }

    if let Err(error) = shared.shutdown() {
        debug!(
            target: CLIENT_TARGET,
            error = %error,
            "failed to close connection"
        );
    }
}

fn expire(requests: &Receiver<Deadline>, shared: &Shared) {
    let mut deadlines = BinaryHeap::new();
    loop {
        let next = match deadlines.peek() {
            Some(Reverse(Deadline { at, .. })) => requests.recv_deadline(*at),
            None => requests.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match next {
            Ok(deadline) => deadlines.push(Reverse(deadline)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        while deadlines
            .peek()
            .is_some_and(|Reverse(deadline)| deadline.at <= now)
        {
            let Some(Reverse(deadline)) = deadlines.pop() else {
                break;
            };
            if let Some(call) = shared.pending.remove_if(deadline.sequence, deadline.ticket) {
                debug!(
                    target: CLIENT_TARGET,
                    command = call.command(),
                    sequence = deadline.sequence,
                    "call timed out"
                );
                call.finish(deadline.sequence, Err(CallError::Timeout));
            }
        }
    }
}
