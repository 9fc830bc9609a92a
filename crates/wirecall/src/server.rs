//! Per-connection request loop.
//!
//! A connection is served by one reader loop. Each request header names a
//! command; the matching handler decodes the body and is scheduled off the
//! read loop, so slow handlers never delay reading the next request. Replies
//! may therefore leave in any order, each written whole under the
//! connection's send lock.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::Sender;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use wirecall_config::{CodecKind, SocketEndpoint};

use crate::codec::{
    BinaryCodec, Encoding, JsonServerCodec, RequestReader, ResponseWriter, ServerCodec, Transport,
};
use crate::dispatch::{CallContext, DispatchTable, Invocation, Outcome, Registration};
use crate::errors::{BoxError, CodecError, ErrorCode};
use crate::free_list::{FreeList, Pooled};
use crate::header::{RequestHeader, ResponseHeader};
use crate::transport::{
    ConnectionHandler, ConnectionStream, ListenerError, ListenerHandle, SocketListener,
};

const SERVER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::server");

/// RPC server holding the command registry and header pools.
///
/// `S` is service state shared with every handler through
/// [`CallContext::state`].
pub struct Server<S = ()> {
    dispatch: DispatchTable<S>,
    requests: Arc<FreeList<RequestHeader>>,
    responses: Arc<FreeList<ResponseHeader>>,
}

impl<S> fmt::Debug for Server<S> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Server")
            .field("idle_requests", &self.requests.idle())
            .field("idle_responses", &self.responses.idle())
            .finish_non_exhaustive()
    }
}

impl<S: Send + Sync + 'static> Default for Server<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Send + Sync + 'static> Server<S> {
    /// Creates a server with no registered commands.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dispatch: DispatchTable::new(),
            requests: Arc::new(FreeList::new()),
            responses: Arc::new(FreeList::new()),
        }
    }

    /// Registers `handler` for `command`, replacing any earlier handler.
    ///
    /// The handler receives the call context, the decoded argument, and a
    /// default-initialised reply to fill in. Returning an error whose source
    /// chain contains an [`ErrorCode`] sends that code; any other error sends
    /// [`ErrorCode::FAILURE`].
    pub fn register<A, R, E, F>(&mut self, command: u32, handler: F) -> Registration
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + 'static,
        E: Into<BoxError> + 'static,
        F: Fn(&CallContext<S>, A, &mut R) -> Result<(), E> + Send + Sync + 'static,
    {
        let registration = self.dispatch.insert(command, handler);
        if registration == Registration::Replaced {
            debug!(target: SERVER_TARGET, command, "replaced command handler");
        }
        registration
    }

    /// Returns `true` when `command` has a handler.
    #[must_use]
    pub fn handles(&self, command: u32) -> bool {
        self.dispatch.contains(command)
    }

    /// Serves one connection until the peer disconnects or the stream fails,
    /// running each request on its own thread.
    pub fn serve<C: ServerCodec>(&self, state: Arc<S>, codec: C) {
        self.run(state, codec, |call| {
            let spawned = thread::Builder::new()
                .name("wirecall-call".to_owned())
                .spawn(move || call.run());
            if let Err(error) = spawned {
                warn!(
                    target: SERVER_TARGET,
                    error = %error,
                    "failed to spawn handler thread"
                );
            }
        });
    }

    /// Serves `stream` with the binary codec.
    pub fn serve_connection<T: Transport>(&self, state: Arc<S>, stream: T) {
        match BinaryCodec::new(stream) {
            Ok(codec) => self.serve(state, codec),
            Err(error) => warn!(
                target: SERVER_TARGET,
                error = %error,
                "failed to prepare connection"
            ),
        }
    }

    /// Serves one connection, handing decoded calls to `queue` instead of
    /// spawning a thread per request.
    ///
    /// Workers receiving from the queue execute calls with
    /// [`QueuedCall::run`]. If every receiver is gone the call is answered
    /// with [`ErrorCode::FAILURE`].
    pub fn serve_queued<C: ServerCodec>(
        &self,
        state: Arc<S>,
        codec: C,
        queue: &Sender<QueuedCall<S>>,
    ) {
        self.run(state, codec, |call| {
            if let Err(rejected) = queue.send(call) {
                warn!(
                    target: SERVER_TARGET,
                    "call queue disconnected; rejecting request"
                );
                rejected.into_inner().reject(ErrorCode::FAILURE);
            }
        });
    }

    /// Binds `endpoint` and serves every accepted connection with `codec`.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError`] when the endpoint cannot be bound.
    pub fn listen(
        self: Arc<Self>,
        endpoint: &SocketEndpoint,
        state: Arc<S>,
        codec: CodecKind,
    ) -> Result<ListenerHandle, ListenerError> {
        let listener = SocketListener::bind(endpoint)?;
        listener.start(Arc::new(RpcConnectionHandler {
            server: self,
            state,
            codec,
        }))
    }

    fn run<C, F>(&self, state: Arc<S>, codec: C, mut schedule: F)
    where
        C: ServerCodec,
        F: FnMut(QueuedCall<S>),
    {
        let encoding = codec.encoding();
        let (mut reader, writer) = codec.split();
        let writer: Arc<Mutex<dyn ResponseWriter>> = Arc::new(Mutex::new(writer));
        let responder = Responder {
            writer,
            headers: Arc::clone(&self.responses),
        };

        loop {
            let mut request = self.requests.acquire();
            match reader.read_request_header(&mut request) {
                Ok(()) => {}
                Err(CodecError::EndOfStream) => {
                    debug!(target: SERVER_TARGET, "peer closed connection");
                    break;
                }
                Err(error) => {
                    warn!(
                        target: SERVER_TARGET,
                        error = %error,
                        "failed to read request header"
                    );
                    break;
                }
            }

            match self.prepare(&mut reader, &request, encoding) {
                Ok(Some(invocation)) => {
                    let context =
                        CallContext::new(Arc::clone(&state), request.command, request.sequence);
                    schedule(QueuedCall::new(
                        context,
                        invocation,
                        responder.clone(),
                        request,
                    ));
                }
                Ok(None) => {
                    responder.send(
                        request.command,
                        request.sequence,
                        Err(ErrorCode::UNKNOWN_REQUEST),
                    );
                }
                Err(error) => {
                    warn!(
                        target: SERVER_TARGET,
                        command = request.command,
                        sequence = request.sequence,
                        error = %error,
                        "failed to read request body"
                    );
                    break;
                }
            }
        }

        responder.close();
    }

    /// Reads the body for `request` and decodes it for its handler.
    ///
    /// `Ok(None)` means the request must be answered with
    /// [`ErrorCode::UNKNOWN_REQUEST`]; `Err` means the stream is unusable.
    fn prepare<R: RequestReader>(
        &self,
        reader: &mut R,
        request: &RequestHeader,
        encoding: Encoding,
    ) -> Result<Option<Invocation<S>>, CodecError> {
        let body = match reader.read_request_body() {
            Ok(body) => body,
            Err(error) if !error.is_fatal() => {
                debug!(
                    target: SERVER_TARGET,
                    command = request.command,
                    sequence = request.sequence,
                    error = %error,
                    "rejecting request with unusable parameters"
                );
                return Ok(None);
            }
            Err(error) => return Err(error),
        };

        match self.dispatch.prepare(request.command, body, encoding) {
            Some(Ok(invocation)) => Ok(Some(invocation)),
            Some(Err(error)) => {
                debug!(
                    target: SERVER_TARGET,
                    command = request.command,
                    sequence = request.sequence,
                    error = %error,
                    "rejecting request with undecodable arguments"
                );
                Ok(None)
            }
            None => {
                debug!(
                    target: SERVER_TARGET,
                    command = request.command,
                    sequence = request.sequence,
                    "rejecting unknown command"
                );
                Ok(None)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_headers(&self) -> (usize, usize) {
        (self.requests.idle(), self.responses.idle())
    }
}

/// Writes responses for one connection under its send lock.
#[derive(Clone)]
struct Responder {
    writer: Arc<Mutex<dyn ResponseWriter>>,
    headers: Arc<FreeList<ResponseHeader>>,
}

impl Responder {
    fn send(&self, command: u32, sequence: u32, outcome: Outcome) {
        let mut header = self.headers.acquire();
        header.command = command;
        header.sequence = sequence;
        let body = match outcome {
            Ok(body) => body,
            Err(code) => {
                header.error = code;
                None
            }
        };

        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Err(error) = writer.write_response(&header, body.as_ref()) {
            match error {
                CodecError::Closed => debug!(
                    target: SERVER_TARGET,
                    command,
                    sequence,
                    "dropping response for closed connection"
                ),
                other => {
                    warn!(
                        target: SERVER_TARGET,
                        command,
                        sequence,
                        error = %other,
                        "failed to write response; closing connection"
                    );
                    if let Err(close_error) = writer.close() {
                        debug!(
                            target: SERVER_TARGET,
                            error = %close_error,
                            "failed to close connection"
                        );
                    }
                }
            }
        }
    }

    fn close(&self) {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Err(error) = writer.close() {
            debug!(
                target: SERVER_TARGET,
                error = %error,
                "failed to close connection"
            );
        }
    }
}

/// Decoded request waiting to be executed.
///
/// Produced by [`Server::serve_queued`]. Running it invokes the handler and
/// writes the response on the originating connection. A call dropped before
/// it runs is answered with [`ErrorCode::FAILURE`].
pub struct QueuedCall<S> {
    context: CallContext<S>,
    invocation: Option<Invocation<S>>,
    responder: Responder,
    request: Pooled<RequestHeader>,
}

impl<S> fmt::Debug for QueuedCall<S> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("QueuedCall")
            .field("command", &self.request.command)
            .field("sequence", &self.request.sequence)
            .field("pending", &self.invocation.is_some())
            .finish_non_exhaustive()
    }
}

impl<S> QueuedCall<S> {
    fn new(
        context: CallContext<S>,
        invocation: Invocation<S>,
        responder: Responder,
        request: Pooled<RequestHeader>,
    ) -> Self {
        Self {
            context,
            invocation: Some(invocation),
            responder,
            request,
        }
    }

    /// Command being served.
    #[must_use]
    pub const fn command(&self) -> u32 {
        self.context.command()
    }

    /// Sequence number chosen by the caller.
    #[must_use]
    pub const fn sequence(&self) -> u32 {
        self.context.sequence()
    }

    /// Runs the handler and writes its response.
    pub fn run(mut self) {
        if let Some(invocation) = self.invocation.take() {
            let outcome = invocation(&self.context);
            self.answer(outcome);
        }
    }

    /// Answers the call with `code` without running the handler.
    pub fn reject(mut self, code: ErrorCode) {
        if self.invocation.take().is_some() {
            self.answer(Err(code));
        }
    }

    fn answer(&self, outcome: Outcome) {
        self.responder
            .send(self.context.command(), self.context.sequence(), outcome);
    }
}

impl<S> Drop for QueuedCall<S> {
    fn drop(&mut self) {
        if self.invocation.take().is_none() {
            return;
        }
        warn!(
            target: SERVER_TARGET,
            command = self.context.command(),
            sequence = self.context.sequence(),
            "call dropped before running; answering with failure"
        );
        self.answer(Err(ErrorCode::FAILURE));
    }
}

struct RpcConnectionHandler<S> {
    server: Arc<Server<S>>,
    state: Arc<S>,
    codec: CodecKind,
}

impl<S: Send + Sync + 'static> ConnectionHandler for RpcConnectionHandler<S> {
    fn handle(&self, stream: ConnectionStream) {
        let state = Arc::clone(&self.state);
        match self.codec {
            CodecKind::Binary => self.server.serve_connection(state, stream),
            CodecKind::Json => match JsonServerCodec::new(stream) {
                Ok(codec) => self.server.serve(state, codec),
                Err(error) => warn!(
                    target: SERVER_TARGET,
                    error = %error,
                    "failed to prepare connection"
                ),
            },
        }
    }
}
