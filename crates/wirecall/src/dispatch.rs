//! Command registry mapping command identifiers to typed handlers.
//!
//! Handlers have the fixed shape `(context, argument, &mut reply) ->
//! Result<(), E>`. Registration erases the argument and reply types behind a
//! closure that decodes the request body and, once scheduled, runs the
//! handler and encodes its reply.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::codec::{Encoding, Payload, decode_body};
use crate::errors::{BoxError, CodecError, ErrorCode};

const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::server");

/// Per-call information handed to handlers.
#[derive(Debug)]
pub struct CallContext<S> {
    state: Arc<S>,
    command: u32,
    sequence: u32,
}

impl<S> CallContext<S> {
    pub(crate) const fn new(state: Arc<S>, command: u32, sequence: u32) -> Self {
        Self {
            state,
            command,
            sequence,
        }
    }

    /// Service state shared by every call on the server.
    #[must_use]
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Command being served.
    #[must_use]
    pub const fn command(&self) -> u32 {
        self.command
    }

    /// Sequence number chosen by the caller.
    #[must_use]
    pub const fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Result of [`crate::Server::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The command had no handler before.
    Added,
    /// An earlier handler for the command was replaced.
    Replaced,
}

/// Encoded reply on success, error code otherwise.
pub(crate) type Outcome = Result<Option<Payload>, ErrorCode>;

/// Decoded call ready to run on any thread.
pub(crate) type Invocation<S> = Box<dyn FnOnce(&CallContext<S>) -> Outcome + Send>;

type Entry<S> =
    Arc<dyn Fn(Option<Payload>, Encoding) -> Result<Invocation<S>, CodecError> + Send + Sync>;

/// Registered handlers keyed by command identifier.
pub(crate) struct DispatchTable<S> {
    entries: HashMap<u32, Entry<S>>,
}

impl<S: Send + Sync + 'static> DispatchTable<S> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn insert<A, R, E, F>(&mut self, command: u32, handler: F) -> Registration
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + 'static,
        E: Into<BoxError> + 'static,
        F: Fn(&CallContext<S>, A, &mut R) -> Result<(), E> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let entry: Entry<S> = Arc::new(move |body: Option<Payload>, encoding: Encoding| {
            let argument: A = decode_body(body.as_ref())?;
            let handler = Arc::clone(&handler);
            let invocation: Invocation<S> = Box::new(move |context: &CallContext<S>| {
                invoke::<S, A, R, E, F>(&handler, context, argument, encoding)
            });
            Ok(invocation)
        });
        match self.entries.insert(command, entry) {
            Some(_) => Registration::Replaced,
            None => Registration::Added,
        }
    }

    /// Decodes `body` for `command`.
    ///
    /// Returns `None` for unregistered commands.
    pub(crate) fn prepare(
        &self,
        command: u32,
        body: Option<Payload>,
        encoding: Encoding,
    ) -> Option<Result<Invocation<S>, CodecError>> {
        self.entries.get(&command).map(|entry| entry(body, encoding))
    }

    pub(crate) fn contains(&self, command: u32) -> bool {
        self.entries.contains_key(&command)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn invoke<S, A, R, E, F>(
    handler: &F,
    context: &CallContext<S>,
    argument: A,
    encoding: Encoding,
) -> Outcome
where
    R: Serialize + Default,
    E: Into<BoxError>,
    F: Fn(&CallContext<S>, A, &mut R) -> Result<(), E>,
{
    let mut reply = R::default();
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler(context, argument, &mut reply)));
    match result {
        Ok(Ok(())) => encoding.encode(&reply).map(Some).map_err(|error| {
            warn!(
                target: DISPATCH_TARGET,
                command = context.command(),
                sequence = context.sequence(),
                error = %error,
                "failed to encode reply"
            );
            ErrorCode::FAILURE
        }),
        Ok(Err(error)) => Err(ErrorCode::from_handler_error(&error.into())),
        Err(_) => {
            warn!(
                target: DISPATCH_TARGET,
                command = context.command(),
                sequence = context.sequence(),
                "handler panicked"
            );
            Err(ErrorCode::FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, Serialize)]
    struct Args {
        a: u64,
        b: u64,
    }

    #[fixture]
    fn table() -> DispatchTable<()> {
        let mut table = DispatchTable::new();
        table.insert(100, |_: &CallContext<()>, args: Args, reply: &mut u64| {
            *reply = args.a + args.b;
            Ok::<(), ErrorCode>(())
        });
        table.insert(101, |_: &CallContext<()>, _: (), _: &mut ()| {
            Err(ErrorCode(777))
        });
        table.insert(102, |_: &CallContext<()>, _: (), _: &mut ()| -> Result<(), BoxError> {
            panic!("handler bug")
        });
        table
    }

    fn run(table: &DispatchTable<()>, command: u32, body: Option<Payload>) -> Outcome {
        let invocation = table
            .prepare(command, body, Encoding::Json)
            .expect("registered")
            .expect("decoded");
        invocation(&CallContext::new(Arc::new(()), command, 1))
    }

    #[rstest]
    fn replies_are_encoded_with_the_request_encoding(table: DispatchTable<()>) {
        let body = Encoding::Json.encode(&Args { a: 100, b: 200 }).expect("encode");
        let reply = run(&table, 100, Some(body)).expect("success").expect("reply");
        assert_eq!(reply.decode::<u64>().expect("decode"), 300);
    }

    #[rstest]
    fn handler_codes_pass_through(table: DispatchTable<()>) {
        assert_eq!(run(&table, 101, None), Err(ErrorCode(777)));
    }

    #[rstest]
    fn panics_become_failures(table: DispatchTable<()>) {
        assert_eq!(run(&table, 102, None), Err(ErrorCode::FAILURE));
    }

    #[rstest]
    fn unknown_commands_have_no_entry(table: DispatchTable<()>) {
        assert!(table.prepare(999, None, Encoding::Json).is_none());
        assert!(!table.contains(999));
    }

    #[rstest]
    fn missing_arguments_fail_before_the_handler_runs(table: DispatchTable<()>) {
        let prepared = table.prepare(100, None, Encoding::Json).expect("registered");
        assert!(matches!(prepared, Err(CodecError::MissingParams)));
    }

    #[rstest]
    fn reregistration_replaces_the_handler(mut table: DispatchTable<()>) {
        let outcome = table.insert(100, |_: &CallContext<()>, _: Args, reply: &mut u64| {
            *reply = 1;
            Ok::<(), ErrorCode>(())
        });
        assert_eq!(outcome, Registration::Replaced);
        assert_eq!(table.len(), 3);

        let body = Encoding::Json.encode(&Args { a: 100, b: 200 }).expect("encode");
        let reply = run(&table, 100, Some(body)).expect("success").expect("reply");
        assert_eq!(reply.decode::<u64>().expect("decode"), 1);
    }

    #[test]
    fn handlers_see_their_call_context() {
        let mut table = DispatchTable::<String>::new();
        table.insert(7, |context: &CallContext<String>, _: (), reply: &mut String| {
            *reply = format!("{}:{}:{}", context.state(), context.command(), context.sequence());
            Ok::<(), ErrorCode>(())
        });

        let invocation = table
            .prepare(7, None, Encoding::Json)
            .expect("registered")
            .expect("decoded");
        let reply = invocation(&CallContext::new(Arc::new("svc".to_owned()), 7, 42))
            .expect("success")
            .expect("reply");
        assert_eq!(reply.decode::<String>().expect("decode"), "svc:7:42");
    }
}
