//! Error types shared by the server, client, and codecs.

use std::error::Error as StdError;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use wirecall_config::SocketParseError;

/// Boxed error accepted from handlers.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Numeric status carried in every response header.
///
/// Zero is success. Application handlers return any other value verbatim; the
/// top two values of the range are reserved for the runtime itself.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Error,
)]
#[serde(transparent)]
#[error("{0}")]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// Successful completion.
    pub const NONE: Self = Self(0);
    /// The request named an unknown command or its arguments could not be
    /// decoded.
    pub const UNKNOWN_REQUEST: Self = Self(u32::MAX);
    /// The handler failed without a numeric code, panicked, or produced a
    /// reply that could not be encoded.
    pub const FAILURE: Self = Self(u32::MAX - 1);

    /// Returns `true` for the success code.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` when the code is one of the runtime's reserved values.
    #[must_use]
    pub const fn is_reserved(self) -> bool {
        self.0 == Self::UNKNOWN_REQUEST.0 || self.0 == Self::FAILURE.0
    }

    /// Extracts the code a handler error carries.
    ///
    /// The error and its `source()` chain are searched for an [`ErrorCode`];
    /// anything else, including a zero code, maps to [`ErrorCode::FAILURE`].
    #[must_use]
    pub fn from_handler_error(error: &BoxError) -> Self {
        let mut current: Option<&(dyn StdError + 'static)> = Some(&**error);
        while let Some(candidate) = current {
            if let Some(code) = candidate.downcast_ref::<Self>() {
                if code.is_success() {
                    return Self::FAILURE;
                }
                return *code;
            }
            current = candidate.source();
        }
        Self::FAILURE
    }
}

impl From<u32> for ErrorCode {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Errors raised while framing requests and responses.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The peer closed the stream cleanly between frames.
    #[error("end of stream")]
    EndOfStream,
    /// The underlying transport failed.
    #[error("transport error: {source}")]
    Io {
        /// Source I/O error.
        #[source]
        source: io::Error,
    },
    /// A frame could not be parsed; the stream is no longer aligned.
    #[error("malformed frame: {message}")]
    Malformed {
        /// Parser diagnostic.
        message: String,
    },
    /// A request required parameters but carried none.
    #[error("request carried no parameters")]
    MissingParams,
    /// A payload could not be decoded into the requested type.
    #[error("failed to decode payload: {message}")]
    Decode {
        /// Decoder diagnostic.
        message: String,
    },
    /// A value could not be encoded.
    #[error("failed to encode payload: {message}")]
    Encode {
        /// Encoder diagnostic.
        message: String,
    },
    /// The codec has already been closed.
    #[error("codec is closed")]
    Closed,
}

impl CodecError {
    /// Returns `true` when the stream cannot continue after this error.
    ///
    /// Payload decoding failures leave the framing intact, so a server may
    /// answer the offending request and keep reading.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::MissingParams | Self::Decode { .. })
    }

    pub(crate) fn decode(error: impl std::fmt::Display) -> Self {
        Self::Decode {
            message: error.to_string(),
        }
    }

    pub(crate) fn encode(error: impl std::fmt::Display) -> Self {
        Self::Encode {
            message: error.to_string(),
        }
    }

    pub(crate) fn malformed(error: impl std::fmt::Display) -> Self {
        Self::Malformed {
            message: error.to_string(),
        }
    }
}

impl From<io::Error> for CodecError {
    fn from(source: io::Error) -> Self {
        Self::Io { source }
    }
}

/// Errors returned to callers by the client.
#[derive(Debug, Error)]
pub enum CallError {
    /// The server answered with a nonzero error code.
    #[error("{0}")]
    Remote(ErrorCode),
    /// The call's deadline passed before a response arrived.
    #[error("call timed out")]
    Timeout,
    /// The client was closed, or its connection failed, before completion.
    #[error("client is shut down")]
    Shutdown,
    /// The request or reply could not be framed or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CallError {
    /// Returns the remote error code, if the server produced one.
    #[must_use]
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Remote(code) => Some(*code),
            _ => None,
        }
    }
}

/// Errors raised while establishing a client connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The network name or address was not usable.
    #[error("invalid address: {source}")]
    Address {
        /// Parse failure.
        #[source]
        source: SocketParseError,
    },
    /// Host name resolution failed.
    #[error("failed to resolve {endpoint}: {source}")]
    Resolve {
        /// Endpoint being dialled.
        endpoint: String,
        /// Resolver error.
        #[source]
        source: io::Error,
    },
    /// The connection attempt failed.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        /// Endpoint being dialled.
        endpoint: String,
        /// Socket error.
        #[source]
        source: io::Error,
    },
    /// Unix domain sockets are not available on this platform.
    #[cfg(not(unix))]
    #[error("unix sockets are unsupported for endpoint {endpoint}")]
    UnsupportedUnix {
        /// Endpoint being dialled.
        endpoint: String,
    },
    /// The connected stream could not be wrapped in a codec.
    #[error("failed to prepare codec: {source}")]
    Codec {
        /// Codec construction failure.
        #[source]
        source: CodecError,
    },
    /// A client worker thread could not be started.
    #[error("failed to spawn client thread: {source}")]
    Spawn {
        /// Thread creation failure.
        #[source]
        source: io::Error,
    },
}
