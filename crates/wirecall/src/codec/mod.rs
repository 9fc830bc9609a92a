//! Wire codecs framing requests and responses over a byte stream.
//!
//! A codec owns one connection. Reads and writes happen on different threads,
//! so each codec splits into a reader half and a writer half that share the
//! underlying socket through [`Transport::try_clone`]. Bodies travel as
//! [`Payload`] values tagged with the [`Encoding`] that produced them; the
//! dispatch layer decodes typed arguments from them without knowing which
//! codec is in use.

mod binary;
mod json;

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use bincode::Options;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::CodecError;
use crate::header::{RequestHeader, ResponseHeader};

pub use self::binary::{
    BinaryClientCodec, BinaryCodec, BinaryReader, BinaryServerCodec, BinaryWriter,
};
pub use self::json::{
    JsonClientCodec, JsonRequestReader, JsonResponseReader, JsonServerCodec, JsonWriter,
};

const CODEC_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::codec");

/// Largest frame either codec accepts, guarding against corrupt length
/// prefixes.
pub const MAX_FRAME_BYTES: u64 = 16 * 1024 * 1024;

/// Serialisation format of a [`Payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Fixed-width little-endian `bincode`.
    Binary,
    /// UTF-8 JSON text.
    Json,
}

impl Encoding {
    /// Serialises `value` into a payload of this encoding.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] when the value cannot be serialised.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Payload, CodecError> {
        let bytes = match self {
            Self::Binary => bincode_options()
                .serialize(value)
                .map_err(CodecError::encode)?,
            Self::Json => serde_json::to_vec(value).map_err(CodecError::encode)?,
        };
        Ok(Payload {
            encoding: self,
            bytes,
        })
    }

    /// Serialises a call argument.
    ///
    /// JSON `null` becomes an absent body, matching the JSON wire format's
    /// treatment of calls without parameters.
    pub(crate) fn encode_argument<T: Serialize + ?Sized>(
        self,
        value: &T,
    ) -> Result<Option<Payload>, CodecError> {
        let payload = self.encode(value)?;
        if self == Self::Json && payload.bytes == b"null" {
            return Ok(None);
        }
        Ok(Some(payload))
    }
}

/// Encoded request parameters or response result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    encoding: Encoding,
    bytes: Vec<u8>,
}

impl Payload {
    /// Wraps bytes already in `encoding`.
    #[must_use]
    pub const fn new(encoding: Encoding, bytes: Vec<u8>) -> Self {
        Self { encoding, bytes }
    }

    /// Encoding of the bytes.
    #[must_use]
    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Raw encoded bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Deserialises the payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] when the bytes do not describe a `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match self.encoding {
            Encoding::Binary => bincode_options()
                .deserialize(&self.bytes)
                .map_err(CodecError::decode),
            Encoding::Json => serde_json::from_slice(&self.bytes).map_err(CodecError::decode),
        }
    }
}

/// Decodes an optional body into `T`.
///
/// An absent body is accepted for types that deserialise from nothing, such
/// as `()` and `Option<_>`; any other type fails with
/// [`CodecError::MissingParams`].
pub(crate) fn decode_body<T: DeserializeOwned>(body: Option<&Payload>) -> Result<T, CodecError> {
    match body {
        Some(payload) => payload.decode(),
        None => serde_json::from_value(serde_json::Value::Null)
            .map_err(|_| CodecError::MissingParams),
    }
}

pub(crate) fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_FRAME_BYTES)
}

/// Byte stream a codec can own.
pub trait Transport: Read + Write + Send + Sized + 'static {
    /// Opens a second handle on the same connection.
    ///
    /// # Errors
    ///
    /// Returns the operating system error when the handle cannot be cloned.
    fn try_clone(&self) -> io::Result<Self>;

    /// Shuts down both directions of the connection.
    ///
    /// # Errors
    ///
    /// Returns the operating system error when shutdown fails.
    fn shutdown(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        Self::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        Self::shutdown(self, Shutdown::Both)
    }
}

#[cfg(unix)]
impl Transport for UnixStream {
    fn try_clone(&self) -> io::Result<Self> {
        Self::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        Self::shutdown(self, Shutdown::Both)
    }
}

/// Shuts a transport down, treating an already disconnected peer as success.
pub(crate) fn shutdown_quietly<T: Transport>(stream: &T) -> Result<(), CodecError> {
    match stream.shutdown() {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(()),
        Err(error) => Err(CodecError::from(error)),
    }
}

/// Server-side reader half.
pub trait RequestReader: Send + 'static {
    /// Blocks until the next request header has been read into `header`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::EndOfStream`] when the peer closed the stream
    /// between frames, and another variant when the header is unreadable.
    fn read_request_header(&mut self, header: &mut RequestHeader) -> Result<(), CodecError>;

    /// Reads the body belonging to the last header, or `None` when the
    /// request carried no parameters.
    ///
    /// # Errors
    ///
    /// Returns a recoverable [`CodecError`] when the parameters are present
    /// but unusable, and a fatal one when the stream broke.
    fn read_request_body(&mut self) -> Result<Option<Payload>, CodecError>;
}

/// Server-side writer half.
pub trait ResponseWriter: Send + 'static {
    /// Encodes and flushes a complete response frame.
    ///
    /// # Errors
    ///
    /// Any error leaves the connection unusable.
    fn write_response(
        &mut self,
        header: &ResponseHeader,
        body: Option<&Payload>,
    ) -> Result<(), CodecError>;

    /// Closes the connection. Repeated calls succeed without effect.
    ///
    /// # Errors
    ///
    /// Returns the transport error raised while shutting down.
    fn close(&mut self) -> Result<(), CodecError>;
}

/// Codec used by a server connection.
pub trait ServerCodec: Send + 'static {
    /// Reader half.
    type Reader: RequestReader;
    /// Writer half.
    type Writer: ResponseWriter;

    /// Encoding of the payloads this codec produces.
    fn encoding(&self) -> Encoding;

    /// Separates the codec into halves usable from different threads.
    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Client-side writer half.
pub trait RequestWriter: Send + 'static {
    /// Encodes and flushes a complete request frame.
    ///
    /// # Errors
    ///
    /// Any error leaves the connection unusable.
    fn write_request(
        &mut self,
        header: &RequestHeader,
        body: Option<&Payload>,
    ) -> Result<(), CodecError>;

    /// Closes the connection. Repeated calls succeed without effect.
    ///
    /// # Errors
    ///
    /// Returns the transport error raised while shutting down.
    fn close(&mut self) -> Result<(), CodecError>;
}

/// Client-side reader half.
pub trait ResponseReader: Send + 'static {
    /// Blocks until the next response header has been read into `header`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::EndOfStream`] when the peer closed the stream
    /// between frames, and another variant when the header is unreadable.
    fn read_response_header(&mut self, header: &mut ResponseHeader) -> Result<(), CodecError>;

    /// Reads the body belonging to the last header.
    ///
    /// # Errors
    ///
    /// Any error leaves the connection unusable.
    fn read_response_body(&mut self) -> Result<Option<Payload>, CodecError>;
}

/// Codec used by a client connection.
pub trait ClientCodec: Send + 'static {
    /// Reader half.
    type Reader: ResponseReader;
    /// Writer half.
    type Writer: RequestWriter;

    /// Encoding of the payloads this codec produces.
    fn encoding(&self) -> Encoding;

    /// Separates the codec into halves usable from different threads.
    fn split(self) -> (Self::Reader, Self::Writer);
}
