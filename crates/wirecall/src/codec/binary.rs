//! Binary codec: consecutive `bincode` records.
//!
//! Every frame is a header record followed by a body record. The body record
//! is an `Option<Vec<u8>>` holding the bincode-encoded value, so a reader can
//! skip a body it has no use for without knowing its type.

use std::io::{BufRead, BufReader, BufWriter, Write};

use bincode::{ErrorKind, Options};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    CODEC_TARGET, ClientCodec, Encoding, Payload, RequestReader, RequestWriter, ResponseReader,
    ResponseWriter, ServerCodec, Transport, bincode_options, shutdown_quietly,
};
use crate::errors::CodecError;
use crate::header::{RequestHeader, ResponseHeader};

/// Binary codec over a single connection.
///
/// The same type serves both roles; [`BinaryServerCodec`] and
/// [`BinaryClientCodec`] name it by the side using it.
#[derive(Debug)]
pub struct BinaryCodec<T: Transport> {
    reader: BinaryReader<T>,
    writer: BinaryWriter<T>,
}

/// Binary codec as used by a server connection.
pub type BinaryServerCodec<T> = BinaryCodec<T>;

/// Binary codec as used by a client connection.
pub type BinaryClientCodec<T> = BinaryCodec<T>;

impl<T: Transport> BinaryCodec<T> {
    /// Wraps a connected stream.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Io`] when the stream cannot be cloned for the
    /// reader half.
    pub fn new(stream: T) -> Result<Self, CodecError> {
        let read_half = stream.try_clone()?;
        Ok(Self {
            reader: BinaryReader {
                stream: BufReader::new(read_half),
            },
            writer: BinaryWriter {
                stream: BufWriter::new(stream),
                closed: false,
            },
        })
    }
}

impl<T: Transport> ServerCodec for BinaryCodec<T> {
    type Reader = BinaryReader<T>;
    type Writer = BinaryWriter<T>;

    fn encoding(&self) -> Encoding {
        Encoding::Binary
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        (self.reader, self.writer)
    }
}

impl<T: Transport> ClientCodec for BinaryCodec<T> {
    type Reader = BinaryReader<T>;
    type Writer = BinaryWriter<T>;

    fn encoding(&self) -> Encoding {
        Encoding::Binary
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        (self.reader, self.writer)
    }
}

/// Reader half of a [`BinaryCodec`].
#[derive(Debug)]
pub struct BinaryReader<T> {
    stream: BufReader<T>,
}

impl<T: Transport> BinaryReader<T> {
    fn read_header<H: DeserializeOwned>(&mut self) -> Result<H, CodecError> {
        if self.stream.fill_buf()?.is_empty() {
            return Err(CodecError::EndOfStream);
        }
        bincode_options()
            .deserialize_from(&mut self.stream)
            .map_err(frame_error)
    }

    fn read_body(&mut self) -> Result<Option<Payload>, CodecError> {
        let body: Option<Vec<u8>> = bincode_options()
            .deserialize_from(&mut self.stream)
            .map_err(frame_error)?;
        Ok(body.map(|bytes| Payload::new(Encoding::Binary, bytes)))
    }
}

impl<T: Transport> RequestReader for BinaryReader<T> {
    fn read_request_header(&mut self, header: &mut RequestHeader) -> Result<(), CodecError> {
        *header = self.read_header()?;
        Ok(())
    }

    fn read_request_body(&mut self) -> Result<Option<Payload>, CodecError> {
        self.read_body()
    }
}

impl<T: Transport> ResponseReader for BinaryReader<T> {
    fn read_response_header(&mut self, header: &mut ResponseHeader) -> Result<(), CodecError> {
        *header = self.read_header()?;
        Ok(())
    }

    fn read_response_body(&mut self) -> Result<Option<Payload>, CodecError> {
        self.read_body()
    }
}

/// Writer half of a [`BinaryCodec`].
#[derive(Debug)]
pub struct BinaryWriter<T: Transport> {
    stream: BufWriter<T>,
    closed: bool,
}

impl<T: Transport> BinaryWriter<T> {
    fn write_frame<H: Serialize>(
        &mut self,
        header: &H,
        body: Option<&Payload>,
    ) -> Result<(), CodecError> {
        if self.closed {
            return Err(CodecError::Closed);
        }
        let bytes = body.map(Payload::bytes);
        bincode_options()
            .serialize_into(&mut self.stream, header)
            .map_err(frame_error)?;
        bincode_options()
            .serialize_into(&mut self.stream, &bytes)
            .map_err(frame_error)?;
        self.stream.flush()?;
        Ok(())
    }

    fn close_stream(&mut self) -> Result<(), CodecError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(error) = self.stream.flush() {
            debug!(
                target: CODEC_TARGET,
                error = %error,
                "discarding unflushed bytes on close"
            );
        }
        shutdown_quietly(self.stream.get_ref())
    }
}

impl<T: Transport> ResponseWriter for BinaryWriter<T> {
    fn write_response(
        &mut self,
        header: &ResponseHeader,
        body: Option<&Payload>,
    ) -> Result<(), CodecError> {
        self.write_frame(header, body)
    }

    fn close(&mut self) -> Result<(), CodecError> {
        self.close_stream()
    }
}

impl<T: Transport> RequestWriter for BinaryWriter<T> {
    fn write_request(
        &mut self,
        header: &RequestHeader,
        body: Option<&Payload>,
    ) -> Result<(), CodecError> {
        self.write_frame(header, body)
    }

    fn close(&mut self) -> Result<(), CodecError> {
        self.close_stream()
    }
}

fn frame_error(error: bincode::Error) -> CodecError {
    match *error {
        ErrorKind::Io(source) => CodecError::Io { source },
        other => CodecError::malformed(other),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::net::TcpStream;

    use rstest::{fixture, rstest};

    use super::*;
    use crate::errors::ErrorCode;
    use crate::tests::support::tcp_pair;

    #[fixture]
    fn connected() -> (BinaryCodec<TcpStream>, BinaryCodec<TcpStream>) {
        let (client, server) = tcp_pair();
        (
            BinaryCodec::new(client).expect("client codec"),
            BinaryCodec::new(server).expect("server codec"),
        )
    }

    #[rstest]
    fn requests_arrive_with_their_headers_and_bodies(
        connected: (BinaryCodec<TcpStream>, BinaryCodec<TcpStream>),
    ) {
        let (client, server) = connected;
        let (_client_reader, mut client_writer) = ClientCodec::split(client);
        let (mut server_reader, _server_writer) = ServerCodec::split(server);

        let body = Encoding::Binary.encode(&(100_u64, 200_u64)).expect("encode");
        let sent = RequestHeader {
            command: 100,
            sequence: 9,
        };
        client_writer
            .write_request(&sent, Some(&body))
            .expect("write request");

        let mut received = RequestHeader::default();
        server_reader
            .read_request_header(&mut received)
            .expect("read header");
        assert_eq!(received, sent);
        let payload = server_reader
            .read_request_body()
            .expect("read body")
            .expect("body present");
        assert_eq!(
            payload.decode::<(u64, u64)>().expect("decode"),
            (100, 200)
        );
    }

    #[rstest]
    fn skipped_bodies_keep_the_stream_aligned(
        connected: (BinaryCodec<TcpStream>, BinaryCodec<TcpStream>),
    ) {
        let (client, server) = connected;
        let (_client_reader, mut client_writer) = ClientCodec::split(client);
        let (mut server_reader, _server_writer) = ServerCodec::split(server);

        let large = Encoding::Binary.encode(&vec![7_u32; 512]).expect("encode");
        for (sequence, body) in [(1, Some(&large)), (2, None)] {
            let header = RequestHeader {
                command: 5,
                sequence,
            };
            client_writer
                .write_request(&header, body)
                .expect("write request");
        }

        let mut header = RequestHeader::default();
        server_reader.read_request_header(&mut header).expect("first");
        server_reader.read_request_body().expect("discard body");
        server_reader.read_request_header(&mut header).expect("second");
        assert_eq!(header.sequence, 2);
        assert_eq!(server_reader.read_request_body().expect("body"), None);
    }

    #[rstest]
    fn responses_carry_error_codes(connected: (BinaryCodec<TcpStream>, BinaryCodec<TcpStream>)) {
        let (client, server) = connected;
        let (mut client_reader, _client_writer) = ClientCodec::split(client);
        let (_server_reader, mut server_writer) = ServerCodec::split(server);

        let header = ResponseHeader {
            command: 101,
            sequence: 3,
            error: ErrorCode(777),
        };
        server_writer
            .write_response(&header, None)
            .expect("write response");

        let mut received = ResponseHeader::default();
        client_reader
            .read_response_header(&mut received)
            .expect("read header");
        assert_eq!(received, header);
        assert_eq!(client_reader.read_response_body().expect("body"), None);
    }

    #[rstest]
    fn clean_close_reads_as_end_of_stream(
        connected: (BinaryCodec<TcpStream>, BinaryCodec<TcpStream>),
    ) {
        let (client, server) = connected;
        let (_client_reader, mut client_writer) = ClientCodec::split(client);
        let (mut server_reader, _server_writer) = ServerCodec::split(server);

        RequestWriter::close(&mut client_writer).expect("close");
        RequestWriter::close(&mut client_writer).expect("close is idempotent");

        let mut header = RequestHeader::default();
        let error = server_reader
            .read_request_header(&mut header)
            .expect_err("stream ended");
        assert!(matches!(error, CodecError::EndOfStream));
    }

    #[test]
    fn truncated_headers_are_not_a_clean_end() {
        let (mut client, server) = tcp_pair();
        let (mut reader, _writer) = ServerCodec::split(BinaryCodec::new(server).expect("codec"));
        client.write_all(&[1, 0, 0]).expect("write partial header");
        drop(client);

        let mut header = RequestHeader::default();
        let error = reader
            .read_request_header(&mut header)
            .expect_err("partial header");
        assert!(!matches!(error, CodecError::EndOfStream));
    }

    #[rstest]
    fn writes_after_close_are_rejected(
        connected: (BinaryCodec<TcpStream>, BinaryCodec<TcpStream>),
    ) {
        let (client, _server) = connected;
        let (_reader, mut writer) = ClientCodec::split(client);
        RequestWriter::close(&mut writer).expect("close");
        let error = writer
            .write_request(&RequestHeader::default(), None)
            .expect_err("closed writer");
        assert!(matches!(error, CodecError::Closed));
    }
}
