//! Line-delimited JSON codec.
//!
//! Requests are `{"cmd": u32, "id": u32, "params": [value]}` and responses are
//! `{"id": u32, "cmd": u32, "result": value, "error": u32}`, one object per
//! line. `params` may be absent or `null` for calls without arguments, and
//! `error` is omitted on success.

use std::io::{BufReader, BufWriter, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::de::IoRead;
use serde_json::value::RawValue;
use serde_json::{StreamDeserializer, Value};
use tracing::debug;

use super::{
    CODEC_TARGET, ClientCodec, Encoding, Payload, RequestReader, RequestWriter, ResponseReader,
    ResponseWriter, ServerCodec, Transport, shutdown_quietly,
};
use crate::errors::{CodecError, ErrorCode};
use crate::header::{RequestHeader, ResponseHeader};

#[derive(Deserialize)]
struct IncomingRequest {
    cmd: u32,
    id: u32,
    #[serde(default)]
    params: Option<Box<RawValue>>,
}

#[derive(Serialize)]
struct OutgoingRequest<'a> {
    cmd: u32,
    id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<[&'a RawValue; 1]>,
}

#[derive(Deserialize)]
struct IncomingResponse {
    id: u32,
    #[serde(default)]
    cmd: u32,
    #[serde(default)]
    result: Option<Box<RawValue>>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Serialize)]
struct OutgoingResponse<'a> {
    id: u32,
    cmd: u32,
    result: Option<&'a RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<u32>,
}

/// Server side of the JSON codec.
#[derive(Debug)]
pub struct JsonServerCodec<T: Transport> {
    reader: JsonRequestReader<T>,
    writer: JsonWriter<T>,
}

impl<T: Transport> JsonServerCodec<T> {
    /// Wraps a connected stream.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Io`] when the stream cannot be cloned for the
    /// reader half.
    pub fn new(stream: T) -> Result<Self, CodecError> {
        let read_half = stream.try_clone()?;
        Ok(Self {
            reader: JsonRequestReader {
                frames: FrameReader::new(read_half),
                params: None,
            },
            writer: JsonWriter::new(stream),
        })
    }
}

impl<T: Transport> ServerCodec for JsonServerCodec<T> {
    type Reader = JsonRequestReader<T>;
    type Writer = JsonWriter<T>;

    fn encoding(&self) -> Encoding {
        Encoding::Json
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        (self.reader, self.writer)
    }
}

/// Client side of the JSON codec.
#[derive(Debug)]
pub struct JsonClientCodec<T: Transport> {
    reader: JsonResponseReader<T>,
    writer: JsonWriter<T>,
}

impl<T: Transport> JsonClientCodec<T> {
    /// Wraps a connected stream.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Io`] when the stream cannot be cloned for the
    /// reader half.
    pub fn new(stream: T) -> Result<Self, CodecError> {
        let read_half = stream.try_clone()?;
        Ok(Self {
            reader: JsonResponseReader {
                frames: FrameReader::new(read_half),
                result: None,
            },
            writer: JsonWriter::new(stream),
        })
    }
}

impl<T: Transport> ClientCodec for JsonClientCodec<T> {
    type Reader = JsonResponseReader<T>;
    type Writer = JsonWriter<T>;

    fn encoding(&self) -> Encoding {
        Encoding::Json
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        (self.reader, self.writer)
    }
}

struct FrameReader<T: Transport, F> {
    frames: StreamDeserializer<'static, IoRead<BufReader<T>>, F>,
}

impl<T: Transport, F: DeserializeOwned> FrameReader<T, F> {
    fn new(stream: T) -> Self {
        Self {
            frames: serde_json::Deserializer::from_reader(BufReader::new(stream)).into_iter(),
        }
    }

    fn next_frame(&mut self) -> Result<F, CodecError> {
        match self.frames.next() {
            None => Err(CodecError::EndOfStream),
            Some(Ok(frame)) => Ok(frame),
            Some(Err(error)) if error.is_io() => Err(CodecError::Io {
                source: error.into(),
            }),
            Some(Err(error)) => Err(CodecError::malformed(error)),
        }
    }
}

impl<T: Transport, F> std::fmt::Debug for FrameReader<T, F> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("FrameReader").finish_non_exhaustive()
    }
}

/// Reader half of a [`JsonServerCodec`].
#[derive(Debug)]
pub struct JsonRequestReader<T: Transport> {
    frames: FrameReader<T, IncomingRequest>,
    params: Option<Box<RawValue>>,
}

impl<T: Transport> RequestReader for JsonRequestReader<T> {
    fn read_request_header(&mut self, header: &mut RequestHeader) -> Result<(), CodecError> {
        let request = self.frames.next_frame()?;
        header.command = request.cmd;
        header.sequence = request.id;
        self.params = request.params;
        Ok(())
    }

    fn read_request_body(&mut self) -> Result<Option<Payload>, CodecError> {
        let Some(params) = self.params.take() else {
            return Ok(None);
        };
        unwrap_params(&params)
    }
}

/// Extracts the single argument from a `params` array.
///
/// `null` and `[]` mean no argument; `[null]` is treated the same way.
fn unwrap_params(params: &RawValue) -> Result<Option<Payload>, CodecError> {
    let text = params.get();
    if text == "null" {
        return Ok(None);
    }
    let elements: Vec<&RawValue> = serde_json::from_str(text).map_err(CodecError::decode)?;
    match elements.as_slice() {
        [] => Ok(None),
        [only] if only.get() == "null" => Ok(None),
        [only] => Ok(Some(Payload::new(
            Encoding::Json,
            only.get().as_bytes().to_vec(),
        ))),
        _ => Err(CodecError::Decode {
            message: format!("expected one parameter, found {}", elements.len()),
        }),
    }
}

/// Reader half of a [`JsonClientCodec`].
#[derive(Debug)]
pub struct JsonResponseReader<T: Transport> {
    frames: FrameReader<T, IncomingResponse>,
    result: Option<Box<RawValue>>,
}

impl<T: Transport> ResponseReader for JsonResponseReader<T> {
    fn read_response_header(&mut self, header: &mut ResponseHeader) -> Result<(), CodecError> {
        let response = self.frames.next_frame()?;
        header.command = response.cmd;
        header.sequence = response.id;
        header.error = response_error(response.error.as_ref());
        self.result = response.result;
        Ok(())
    }

    fn read_response_body(&mut self) -> Result<Option<Payload>, CodecError> {
        Ok(self
            .result
            .take()
            .map(|raw| Payload::new(Encoding::Json, raw.get().as_bytes().to_vec())))
    }
}

/// Interprets the `error` member of a response.
///
/// Peers may send the code as a number or a numeric string; anything else
/// that is present and non-empty is a failure without a usable code.
fn response_error(error: Option<&Value>) -> ErrorCode {
    match error {
        None | Some(Value::Null) => ErrorCode::NONE,
        Some(Value::Number(number)) => number
            .as_u64()
            .and_then(|code| u32::try_from(code).ok())
            .map_or(ErrorCode::FAILURE, ErrorCode),
        Some(Value::String(text)) if text.is_empty() => ErrorCode::NONE,
        Some(Value::String(text)) => text.parse::<u32>().map_or(ErrorCode::FAILURE, ErrorCode),
        Some(_) => ErrorCode::FAILURE,
    }
}

/// Writer half shared by both sides of the JSON codec.
#[derive(Debug)]
pub struct JsonWriter<T: Transport> {
    stream: BufWriter<T>,
    closed: bool,
}

impl<T: Transport> JsonWriter<T> {
    fn new(stream: T) -> Self {
        Self {
            stream: BufWriter::new(stream),
            closed: false,
        }
    }

    fn write_line<M: Serialize>(&mut self, message: &M) -> Result<(), CodecError> {
        if self.closed {
            return Err(CodecError::Closed);
        }
        serde_json::to_writer(&mut self.stream, message).map_err(|error| {
            if error.is_io() {
                CodecError::Io {
                    source: error.into(),
                }
            } else {
                CodecError::encode(error)
            }
        })?;
        self.stream.write_all(b"\n")?;
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

fn raw_json(payload: &Payload) -> Result<&RawValue, CodecError> {
    if payload.encoding() != Encoding::Json {
        return Err(CodecError::Encode {
            message: "binary payload given to the JSON codec".to_owned(),
        });
    }
    serde_json::from_slice(payload.bytes()).map_err(CodecError::encode)
}

impl<T: Transport> ResponseWriter for JsonWriter<T> {
    fn write_response(
        &mut self,
        header: &ResponseHeader,
        body: Option<&Payload>,
    ) -> Result<(), CodecError> {
        let result = match body {
            Some(payload) if header.error.is_success() => Some(raw_json(payload)?),
            _ => None,
        };
        let error = (!header.error.is_success()).then_some(header.error.0);
        self.write_line(&OutgoingResponse {
            id: header.sequence,
            cmd: header.command,
            result,
            error,
        })
    }

    fn close(&mut self) -> Result<(), CodecError> {
        self.close_stream()
    }
}

impl<T: Transport> RequestWriter for JsonWriter<T> {
    fn write_request(
        &mut self,
        header: &RequestHeader,
        body: Option<&Payload>,
    ) -> Result<(), CodecError> {
        let params = body.map(raw_json).transpose()?.map(|raw| [raw]);
        self.write_line(&OutgoingRequest {
            cmd: header.command,
            id: header.sequence,
            params,
        })
    }

    fn close(&mut self) -> Result<(), CodecError> {
        self.close_stream()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, Write as _};
    use std::net::TcpStream;

    use rstest::rstest;

    use super::*;
    use crate::tests::support::tcp_pair;

    fn server_reading(lines: &str) -> JsonRequestReader<TcpStream> {
        let (mut client, server) = tcp_pair();
        client.write_all(lines.as_bytes()).expect("write lines");
        drop(client);
        let (reader, _writer) = JsonServerCodec::new(server).expect("codec").split();
        reader
    }

    #[test]
    fn requests_round_trip_through_the_wire_format() {
        let (client, server) = tcp_pair();
        let (_client_reader, mut writer) = JsonClientCodec::new(client).expect("client").split();
        let (mut reader, _server_writer) = JsonServerCodec::new(server).expect("server").split();

        let params = Encoding::Json.encode(&serde_json::json!({"a": 100, "b": 200}));
        let header = RequestHeader {
            command: 100,
            sequence: 4,
        };
        writer
            .write_request(&header, Some(&params.expect("encode")))
            .expect("write");

        let mut received = RequestHeader::default();
        reader.read_request_header(&mut received).expect("header");
        assert_eq!(received, header);
        let body = reader.read_request_body().expect("body").expect("params");
        assert_eq!(
            body.decode::<Value>().expect("decode"),
            serde_json::json!({"a": 100, "b": 200})
        );
    }

    #[test]
    fn params_are_wrapped_in_a_single_element_array() {
        let (client, server) = tcp_pair();
        let (_reader, mut writer) = JsonClientCodec::new(client).expect("client").split();
        let payload = Encoding::Json.encode(&7_u32).expect("encode");
        writer
            .write_request(
                &RequestHeader {
                    command: 1,
                    sequence: 2,
                },
                Some(&payload),
            )
            .expect("write");

        let mut line = String::new();
        std::io::BufReader::new(server)
            .read_line(&mut line)
            .expect("read line");
        let frame: Value = serde_json::from_str(&line).expect("json line");
        assert_eq!(frame, serde_json::json!({"cmd": 1, "id": 2, "params": [7]}));
    }

    #[rstest]
    #[case("{\"cmd\":3,\"id\":1}\n")]
    #[case("{\"cmd\":3,\"id\":1,\"params\":null}\n")]
    #[case("{\"cmd\":3,\"id\":1,\"params\":[]}\n")]
    #[case("{\"cmd\":3,\"id\":1,\"params\":[null]}\n")]
    fn absent_params_read_as_no_body(#[case] line: &str) {
        let mut reader = server_reading(line);
        let mut header = RequestHeader::default();
        reader.read_request_header(&mut header).expect("header");
        assert_eq!(header.command, 3);
        assert_eq!(reader.read_request_body().expect("body"), None);
    }

    #[test]
    fn surplus_params_are_a_recoverable_decode_error() {
        let mut reader = server_reading("{\"cmd\":3,\"id\":1,\"params\":[1,2]}\n{\"cmd\":4,\"id\":2}\n");
        let mut header = RequestHeader::default();
        reader.read_request_header(&mut header).expect("header");
        let error = reader.read_request_body().expect_err("two params");
        assert!(!error.is_fatal());

        reader.read_request_header(&mut header).expect("next header");
        assert_eq!(header.sequence, 2);
    }

    #[test]
    fn end_of_input_is_a_clean_end() {
        let mut reader = server_reading("");
        let mut header = RequestHeader::default();
        let error = reader.read_request_header(&mut header).expect_err("eof");
        assert!(matches!(error, CodecError::EndOfStream));
    }

    #[test]
    fn garbage_is_malformed() {
        let mut reader = server_reading("not json\n");
        let mut header = RequestHeader::default();
        let error = reader.read_request_header(&mut header).expect_err("garbage");
        assert!(matches!(error, CodecError::Malformed { .. }));
    }

    #[test]
    fn responses_omit_the_error_on_success_and_the_result_on_failure() {
        let (client, server) = tcp_pair();
        let (_reader, mut writer) = JsonServerCodec::new(server).expect("server").split();
        let payload = Encoding::Json.encode(&300_u64).expect("encode");
        writer
            .write_response(
                &ResponseHeader {
                    command: 100,
                    sequence: 1,
                    error: ErrorCode::NONE,
                },
                Some(&payload),
            )
            .expect("success");
        writer
            .write_response(
                &ResponseHeader {
                    command: 101,
                    sequence: 2,
                    error: ErrorCode(777),
                },
                None,
            )
            .expect("failure");

        let mut lines = std::io::BufReader::new(client).lines();
        let first: Value =
            serde_json::from_str(&lines.next().expect("line").expect("read")).expect("json");
        let second: Value =
            serde_json::from_str(&lines.next().expect("line").expect("read")).expect("json");
        assert_eq!(first, serde_json::json!({"id": 1, "cmd": 100, "result": 300}));
        assert_eq!(
            second,
            serde_json::json!({"id": 2, "cmd": 101, "result": null, "error": 777})
        );
    }

    #[rstest]
    #[case(None, ErrorCode::NONE)]
    #[case(Some(Value::Null), ErrorCode::NONE)]
    #[case(Some(serde_json::json!(777)), ErrorCode(777))]
    #[case(Some(serde_json::json!("777")), ErrorCode(777))]
    #[case(Some(serde_json::json!("")), ErrorCode::NONE)]
    #[case(Some(serde_json::json!("division by zero")), ErrorCode::FAILURE)]
    #[case(Some(serde_json::json!(-1)), ErrorCode::FAILURE)]
    fn response_errors_accept_numbers_and_strings(
        #[case] error: Option<Value>,
        #[case] expected: ErrorCode,
    ) {
        assert_eq!(response_error(error.as_ref()), expected);
    }

    #[test]
    fn client_reads_results_and_codes() {
        let (client, mut server) = tcp_pair();
        server
            .write_all(b"{\"id\":1,\"cmd\":100,\"result\":300}\n{\"id\":2,\"result\":null,\"error\":777}\n")
            .expect("write responses");
        drop(server);
        let (mut reader, _writer) = JsonClientCodec::new(client).expect("client").split();

        let mut header = ResponseHeader::default();
        reader.read_response_header(&mut header).expect("first");
        assert_eq!((header.sequence, header.error), (1, ErrorCode::NONE));
        let body = reader.read_response_body().expect("body").expect("result");
        assert_eq!(body.decode::<u64>().expect("decode"), 300);

        reader.read_response_header(&mut header).expect("second");
        assert_eq!((header.sequence, header.error), (2, ErrorCode(777)));
        assert_eq!(reader.read_response_body().expect("body"), None);
    }
}
