//! Request/response messages and their payload encoding.
//!
//! A request payload is a sequence of serialized objects:
//! ```text
//! version marker │ path │ service version │ method │ param descriptor │ args... │ attachments
//! ```
//! A response payload is either an error message (non-OK status), a single
//! value (event frames), or a discriminator followed by a value or exception.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::{Map, Value};

use super::frame::{build_frame, Frame};
use super::wire_format::{flags, Status};
use crate::codec::Serialization;
use crate::error::{Result, RpcError};
use crate::service::ParamType;

/// Protocol version marker written at the head of every invocation.
pub const PROTOCOL_VERSION: &str = "2.3.3";

/// String-keyed metadata carried with an invocation.
pub type Attachments = BTreeMap<String, String>;

/// Response body discriminators.
pub mod body {
    pub const WITH_EXCEPTION: i64 = 0;
    pub const VALUE: i64 = 1;
    pub const NULL_VALUE: i64 = 2;
    pub const WITH_EXCEPTION_AND_ATTACHMENTS: i64 = 3;
    pub const VALUE_WITH_ATTACHMENTS: i64 = 4;
    pub const NULL_VALUE_WITH_ATTACHMENTS: i64 = 5;
}

/// A remote method call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Invocation {
    /// Remote method name.
    pub method_name: String,
    /// JVM-style parameter descriptor, e.g. `Ljava/lang/String;I`.
    pub param_types: String,
    /// Positional arguments.
    pub arguments: Vec<Value>,
    /// Metadata (path, version, timeout, owner, customer, ...).
    pub attachments: Attachments,
}

impl Invocation {
    /// Create an invocation with no attachments.
    pub fn new(method_name: impl Into<String>, param_types: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            method_name: method_name.into(),
            param_types: param_types.into(),
            arguments,
            attachments: Attachments::new(),
        }
    }

    /// Set one attachment.
    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    /// Look up one attachment.
    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(String::as_str)
    }
}

/// Request body.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestData {
    /// A method call.
    Invocation(Invocation),
    /// Event payload (null for heartbeats).
    Event(Value),
}

/// An outbound (or, for heartbeats, inbound) request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: i64,
    pub two_way: bool,
    pub data: RequestData,
}

impl Request {
    /// Request carrying an invocation.
    pub fn invocation(id: i64, two_way: bool, invocation: Invocation) -> Self {
        Self {
            id,
            two_way,
            data: RequestData::Invocation(invocation),
        }
    }

    /// Heartbeat probe. Flagged two-way so the peer answers it.
    pub fn heartbeat(id: i64) -> Self {
        Self {
            id,
            two_way: true,
            data: RequestData::Event(Value::Null),
        }
    }

    #[inline]
    pub fn is_event(&self) -> bool {
        matches!(self.data, RequestData::Event(_))
    }

    /// Heartbeats are events with a null body.
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        matches!(self.data, RequestData::Event(Value::Null))
    }
}

/// An inbound (or, for heartbeat replies, outbound) response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: i64,
    pub status: Status,
    pub event: bool,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub exception: Option<Value>,
    pub attachments: Attachments,
}

impl Response {
    fn bare(id: i64, status: Status) -> Self {
        Self {
            id,
            status,
            event: false,
            result: None,
            error_message: None,
            exception: None,
            attachments: Attachments::new(),
        }
    }

    /// Successful response with a result value.
    pub fn ok(id: i64, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::bare(id, Status::Ok)
        }
    }

    /// Successful status carrying an application exception.
    pub fn exception(id: i64, exception: Value) -> Self {
        Self {
            exception: Some(exception),
            ..Self::bare(id, Status::Ok)
        }
    }

    /// Non-OK status with an error message.
    pub fn error(id: i64, status: Status, message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::bare(id, status)
        }
    }

    /// Reply to a heartbeat probe.
    pub fn heartbeat(id: i64) -> Self {
        Self {
            event: true,
            result: Some(Value::Null),
            ..Self::bare(id, Status::Ok)
        }
    }

    /// Response synthesized when no answer arrived in time.
    pub fn timeout(id: i64, elapsed: std::time::Duration) -> Self {
        Self::error(
            id,
            Status::ServerTimeout,
            format!("waiting response timeout. elapsed: {}ms", elapsed.as_millis()),
        )
    }

    /// Heartbeat replies are events with a null body.
    pub fn is_heartbeat(&self) -> bool {
        self.event && matches!(self.result, None | Some(Value::Null))
    }

    /// True when the exception slot holds something other than null.
    pub fn has_exception(&self) -> bool {
        matches!(&self.exception, Some(exc) if !exc.is_null())
    }

    /// Convert into the value a caller receives, or the matching failure.
    pub fn into_result(self) -> Result<Value> {
        if self.status.is_timeout() {
            return Err(RpcError::Timeout {
                request_id: self.id,
                message: self.error_message.unwrap_or_default(),
            });
        }
        if self.status != Status::Ok {
            return Err(RpcError::RemoteStatus {
                status: self.status,
                message: self.error_message.unwrap_or_default(),
            });
        }
        if self.has_exception() {
            return Err(RpcError::RemoteException(self.exception.unwrap_or_default()));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

/// Encode a request into a complete frame.
pub fn encode_request(request: &Request, serialization: &dyn Serialization) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    match &request.data {
        RequestData::Event(data) => serialization.write_value(data, &mut payload)?,
        RequestData::Invocation(invocation) => {
            encode_invocation(invocation, serialization, &mut payload)?
        }
    }

    let flag_byte = flags::compose(
        serialization.content_type_id(),
        true,
        request.two_way,
        request.is_event(),
    );
    build_frame(flag_byte, 0, request.id, &payload)
}

fn encode_invocation(
    invocation: &Invocation,
    serialization: &dyn Serialization,
    out: &mut Vec<u8>,
) -> Result<()> {
    let path = invocation.attachment(crate::config::PATH_KEY).ok_or_else(|| {
        RpcError::Configuration(format!(
            "invocation of '{}' has no '{}' attachment",
            invocation.method_name,
            crate::config::PATH_KEY
        ))
    })?;
    let version = invocation
        .attachment(crate::config::VERSION_KEY)
        .unwrap_or_default();

    serialization.write_value(&Value::from(PROTOCOL_VERSION), out)?;
    serialization.write_value(&Value::from(path), out)?;
    serialization.write_value(&Value::from(version), out)?;
    serialization.write_value(&Value::from(invocation.method_name.as_str()), out)?;
    serialization.write_value(&Value::from(invocation.param_types.as_str()), out)?;
    for argument in &invocation.arguments {
        serialization.write_value(argument, out)?;
    }
    serialization.write_value(&attachments_to_value(&invocation.attachments), out)?;
    Ok(())
}

/// Encode a response into a complete frame.
pub fn encode_response(response: &Response, serialization: &dyn Serialization) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    if response.status != Status::Ok {
        let message = response.error_message.clone().unwrap_or_default();
        serialization.write_value(&Value::from(message), &mut payload)?;
    } else if response.event {
        let data = response.result.clone().unwrap_or(Value::Null);
        serialization.write_value(&data, &mut payload)?;
    } else {
        let with_attachments = !response.attachments.is_empty();
        if response.has_exception() {
            let tag = if with_attachments {
                body::WITH_EXCEPTION_AND_ATTACHMENTS
            } else {
                body::WITH_EXCEPTION
            };
            serialization.write_value(&Value::from(tag), &mut payload)?;
            serialization.write_value(response.exception.as_ref().unwrap_or(&Value::Null), &mut payload)?;
        } else {
            match &response.result {
                None | Some(Value::Null) => {
                    let tag = if with_attachments {
                        body::NULL_VALUE_WITH_ATTACHMENTS
                    } else {
                        body::NULL_VALUE
                    };
                    serialization.write_value(&Value::from(tag), &mut payload)?;
                }
                Some(value) => {
                    let tag = if with_attachments {
                        body::VALUE_WITH_ATTACHMENTS
                    } else {
                        body::VALUE
                    };
                    serialization.write_value(&Value::from(tag), &mut payload)?;
                    serialization.write_value(value, &mut payload)?;
                }
            }
        }
        if with_attachments {
            serialization.write_value(&attachments_to_value(&response.attachments), &mut payload)?;
        }
    }

    let flag_byte = flags::compose(serialization.content_type_id(), false, false, response.event);
    build_frame(flag_byte, response.status.into(), response.id, &payload)
}

/// Decode a complete frame into a request or response.
pub fn decode_frame(frame: &Frame, serialization: &dyn Serialization) -> Result<Message> {
    let header = &frame.header;
    if header.content_type_id() != serialization.content_type_id() {
        return Err(RpcError::Protocol(format!(
            "frame {} uses content type {}, expected {}",
            header.request_id,
            header.content_type_id(),
            serialization.content_type_id()
        )));
    }

    let mut input: &[u8] = &frame.payload;
    if header.is_request() {
        let data = if header.is_event() {
            RequestData::Event(read_optional(serialization, &mut input)?)
        } else {
            RequestData::Invocation(decode_invocation(serialization, &mut input)?)
        };
        return Ok(Message::Request(Request {
            id: header.request_id,
            two_way: header.is_two_way(),
            data,
        }));
    }

    let status = header.status();
    let mut response = Response::bare(header.request_id, status);
    response.event = header.is_event();

    if status != Status::Ok {
        let message = read_optional(serialization, &mut input)?;
        response.error_message = Some(match message {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        });
    } else if response.event {
        response.result = Some(read_optional(serialization, &mut input)?);
    } else {
        decode_response_body(serialization, &mut input, &mut response)?;
    }
    Ok(Message::Response(response))
}

fn decode_response_body(
    serialization: &dyn Serialization,
    input: &mut &[u8],
    response: &mut Response,
) -> Result<()> {
    let tag = serialization
        .read_value(input)?
        .as_i64()
        .ok_or_else(|| RpcError::Protocol("response discriminator is not an integer".to_string()))?;

    match tag {
        body::NULL_VALUE | body::NULL_VALUE_WITH_ATTACHMENTS => {
            response.result = Some(Value::Null);
        }
        body::VALUE | body::VALUE_WITH_ATTACHMENTS => {
            response.result = Some(serialization.read_value(input)?);
        }
        body::WITH_EXCEPTION | body::WITH_EXCEPTION_AND_ATTACHMENTS => {
            response.exception = Some(serialization.read_value(input)?);
        }
        other => {
            return Err(RpcError::Protocol(format!(
                "unknown response discriminator {}",
                other
            )))
        }
    }

    if tag >= body::WITH_EXCEPTION_AND_ATTACHMENTS {
        response.attachments = value_to_attachments(serialization.read_value(input)?);
    }
    Ok(())
}

fn decode_invocation(serialization: &dyn Serialization, input: &mut &[u8]) -> Result<Invocation> {
    let _version = serialization.read_value(input)?;
    let path = read_string(serialization, input)?;
    let version = read_string(serialization, input)?;
    let method_name = read_string(serialization, input)?;
    let param_types = read_string(serialization, input)?;

    let arity = ParamType::parse_descriptor(&param_types)?.len();
    let mut arguments = Vec::with_capacity(arity);
    for _ in 0..arity {
        arguments.push(serialization.read_value(input)?);
    }

    let mut attachments = value_to_attachments(read_optional(serialization, input)?);
    attachments
        .entry(crate::config::PATH_KEY.to_string())
        .or_insert(path);
    attachments
        .entry(crate::config::VERSION_KEY.to_string())
        .or_insert(version);

    Ok(Invocation {
        method_name,
        param_types,
        arguments,
        attachments,
    })
}

fn read_string(serialization: &dyn Serialization, input: &mut &[u8]) -> Result<String> {
    match serialization.read_value(input)? {
        Value::String(s) => Ok(s),
        Value::Null => Ok(String::new()),
        other => Err(RpcError::Protocol(format!("expected string, found {}", other))),
    }
}

/// Empty payloads decode as null.
fn read_optional(serialization: &dyn Serialization, input: &mut &[u8]) -> Result<Value> {
    if input.is_empty() {
        return Ok(Value::Null);
    }
    serialization.read_value(input)
}

fn attachments_to_value(attachments: &Attachments) -> Value {
    let map: Map<String, Value> = attachments
        .iter()
        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
        .collect();
    Value::Object(map)
}

fn value_to_attachments(value: Value) -> Attachments {
    match value {
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect(),
        _ => Attachments::new(),
    }
}

/// Re-wrap encoded bytes as a frame, for tests and in-process peers.
pub fn frame_from_bytes(bytes: Vec<u8>) -> Option<Frame> {
    let header = super::Header::decode(&bytes)?;
    let payload = Bytes::from(bytes).slice(super::HEADER_SIZE..);
    Some(Frame::new(header, payload))
}
