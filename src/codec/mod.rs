//! Codec module - serialization of payload objects.
//!
//! Frame payloads are a sequence of serialized objects (the protocol
//! version, service path, arguments, ...). How a single object becomes
//! bytes is pluggable through the [`Serialization`] trait; the id it
//! reports is written into the content-type bits of every outgoing frame.
//!
//! - [`MsgPackSerialization`] - MessagePack using `rmp-serde` (default)
//!
//! # Example
//!
//! ```
//! use dubbo_client::codec::{MsgPackSerialization, Serialization};
//! use serde_json::json;
//!
//! let codec = MsgPackSerialization;
//! let mut out = Vec::new();
//! codec.write_value(&json!("hello"), &mut out).unwrap();
//! codec.write_value(&json!(42), &mut out).unwrap();
//!
//! let mut input = &out[..];
//! assert_eq!(codec.read_value(&mut input).unwrap(), json!("hello"));
//! assert_eq!(codec.read_value(&mut input).unwrap(), json!(42));
//! assert!(input.is_empty());
//! ```

mod msgpack;

pub use msgpack::{MsgPackSerialization, MSGPACK_CONTENT_TYPE_ID};

use serde_json::Value;

use crate::error::Result;

/// Object serializer used for frame payloads.
pub trait Serialization: Send + Sync + 'static {
    /// Content-type id written into the flag byte (five bits).
    fn content_type_id(&self) -> u8;

    /// Append one serialized value to `out`.
    fn write_value(&self, value: &Value, out: &mut Vec<u8>) -> Result<()>;

    /// Read exactly one value from the front of `input`, advancing it.
    fn read_value(&self, input: &mut &[u8]) -> Result<Value>;
}
