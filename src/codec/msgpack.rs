//! MsgPack serialization using `rmp-serde`.
//!
//! Values are written with `write_named` so maps keep their keys, and
//! read back one at a time from a shrinking slice, which lets a payload
//! hold several consecutive objects without any extra framing.

use serde_json::Value;

use super::Serialization;
use crate::error::Result;

/// Content-type id this crate assigns to MessagePack payloads.
pub const MSGPACK_CONTENT_TYPE_ID: u8 = 27;

/// MessagePack serialization for payload objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerialization;

impl Serialization for MsgPackSerialization {
    #[inline]
    fn content_type_id(&self) -> u8 {
        MSGPACK_CONTENT_TYPE_ID
    }

    #[inline]
    fn write_value(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        rmp_serde::encode::write_named(out, value)?;
        Ok(())
    }

    #[inline]
    fn read_value(&self, input: &mut &[u8]) -> Result<Value> {
        Ok(rmp_serde::from_read(input)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(value: Value) -> Value {
        let codec = MsgPackSerialization;
        let mut out = Vec::new();
        codec.write_value(&value, &mut out).unwrap();
        let mut input = &out[..];
        let decoded = codec.read_value(&mut input).unwrap();
        assert!(input.is_empty(), "value must consume exactly its own bytes");
        decoded
    }

    #[test]
    fn test_encode_decode_primitives() {
        assert_eq!(roundtrip(json!("hello world")), json!("hello world"));
        assert_eq!(roundtrip(json!(12345)), json!(12345));
        assert_eq!(roundtrip(json!(-7)), json!(-7));
        assert_eq!(roundtrip(json!(true)), json!(true));
        assert_eq!(roundtrip(Value::Null), Value::Null);
    }

    #[test]
    fn test_encode_decode_nested() {
        let value = json!({
            "inner": {"value": 999},
            "items": ["a", "b"],
            "ratio": 0.5
        });
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn test_maps_are_written_as_maps() {
        let codec = MsgPackSerialization;
        let mut out = Vec::new();
        codec.write_value(&json!({"id": 1, "name": "x"}), &mut out).unwrap();
        // 0x82 = fixmap with 2 elements
        assert_eq!(out[0], 0x82);
    }

    #[test]
    fn test_null_is_msgpack_nil() {
        let codec = MsgPackSerialization;
        let mut out = Vec::new();
        codec.write_value(&Value::Null, &mut out).unwrap();
        assert_eq!(out, vec![0xc0]);
    }

    #[test]
    fn test_sequential_values_share_one_buffer() {
        let codec = MsgPackSerialization;
        let mut out = Vec::new();
        for value in [json!("2.3.3"), json!("com.example.Greeter"), json!([1, 2])] {
            codec.write_value(&value, &mut out).unwrap();
        }

        let mut input = &out[..];
        assert_eq!(codec.read_value(&mut input).unwrap(), json!("2.3.3"));
        assert_eq!(codec.read_value(&mut input).unwrap(), json!("com.example.Greeter"));
        assert_eq!(codec.read_value(&mut input).unwrap(), json!([1, 2]));
        assert!(input.is_empty());
    }

    #[test]
    fn test_decode_error_on_truncated_data() {
        let codec = MsgPackSerialization;
        let mut out = Vec::new();
        codec.write_value(&json!("a longer string"), &mut out).unwrap();
        let mut input = &out[..4];
        assert!(codec.read_value(&mut input).is_err());
    }

    #[test]
    fn test_decode_error_on_empty_input() {
        let codec = MsgPackSerialization;
        let mut input: &[u8] = &[];
        assert!(codec.read_value(&mut input).is_err());
    }
}
