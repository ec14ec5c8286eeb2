//! Value codecs for the grid wire format.
//!
//! Every key, value, filter, and processor that crosses the wire is
//! rendered by a [`Codec`] into an opaque byte payload the grid stores
//! and routes without interpreting. The built-in [`JsonCodec`] produces
//! deterministic JSON text: object keys are emitted in sorted order, so
//! the same logical value always encodes to the same bytes. That
//! determinism is load-bearing — canonical key and filter bytes index
//! the client-side listener registries.

use serde_json::Value as JsonValue;

use crate::error::{GridLinkError, Result};

/// Converts values to and from the opaque byte payloads used on the wire.
///
/// Implementations must be deterministic: identical inputs must produce
/// identical bytes across processes. The grid treats payloads as opaque;
/// only the codec's `format` tag travels alongside them so the server
/// can hand entries to other clients speaking the same format.
pub trait Codec: Send + Sync {
    /// Wire-level format tag, e.g. `"json"`.
    fn format(&self) -> &str;

    /// Encode a value into its wire payload.
    fn encode(&self, value: &JsonValue) -> Result<Vec<u8>>;

    /// Decode a wire payload back into a value.
    fn decode(&self, bytes: &[u8]) -> Result<JsonValue>;
}

/// The built-in textual JSON codec (`format == "json"`).
///
/// # Examples
///
/// ```rust
/// use gridlink::{Codec, JsonCodec};
/// use serde_json::json;
///
/// let codec = JsonCodec::new();
/// let bytes = codec.encode(&json!({"b": 1, "a": 2})).unwrap();
/// // Keys are ordered: encoding is stable regardless of insertion order.
/// assert_eq!(bytes, br#"{"a":2,"b":1}"#);
/// ```
#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    pub fn new() -> Self {
        Self
    }
}

impl Codec for JsonCodec {
    fn format(&self) -> &str {
        "json"
    }

    fn encode(&self, value: &JsonValue) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| GridLinkError::BadValue(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<JsonValue> {
        serde_json::from_slice(bytes).map_err(|e| GridLinkError::BadValue(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_tag() {
        assert_eq!(JsonCodec::new().format(), "json");
    }

    #[test]
    fn test_round_trip() {
        let codec = JsonCodec::new();
        let value = json!({"name": "alice", "age": 30, "tags": ["a", "b"]});
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_deterministic_encoding() {
        let codec = JsonCodec::new();
        let a: JsonValue = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: JsonValue = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        assert_eq!(codec.encode(&a).unwrap(), codec.encode(&b).unwrap());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = JsonCodec::new();
        let err = codec.decode(b"not json").unwrap_err();
        assert!(matches!(err, GridLinkError::BadValue(_)));
    }
}
