use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An opaque codec-produced byte payload.
///
/// Payloads travel on the wire as base64 strings so that binary codec
/// formats remain representable inside JSON envelopes. The canonical
/// text rendering of a payload doubles as the client-side index key for
/// listener targets.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// Wrap encoded bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The raw encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the payload is empty. The grid encodes "no value" as an
    /// empty payload.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical text rendering used to index listener targets: two
    /// targets that encode identically share one canonical string.
    pub fn canonical_text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({})", self.canonical_text())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Payload)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_round_trip() {
        let payload = Payload::new(br#"{"a":1}"#.to_vec());
        let json = serde_json::to_string(&payload).unwrap();
        let parsed: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_canonical_text() {
        let payload = Payload::new(b"\"k1\"".to_vec());
        assert_eq!(payload.canonical_text(), "\"k1\"");
    }
}
