use serde::{Deserialize, Serialize};

use super::payload::Payload;

/// An encoded key/value pair carried by bulk requests and entry-valued
/// responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Encoded key.
    pub key: Payload,
    /// Encoded value.
    pub value: Payload,
}

impl CacheEntry {
    /// Create an entry from encoded payloads.
    pub fn new(key: Payload, value: Payload) -> Self {
        Self { key, value }
    }
}
