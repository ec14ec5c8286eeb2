use serde::{Deserialize, Serialize};

use super::cache_entry::CacheEntry;
use super::payload::Payload;

/// Envelope for every unary cache operation.
///
/// Carries the routing fields shared by all operations plus the
/// operation-specific body, flattened into one JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRequest {
    /// Correlation id, unique per request factory.
    pub id: String,

    /// Target cache name.
    pub cache: String,

    /// Codec format tag for the carried payloads.
    pub format: String,

    /// The operation body.
    #[serde(flatten)]
    pub op: CacheOp,
}

/// Operation-specific request bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CacheOp {
    /// Read a single entry.
    Get {
        /// Encoded key.
        key: Payload,
    },

    /// Read a batch of entries; missing keys are omitted from the result.
    GetAll {
        /// Encoded keys.
        keys: Vec<Payload>,
    },

    /// Write an entry, returning the previous value.
    Put {
        /// Encoded key.
        key: Payload,
        /// Encoded value.
        value: Payload,
        /// Entry TTL in milliseconds; zero or negative means the grid
        /// default.
        ttl_millis: i64,
    },

    /// Write an entry only when absent.
    PutIfAbsent {
        /// Encoded key.
        key: Payload,
        /// Encoded value.
        value: Payload,
        /// Entry TTL in milliseconds; zero or negative means the grid
        /// default.
        ttl_millis: i64,
    },

    /// Bulk write.
    PutAll {
        /// Encoded entries.
        entries: Vec<CacheEntry>,
        /// Entry TTL in milliseconds; zero or negative means the grid
        /// default.
        ttl_millis: i64,
    },

    /// Remove an entry, returning the removed value.
    Remove {
        /// Encoded key.
        key: Payload,
    },

    /// Remove an entry only when it maps to the given value.
    RemoveMapping {
        /// Encoded key.
        key: Payload,
        /// Encoded expected value.
        value: Payload,
    },

    /// Replace an entry only when present.
    Replace {
        /// Encoded key.
        key: Payload,
        /// Encoded new value.
        value: Payload,
    },

    /// Replace an entry only when it maps to the expected value.
    ReplaceMapping {
        /// Encoded key.
        key: Payload,
        /// Encoded expected value.
        old_value: Payload,
        /// Encoded new value.
        new_value: Payload,
    },

    /// Membership check by key.
    ContainsKey {
        /// Encoded key.
        key: Payload,
    },

    /// Membership check by value.
    ContainsValue {
        /// Encoded value.
        value: Payload,
    },

    /// Membership check by entry.
    ContainsEntry {
        /// Encoded key.
        key: Payload,
        /// Encoded value.
        value: Payload,
    },

    /// Entry count.
    Size,

    /// Emptiness check.
    IsEmpty,

    /// Remove all entries, observing eviction semantics.
    Clear,

    /// Remove all entries without observing per-entry semantics; the
    /// grid emits a truncated lifecycle event.
    Truncate,

    /// Paged query over keys, entries, or values.
    Query {
        /// What the page items carry.
        kind: QueryKind,
        /// Optional encoded filter tree; absent means all entries.
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<Payload>,
        /// Page cursor from the previous page; absent on the first page.
        #[serde(skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
    },

    /// Execute an entry processor against one entry.
    Invoke {
        /// Encoded key.
        key: Payload,
        /// Encoded processor descriptor.
        processor: Payload,
    },

    /// Execute an entry processor against a key set or a filtered set.
    InvokeAll {
        /// Encoded keys; mutually exclusive with `filter`.
        #[serde(skip_serializing_if = "Option::is_none")]
        keys: Option<Vec<Payload>>,
        /// Encoded filter tree; mutually exclusive with `keys`.
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<Payload>,
        /// Encoded processor descriptor.
        processor: Payload,
    },

    /// Create a server-side index over an extracted attribute.
    AddIndex {
        /// Encoded extractor tree.
        extractor: Payload,
        /// Whether the index is sorted (supports range queries).
        sorted: bool,
        /// Optional encoded comparator descriptor.
        #[serde(skip_serializing_if = "Option::is_none")]
        comparator: Option<Payload>,
    },

    /// Drop a server-side index.
    RemoveIndex {
        /// Encoded extractor tree.
        extractor: Payload,
    },

    /// Destroy the cache grid-wide.
    Destroy,
}

/// What a query page's items carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Keys only.
    Keys,
    /// Key/value pairs.
    Entries,
    /// Values only.
    Values,
}
