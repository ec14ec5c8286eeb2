//! Request factory.
//!
//! Builds well-formed request descriptors for every cache operation and
//! for the event-stream messages, stamping each with a fresh correlation
//! id. The id counter is scoped to the factory instance (one per named
//! map), never global; ids are monotonically increasing integers
//! rendered as text on the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::codec::Codec;
use crate::error::{GridLinkError, Result};
use crate::extractor::ValueExtractor;
use crate::filter::Filter;
use crate::models::{CacheEntry, CacheOp, CacheRequest, Payload, QueryKind, StreamRequest};
use crate::processor::Processor;

/// Produces request descriptors for one named map.
pub(crate) struct RequestFactory {
    cache: String,
    format: String,
    codec: Arc<dyn Codec>,
    counter: AtomicU64,
}

impl RequestFactory {
    pub(crate) fn new(cache: String, codec: Arc<dyn Codec>) -> Self {
        Self {
            cache,
            format: codec.format().to_string(),
            codec,
            counter: AtomicU64::new(1),
        }
    }

    /// Next correlation id, unique within this factory's lifetime.
    pub(crate) fn next_id(&self) -> String {
        self.counter.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Encode an application value into a wire payload.
    pub(crate) fn encode_value(&self, value: &JsonValue) -> Result<Payload> {
        self.codec.encode(value).map(Payload::new)
    }

    /// Encode a filter tree into a wire payload.
    pub(crate) fn encode_filter(&self, filter: &Filter) -> Result<Payload> {
        let value = serde_json::to_value(filter).map_err(|e| GridLinkError::BadValue(e.to_string()))?;
        self.encode_value(&value)
    }

    /// Encode an extractor tree into a wire payload.
    pub(crate) fn encode_extractor(&self, extractor: &ValueExtractor) -> Result<Payload> {
        let value =
            serde_json::to_value(extractor).map_err(|e| GridLinkError::BadValue(e.to_string()))?;
        self.encode_value(&value)
    }

    /// Encode a processor descriptor into a wire payload.
    pub(crate) fn encode_processor(&self, processor: &Processor) -> Result<Payload> {
        let value =
            serde_json::to_value(processor).map_err(|e| GridLinkError::BadValue(e.to_string()))?;
        self.encode_value(&value)
    }

    /// Wrap an operation body into the request envelope.
    pub(crate) fn request(&self, op: CacheOp) -> CacheRequest {
        CacheRequest {
            id: self.next_id(),
            cache: self.cache.clone(),
            format: self.format.clone(),
            op,
        }
    }

    pub(crate) fn get(&self, key: Payload) -> CacheRequest {
        self.request(CacheOp::Get { key })
    }

    pub(crate) fn get_all(&self, keys: Vec<Payload>) -> CacheRequest {
        self.request(CacheOp::GetAll { keys })
    }

    pub(crate) fn put(&self, key: Payload, value: Payload, ttl_millis: i64) -> CacheRequest {
        self.request(CacheOp::Put { key, value, ttl_millis })
    }

    pub(crate) fn put_if_absent(&self, key: Payload, value: Payload, ttl_millis: i64) -> CacheRequest {
        self.request(CacheOp::PutIfAbsent { key, value, ttl_millis })
    }

    pub(crate) fn put_all(&self, entries: Vec<CacheEntry>, ttl_millis: i64) -> CacheRequest {
        self.request(CacheOp::PutAll { entries, ttl_millis })
    }

    pub(crate) fn remove(&self, key: Payload) -> CacheRequest {
        self.request(CacheOp::Remove { key })
    }

    pub(crate) fn remove_mapping(&self, key: Payload, value: Payload) -> CacheRequest {
        self.request(CacheOp::RemoveMapping { key, value })
    }

    pub(crate) fn replace(&self, key: Payload, value: Payload) -> CacheRequest {
        self.request(CacheOp::Replace { key, value })
    }

    pub(crate) fn replace_mapping(
        &self,
        key: Payload,
        old_value: Payload,
        new_value: Payload,
    ) -> CacheRequest {
        self.request(CacheOp::ReplaceMapping { key, old_value, new_value })
    }

    pub(crate) fn contains_key(&self, key: Payload) -> CacheRequest {
        self.request(CacheOp::ContainsKey { key })
    }

    pub(crate) fn contains_value(&self, value: Payload) -> CacheRequest {
        self.request(CacheOp::ContainsValue { value })
    }

    pub(crate) fn contains_entry(&self, key: Payload, value: Payload) -> CacheRequest {
        self.request(CacheOp::ContainsEntry { key, value })
    }

    pub(crate) fn size(&self) -> CacheRequest {
        self.request(CacheOp::Size)
    }

    pub(crate) fn is_empty(&self) -> CacheRequest {
        self.request(CacheOp::IsEmpty)
    }

    pub(crate) fn clear(&self) -> CacheRequest {
        self.request(CacheOp::Clear)
    }

    pub(crate) fn truncate(&self) -> CacheRequest {
        self.request(CacheOp::Truncate)
    }

    pub(crate) fn query(
        &self,
        kind: QueryKind,
        filter: Option<Payload>,
        cursor: Option<String>,
    ) -> CacheRequest {
        self.request(CacheOp::Query { kind, filter, cursor })
    }

    pub(crate) fn invoke(&self, key: Payload, processor: Payload) -> CacheRequest {
        self.request(CacheOp::Invoke { key, processor })
    }

    pub(crate) fn invoke_all(
        &self,
        keys: Option<Vec<Payload>>,
        filter: Option<Payload>,
        processor: Payload,
    ) -> CacheRequest {
        self.request(CacheOp::InvokeAll { keys, filter, processor })
    }

    pub(crate) fn add_index(
        &self,
        extractor: Payload,
        sorted: bool,
        comparator: Option<Payload>,
    ) -> CacheRequest {
        self.request(CacheOp::AddIndex { extractor, sorted, comparator })
    }

    pub(crate) fn remove_index(&self, extractor: Payload) -> CacheRequest {
        self.request(CacheOp::RemoveIndex { extractor })
    }

    pub(crate) fn destroy(&self) -> CacheRequest {
        self.request(CacheOp::Destroy)
    }

    // ── Event-stream messages ───────────────────────────────────────────

    pub(crate) fn stream_init(&self) -> StreamRequest {
        StreamRequest::Init {
            id: self.next_id(),
            cache: self.cache.clone(),
            format: self.format.clone(),
        }
    }

    pub(crate) fn subscribe_key(&self, key: Payload, lite: bool) -> StreamRequest {
        StreamRequest::SubscribeKey {
            id: self.next_id(),
            key,
            lite,
            priming: false,
        }
    }

    pub(crate) fn unsubscribe_key(&self, key: Payload) -> StreamRequest {
        StreamRequest::UnsubscribeKey { id: self.next_id(), key }
    }

    pub(crate) fn subscribe_filter(&self, filter: Payload, lite: bool) -> StreamRequest {
        StreamRequest::SubscribeFilter { id: self.next_id(), filter, lite }
    }

    pub(crate) fn unsubscribe_filter(&self, filter_id: u64) -> StreamRequest {
        StreamRequest::UnsubscribeFilter { id: self.next_id(), filter_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde_json::json;

    fn factory() -> RequestFactory {
        RequestFactory::new("orders".to_string(), Arc::new(JsonCodec::new()))
    }

    #[test]
    fn test_ids_are_monotonic_text() {
        let factory = factory();
        let a = factory.next_id();
        let b = factory.next_id();
        assert!(a.parse::<u64>().unwrap() < b.parse::<u64>().unwrap());
    }

    #[test]
    fn test_ids_are_scoped_per_factory() {
        let a = factory();
        let b = factory();
        assert_eq!(a.next_id(), b.next_id());
    }

    #[test]
    fn test_request_envelope() {
        let factory = factory();
        let key = factory.encode_value(&json!("k")).unwrap();
        let request = factory.get(key);
        assert_eq!(request.cache, "orders");
        assert_eq!(request.format, "json");

        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["op"], "get");
        assert_eq!(wire["cache"], "orders");
    }

    #[test]
    fn test_stream_init_carries_fresh_id() {
        let factory = factory();
        let a = factory.stream_init();
        let b = factory.stream_init();
        assert_ne!(a.id(), b.id());
    }
}
