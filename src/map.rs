//! Named map client.
//!
//! A [`NamedMap`] is a typed handle over one named key-value collection
//! on the grid. Handles are cheap to clone; all handles for the same
//! `(name, format)` pair share one underlying state, so listener
//! registrations and lifecycle transitions are visible across them.
//!
//! Every operation encodes its arguments through the map's codec, ships
//! a request descriptor over the session's shared channel, and decodes
//! the response. Failures surface as [`GridLinkError`]; codec failures
//! short-circuit before any request is sent.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::codec::Codec;
use crate::dispatcher::{MapEventDispatcher, StreamConfig, SubscriptionTarget};
use crate::error::{GridLinkError, Result};
use crate::executor::RequestExecutor;
use crate::extractor::ValueExtractor;
use crate::filter::Filter;
use crate::listener::{LifecycleHub, MapLifecycleListener, MapListener};
use crate::models::{CacheEntry, CacheResponse, Payload, QueryItem, QueryKind};
use crate::processor::Processor;
use crate::request::RequestFactory;

/// Insertion-ordered registry of live maps, keyed by (name, format).
///
/// Insertion order is teardown order: session close releases maps in
/// the order they were opened.
pub(crate) type MapRegistry = std::sync::Mutex<Vec<((String, String), Arc<MapInner>)>>;

/// Shared per-map state behind every [`NamedMap`] handle.
pub(crate) struct MapInner {
    name: String,
    codec: Arc<dyn Codec>,
    factory: Arc<RequestFactory>,
    executor: RequestExecutor,
    lifecycle: LifecycleHub,
    stream_config: StreamConfig,
    dispatcher: tokio::sync::Mutex<Option<Arc<MapEventDispatcher>>>,
    released: AtomicBool,
    destroyed: Arc<AtomicBool>,
    session_closed: Arc<AtomicBool>,
    registry: Weak<MapRegistry>,
}

impl MapInner {
    pub(crate) fn new(
        name: String,
        codec: Arc<dyn Codec>,
        executor: RequestExecutor,
        stream_config: StreamConfig,
        session_closed: Arc<AtomicBool>,
        registry: Weak<MapRegistry>,
    ) -> Self {
        let factory = Arc::new(RequestFactory::new(name.clone(), codec.clone()));
        Self {
            lifecycle: LifecycleHub::new(name.clone()),
            name,
            codec,
            factory,
            executor,
            stream_config,
            dispatcher: tokio::sync::Mutex::new(None),
            released: AtomicBool::new(false),
            destroyed: Arc::new(AtomicBool::new(false)),
            session_closed,
            registry,
        }
    }

    /// Whether this map can no longer serve operations. Destroy
    /// notifications arrive over the event stream, so a registry entry
    /// can turn defunct without the session observing it.
    pub(crate) fn is_defunct(&self) -> bool {
        self.released.load(Ordering::SeqCst) || self.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.session_closed.load(Ordering::SeqCst) {
            return Err(GridLinkError::SessionClosed);
        }
        if self.released.load(Ordering::SeqCst) || self.destroyed.load(Ordering::SeqCst) {
            return Err(GridLinkError::CacheNotActive(self.name.clone()));
        }
        Ok(())
    }

    async fn dispatcher(&self) -> Arc<MapEventDispatcher> {
        let mut guard = self.dispatcher.lock().await;
        match guard.as_ref() {
            Some(dispatcher) => dispatcher.clone(),
            None => {
                let dispatcher = Arc::new(MapEventDispatcher::spawn(
                    self.factory.clone(),
                    self.codec.clone(),
                    self.lifecycle.clone(),
                    self.destroyed.clone(),
                    self.stream_config.clone(),
                ));
                *guard = Some(dispatcher.clone());
                dispatcher
            }
        }
    }

    async fn close_dispatcher(&self) {
        let dispatcher = self.dispatcher.lock().await.take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.close().await;
        }
    }

    fn deregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut maps = registry.lock().expect("map registry lock poisoned");
            maps.retain(|(_, inner)| !std::ptr::eq(Arc::as_ptr(inner), self as *const _));
        }
    }

    /// Sever the event stream and drop this map from the session
    /// registry. Idempotent; shared by `release` and session close.
    pub(crate) async fn release_internal(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.close_dispatcher().await;
        self.deregister();
        self.lifecycle.emit_released();
        Ok(())
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Payload> {
        let json = serde_json::to_value(value).map_err(|e| GridLinkError::BadValue(e.to_string()))?;
        self.factory.encode_value(&json)
    }

    fn decode_json(&self, payload: &Payload) -> Result<JsonValue> {
        self.codec.decode(payload.as_bytes())
    }

    /// Decode an optional single-value payload. An absent or empty
    /// payload is a null result; this is the only exit path for "no
    /// value", so the result resolves exactly once.
    fn decode_value<T: DeserializeOwned>(&self, payload: Option<Payload>) -> Result<Option<T>> {
        let Some(payload) = payload else { return Ok(None) };
        if payload.is_empty() {
            return Ok(None);
        }
        let json = self.decode_json(&payload)?;
        if json.is_null() {
            return Ok(None);
        }
        serde_json::from_value(json)
            .map(Some)
            .map_err(|e| GridLinkError::BadValue(e.to_string()))
    }
}

/// A typed handle to one named key-value collection on the grid.
///
/// # Examples
///
/// ```rust,no_run
/// use gridlink::Session;
///
/// # async fn example() -> gridlink::Result<()> {
/// let session = Session::builder().address("localhost:1408").build()?;
/// let orders = session.map::<String, String>("orders")?;
///
/// orders.put("o-1".to_string(), "pending".to_string()).await?;
/// let state = orders.get(&"o-1".to_string()).await?;
/// assert_eq!(state.as_deref(), Some("pending"));
/// # Ok(())
/// # }
/// ```
pub struct NamedMap<K, V> {
    inner: Arc<MapInner>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> std::fmt::Debug for NamedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedMap").finish_non_exhaustive()
    }
}

impl<K, V> Clone for NamedMap<K, V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), _marker: PhantomData }
    }
}

impl<K, V> NamedMap<K, V> {
    pub(crate) fn from_inner(inner: Arc<MapInner>) -> Self {
        Self { inner, _marker: PhantomData }
    }

    /// The name of this map.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The codec format this handle speaks.
    pub fn format(&self) -> &str {
        self.inner.codec.format()
    }

    /// Whether two handles share the same underlying map instance.
    /// Handles obtained for the same `(name, format)` from one session
    /// are identity-equal.
    pub fn is_same(&self, other: &NamedMap<K, V>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a lifecycle listener for released/destroyed/truncated
    /// transitions and event-stream errors.
    pub fn on_lifecycle(&self, listener: MapLifecycleListener) {
        self.inner.lifecycle.add(listener);
    }
}

impl<K, V> NamedMap<K, V>
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Retrieve the value associated with `key`, or `None`.
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        self.inner.ensure_active()?;
        let key = self.inner.encode(key)?;
        let response = self.inner.executor.execute(&self.inner.factory.get(key)).await?;
        self.inner.decode_value(response.value)
    }

    /// Retrieve the entries for the given keys; missing keys are
    /// omitted.
    pub async fn get_all(&self, keys: &[K]) -> Result<Vec<(K, V)>> {
        self.inner.ensure_active()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys = keys.iter().map(|k| self.inner.encode(k)).collect::<Result<Vec<_>>>()?;
        let response = self.inner.executor.execute(&self.inner.factory.get_all(keys)).await?;
        self.decode_entries(response)
    }

    /// Associate `value` with `key`; returns the replaced value.
    pub async fn put(&self, key: K, value: V) -> Result<Option<V>> {
        self.put_with_ttl(key, value, Duration::ZERO).await
    }

    /// Associate `value` with `key` with an expiry. A zero TTL means the
    /// grid default.
    pub async fn put_with_ttl(&self, key: K, value: V, ttl: Duration) -> Result<Option<V>> {
        self.inner.ensure_active()?;
        let key = self.inner.encode(&key)?;
        let value = self.inner.encode(&value)?;
        let request = self.inner.factory.put(key, value, ttl.as_millis() as i64);
        let response = self.inner.executor.execute(&request).await?;
        self.inner.decode_value(response.value)
    }

    /// Associate `value` with `key` only when absent; returns the prior
    /// value (`None` means the insert happened).
    pub async fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        self.put_if_absent_with_ttl(key, value, Duration::ZERO).await
    }

    /// [`put_if_absent`](Self::put_if_absent) with an expiry.
    pub async fn put_if_absent_with_ttl(&self, key: K, value: V, ttl: Duration) -> Result<Option<V>> {
        self.inner.ensure_active()?;
        let key = self.inner.encode(&key)?;
        let value = self.inner.encode(&value)?;
        let request = self.inner.factory.put_if_absent(key, value, ttl.as_millis() as i64);
        let response = self.inner.executor.execute(&request).await?;
        self.inner.decode_value(response.value)
    }

    /// Store every entry of `entries`. An empty input is a no-op.
    pub async fn put_all(&self, entries: impl IntoIterator<Item = (K, V)>) -> Result<()> {
        self.put_all_with_ttl(entries, Duration::ZERO).await
    }

    /// [`put_all`](Self::put_all) with an expiry applied to every entry.
    pub async fn put_all_with_ttl(
        &self,
        entries: impl IntoIterator<Item = (K, V)>,
        ttl: Duration,
    ) -> Result<()> {
        self.inner.ensure_active()?;
        let mut encoded = Vec::new();
        for (key, value) in entries {
            encoded.push(CacheEntry::new(self.inner.encode(&key)?, self.inner.encode(&value)?));
        }
        if encoded.is_empty() {
            return Ok(());
        }
        let request = self.inner.factory.put_all(encoded, ttl.as_millis() as i64);
        self.inner.executor.execute(&request).await?;
        Ok(())
    }

    /// Remove the entry for `key`; returns the removed value.
    pub async fn remove(&self, key: &K) -> Result<Option<V>> {
        self.inner.ensure_active()?;
        let key = self.inner.encode(key)?;
        let response = self.inner.executor.execute(&self.inner.factory.remove(key)).await?;
        self.inner.decode_value(response.value)
    }

    /// Remove the entry only when it currently maps to `value`.
    pub async fn remove_mapping(&self, key: &K, value: &V) -> Result<bool> {
        self.inner.ensure_active()?;
        let key = self.inner.encode(key)?;
        let value = self.inner.encode(value)?;
        let response =
            self.inner.executor.execute(&self.inner.factory.remove_mapping(key, value)).await?;
        self.decode_flag(response)
    }

    /// Replace the entry only when present; returns the prior value.
    pub async fn replace(&self, key: &K, value: V) -> Result<Option<V>> {
        self.inner.ensure_active()?;
        let key = self.inner.encode(key)?;
        let value = self.inner.encode(&value)?;
        let response = self.inner.executor.execute(&self.inner.factory.replace(key, value)).await?;
        self.inner.decode_value(response.value)
    }

    /// Replace the entry only when it currently maps to `old_value`.
    pub async fn replace_mapping(&self, key: &K, old_value: &V, new_value: V) -> Result<bool> {
        self.inner.ensure_active()?;
        let key = self.inner.encode(key)?;
        let old_value = self.inner.encode(old_value)?;
        let new_value = self.inner.encode(&new_value)?;
        let request = self.inner.factory.replace_mapping(key, old_value, new_value);
        let response = self.inner.executor.execute(&request).await?;
        self.decode_flag(response)
    }

    /// Whether the map contains an entry for `key`.
    pub async fn contains_key(&self, key: &K) -> Result<bool> {
        self.inner.ensure_active()?;
        let key = self.inner.encode(key)?;
        let response = self.inner.executor.execute(&self.inner.factory.contains_key(key)).await?;
        self.decode_flag(response)
    }

    /// Whether any entry maps to `value`.
    pub async fn contains_value(&self, value: &V) -> Result<bool> {
        self.inner.ensure_active()?;
        let value = self.inner.encode(value)?;
        let response = self.inner.executor.execute(&self.inner.factory.contains_value(value)).await?;
        self.decode_flag(response)
    }

    /// Whether the map contains exactly the entry `(key, value)`.
    pub async fn contains_entry(&self, key: &K, value: &V) -> Result<bool> {
        self.inner.ensure_active()?;
        let key = self.inner.encode(key)?;
        let value = self.inner.encode(value)?;
        let response =
            self.inner.executor.execute(&self.inner.factory.contains_entry(key, value)).await?;
        self.decode_flag(response)
    }

    /// The number of entries in the map.
    pub async fn size(&self) -> Result<usize> {
        self.inner.ensure_active()?;
        let response = self.inner.executor.execute(&self.inner.factory.size()).await?;
        response
            .count
            .map(|count| count as usize)
            .ok_or_else(|| GridLinkError::Serialization("size response missing count".to_string()))
    }

    /// Whether the map has no entries.
    pub async fn is_empty(&self) -> Result<bool> {
        self.inner.ensure_active()?;
        let response = self.inner.executor.execute(&self.inner.factory.is_empty()).await?;
        self.decode_flag(response)
    }

    /// Remove every entry, observing per-entry semantics (listeners see
    /// individual deletions).
    pub async fn clear(&self) -> Result<()> {
        self.inner.ensure_active()?;
        self.inner.executor.execute(&self.inner.factory.clear()).await?;
        Ok(())
    }

    /// Remove every entry without per-entry events; emits the truncated
    /// lifecycle event instead.
    pub async fn truncate(&self) -> Result<()> {
        self.inner.ensure_active()?;
        self.inner.executor.execute(&self.inner.factory.truncate()).await?;
        // With an open event stream the grid delivers the truncated
        // notification there; otherwise surface it locally.
        let stream_open = {
            let guard = self.inner.dispatcher.lock().await;
            guard.as_ref().map(|d| d.is_open()).unwrap_or(false)
        };
        if !stream_open {
            self.inner.lifecycle.emit_truncated();
        }
        Ok(())
    }

    /// Lazily stream the keys matching `filter` (all keys when `None`).
    /// Pages are fetched as the stream is polled; ordering is
    /// unspecified.
    pub fn key_set(&self, filter: Option<&Filter>) -> Result<BoxStream<'static, Result<K>>> {
        let inner = self.inner.clone();
        self.query_stream(QueryKind::Keys, filter, move |item| {
            let payload = item
                .key
                .ok_or_else(|| GridLinkError::Serialization("query item missing key".to_string()))?;
            let json = inner.decode_json(&payload)?;
            serde_json::from_value(json).map_err(|e| GridLinkError::BadValue(e.to_string()))
        })
    }

    /// Lazily stream the entries matching `filter`.
    pub fn entry_set(&self, filter: Option<&Filter>) -> Result<BoxStream<'static, Result<(K, V)>>> {
        let inner = self.inner.clone();
        self.query_stream(QueryKind::Entries, filter, move |item| {
            let key = item
                .key
                .ok_or_else(|| GridLinkError::Serialization("query item missing key".to_string()))?;
            let value = item
                .value
                .ok_or_else(|| GridLinkError::Serialization("query item missing value".to_string()))?;
            let key = serde_json::from_value(inner.decode_json(&key)?)
                .map_err(|e| GridLinkError::BadValue(e.to_string()))?;
            let value = serde_json::from_value(inner.decode_json(&value)?)
                .map_err(|e| GridLinkError::BadValue(e.to_string()))?;
            Ok((key, value))
        })
    }

    /// Lazily stream the values matching `filter`.
    pub fn values(&self, filter: Option<&Filter>) -> Result<BoxStream<'static, Result<V>>> {
        let inner = self.inner.clone();
        self.query_stream(QueryKind::Values, filter, move |item| {
            let payload = item
                .value
                .ok_or_else(|| GridLinkError::Serialization("query item missing value".to_string()))?;
            let json = inner.decode_json(&payload)?;
            serde_json::from_value(json).map_err(|e| GridLinkError::BadValue(e.to_string()))
        })
    }

    fn query_stream<T, F>(
        &self,
        kind: QueryKind,
        filter: Option<&Filter>,
        decode: F,
    ) -> Result<BoxStream<'static, Result<T>>>
    where
        T: Send + 'static,
        F: Fn(QueryItem) -> Result<T> + Send + Sync + 'static,
    {
        self.inner.ensure_active()?;
        let filter = filter.map(|f| self.inner.factory.encode_filter(f)).transpose()?;
        let inner = self.inner.clone();

        struct PageState {
            inner: Arc<MapInner>,
            kind: QueryKind,
            filter: Option<Payload>,
            cursor: Option<String>,
            buffer: VecDeque<QueryItem>,
            done: bool,
        }

        let state = PageState {
            inner,
            kind,
            filter,
            cursor: None,
            buffer: VecDeque::new(),
            done: false,
        };

        let decode = Arc::new(decode);
        Ok(futures_util::stream::try_unfold(state, move |mut state| {
            let decode = decode.clone();
            async move {
                loop {
                    if let Some(item) = state.buffer.pop_front() {
                        let decoded = decode(item)?;
                        return Ok(Some((decoded, state)));
                    }
                    if state.done {
                        return Ok(None);
                    }
                    state.inner.ensure_active()?;
                    let request = state.inner.factory.query(
                        state.kind,
                        state.filter.clone(),
                        state.cursor.take(),
                    );
                    let response = state.inner.executor.execute(&request).await?;
                    let page = response.page.ok_or_else(|| {
                        GridLinkError::Serialization("query response missing page".to_string())
                    })?;
                    state.buffer.extend(page.items);
                    state.cursor = page.cursor;
                    state.done = page.complete || state.cursor.is_none();
                }
            }
        })
        .boxed())
    }

    /// Execute an entry processor against one entry.
    pub async fn invoke(&self, key: &K, processor: &Processor) -> Result<Option<JsonValue>> {
        self.inner.ensure_active()?;
        let key = self.inner.encode(key)?;
        let processor = self.inner.factory.encode_processor(processor)?;
        let response = self.inner.executor.execute(&self.inner.factory.invoke(key, processor)).await?;
        match response.value {
            Some(payload) if !payload.is_empty() => {
                let json = self.inner.decode_json(&payload)?;
                Ok(if json.is_null() { None } else { Some(json) })
            }
            _ => Ok(None),
        }
    }

    /// Execute an entry processor against the entries matching `filter`
    /// (all entries when `None`); returns `(key, result)` pairs.
    pub async fn invoke_all(
        &self,
        filter: Option<&Filter>,
        processor: &Processor,
    ) -> Result<Vec<(K, JsonValue)>> {
        self.inner.ensure_active()?;
        let filter = filter.map(|f| self.inner.factory.encode_filter(f)).transpose()?;
        let processor = self.inner.factory.encode_processor(processor)?;
        let request = self.inner.factory.invoke_all(None, filter, processor);
        let response = self.inner.executor.execute(&request).await?;
        self.decode_invocation_results(response)
    }

    /// Execute an entry processor against the given keys; returns
    /// `(key, result)` pairs.
    pub async fn invoke_all_keys(
        &self,
        keys: &[K],
        processor: &Processor,
    ) -> Result<Vec<(K, JsonValue)>> {
        self.inner.ensure_active()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys = keys.iter().map(|k| self.inner.encode(k)).collect::<Result<Vec<_>>>()?;
        let processor = self.inner.factory.encode_processor(processor)?;
        let request = self.inner.factory.invoke_all(Some(keys), None, processor);
        let response = self.inner.executor.execute(&request).await?;
        self.decode_invocation_results(response)
    }

    /// Create a server-side index over the extracted attribute.
    pub async fn add_index(
        &self,
        extractor: &ValueExtractor,
        sorted: bool,
        comparator: Option<&JsonValue>,
    ) -> Result<()> {
        self.inner.ensure_active()?;
        let extractor = self.inner.factory.encode_extractor(extractor)?;
        let comparator = comparator.map(|c| self.inner.factory.encode_value(c)).transpose()?;
        let request = self.inner.factory.add_index(extractor, sorted, comparator);
        self.inner.executor.execute(&request).await?;
        Ok(())
    }

    /// Drop the server-side index over the extracted attribute.
    pub async fn remove_index(&self, extractor: &ValueExtractor) -> Result<()> {
        self.inner.ensure_active()?;
        let extractor = self.inner.factory.encode_extractor(extractor)?;
        self.inner.executor.execute(&self.inner.factory.remove_index(extractor)).await?;
        Ok(())
    }

    // ── Listeners ───────────────────────────────────────────────────────

    /// Register a listener for changes to a single key. Completes when
    /// the grid acknowledges the subscription. `lite` subscriptions omit
    /// old/new values from delivered events.
    pub async fn add_key_listener(&self, listener: &MapListener, key: &K, lite: bool) -> Result<()> {
        self.inner.ensure_active()?;
        let key = self.inner.encode(key)?;
        self.inner
            .dispatcher()
            .await
            .add_listener(SubscriptionTarget::Key(key), listener.clone(), lite)
            .await
    }

    /// Remove a key listener. Completes when the grid acknowledges.
    pub async fn remove_key_listener(&self, listener: &MapListener, key: &K) -> Result<()> {
        self.inner.ensure_active()?;
        let key = self.inner.encode(key)?;
        self.inner
            .dispatcher()
            .await
            .remove_listener(SubscriptionTarget::Key(key), listener.id())
            .await
    }

    /// Register a listener for changes matching a filter.
    pub async fn add_filter_listener(
        &self,
        listener: &MapListener,
        filter: &Filter,
        lite: bool,
    ) -> Result<()> {
        self.inner.ensure_active()?;
        let filter = self.inner.factory.encode_filter(filter)?;
        self.inner
            .dispatcher()
            .await
            .add_listener(SubscriptionTarget::Filter(filter), listener.clone(), lite)
            .await
    }

    /// Remove a filter listener.
    pub async fn remove_filter_listener(&self, listener: &MapListener, filter: &Filter) -> Result<()> {
        self.inner.ensure_active()?;
        let filter = self.inner.factory.encode_filter(filter)?;
        self.inner
            .dispatcher()
            .await
            .remove_listener(SubscriptionTarget::Filter(filter), listener.id())
            .await
    }

    /// Register a listener for every change to the map. Equivalent to a
    /// filter listener on the always-matching filter.
    pub async fn add_map_listener(&self, listener: &MapListener, lite: bool) -> Result<()> {
        self.add_filter_listener(listener, &crate::filter::Filters::always(), lite).await
    }

    /// Remove a listener registered with
    /// [`add_map_listener`](Self::add_map_listener).
    pub async fn remove_map_listener(&self, listener: &MapListener) -> Result<()> {
        self.remove_filter_listener(listener, &crate::filter::Filters::always()).await
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Sever the event stream and drop this map from the session; the
    /// server-side cache is untouched. Idempotent. Further operations on
    /// any handle for this map fail with
    /// [`GridLinkError::CacheNotActive`].
    pub async fn release(&self) -> Result<()> {
        self.inner.release_internal().await
    }

    /// Destroy the cache grid-wide and drop this map from the session.
    /// Further operations fail with [`GridLinkError::CacheNotActive`].
    pub async fn destroy(&self) -> Result<()> {
        self.inner.ensure_active()?;
        self.inner.executor.execute(&self.inner.factory.destroy()).await?;
        if !self.inner.destroyed.swap(true, Ordering::SeqCst) {
            self.inner.lifecycle.emit_destroyed();
        }
        self.inner.close_dispatcher().await;
        self.inner.deregister();
        Ok(())
    }

    // ── Decoding helpers ────────────────────────────────────────────────

    fn decode_flag(&self, response: CacheResponse) -> Result<bool> {
        response
            .flag
            .ok_or_else(|| GridLinkError::Serialization("response missing flag".to_string()))
    }

    fn decode_entries(&self, response: CacheResponse) -> Result<Vec<(K, V)>> {
        let entries = response.entries.unwrap_or_default();
        let mut decoded = Vec::with_capacity(entries.len());
        for entry in entries {
            let key = serde_json::from_value(self.inner.decode_json(&entry.key)?)
                .map_err(|e| GridLinkError::BadValue(e.to_string()))?;
            let value = serde_json::from_value(self.inner.decode_json(&entry.value)?)
                .map_err(|e| GridLinkError::BadValue(e.to_string()))?;
            decoded.push((key, value));
        }
        Ok(decoded)
    }

    fn decode_invocation_results(&self, response: CacheResponse) -> Result<Vec<(K, JsonValue)>> {
        let entries = response.entries.unwrap_or_default();
        let mut decoded = Vec::with_capacity(entries.len());
        for entry in entries {
            let key = serde_json::from_value(self.inner.decode_json(&entry.key)?)
                .map_err(|e| GridLinkError::BadValue(e.to_string()))?;
            let result = if entry.value.is_empty() {
                JsonValue::Null
            } else {
                match self.inner.decode_json(&entry.value) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("[gridlink] Undecodable invocation result for cache {}: {}", self.inner.name, e);
                        JsonValue::Null
                    }
                }
            };
            decoded.push((key, result));
        }
        Ok(decoded)
    }
}
