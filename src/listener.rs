//! Map listeners and change events.
//!
//! Provides callback-based hooks for observing a named map:
//!
//! - [`MapListener`]: per-entry change notifications (inserted, updated,
//!   deleted), registered against a key or a filter
//! - [`MapLifecycleListener`]: map-level lifecycle transitions
//!   (released, destroyed, truncated) and event-stream errors
//!
//! A `MapListener` is a *handle*: cloning preserves its identity, and
//! registration/deregistration compare handles, never callback contents.
//!
//! # Example
//!
//! ```rust,no_run
//! use gridlink::{MapListener, Session};
//!
//! # async fn example() -> gridlink::Result<()> {
//! let session = Session::builder().build()?;
//! let orders = session.map::<String, String>("orders")?;
//!
//! let listener = MapListener::new()
//!     .on_inserted(|event| println!("inserted: {:?}", event.key))
//!     .on_deleted(|event| println!("deleted: {:?}", event.key));
//!
//! orders.add_key_listener(&listener, &"o-1".to_string(), false).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::{GridLinkError, Result};
use crate::models::MapEventKind;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// A change notification delivered to registered listeners.
#[derive(Debug, Clone)]
pub struct MapEvent {
    /// What happened to the entry.
    pub kind: MapEventKind,
    /// Decoded key.
    pub key: JsonValue,
    /// Decoded previous value; `None` for inserts and for lite
    /// subscriptions.
    pub old_value: Option<JsonValue>,
    /// Decoded current value; `None` for deletes and for lite
    /// subscriptions.
    pub new_value: Option<JsonValue>,
    /// Server filter ids whose subscriptions matched this event.
    pub filter_ids: Vec<u64>,
}

impl MapEvent {
    /// Deserialize the key into an application type.
    pub fn key<K: DeserializeOwned>(&self) -> Result<K> {
        serde_json::from_value(self.key.clone()).map_err(|e| GridLinkError::BadValue(e.to_string()))
    }

    /// Deserialize the previous value into an application type.
    pub fn old_value<V: DeserializeOwned>(&self) -> Result<Option<V>> {
        decode_optional(&self.old_value)
    }

    /// Deserialize the current value into an application type.
    pub fn new_value<V: DeserializeOwned>(&self) -> Result<Option<V>> {
        decode_optional(&self.new_value)
    }
}

fn decode_optional<V: DeserializeOwned>(value: &Option<JsonValue>) -> Result<Option<V>> {
    match value {
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| GridLinkError::BadValue(e.to_string())),
        None => Ok(None),
    }
}

/// Type alias for entry-event callbacks.
pub type EntryCallback = Arc<dyn Fn(&MapEvent) + Send + Sync>;

/// Callbacks for entry-level change notifications.
///
/// All callbacks are optional; register only the ones you need. The
/// listener's identity is assigned at construction and survives
/// cloning, so the same handle can be registered against several
/// targets and removed again later.
#[derive(Clone)]
pub struct MapListener {
    id: u64,
    pub(crate) on_inserted: Option<EntryCallback>,
    pub(crate) on_updated: Option<EntryCallback>,
    pub(crate) on_deleted: Option<EntryCallback>,
}

impl MapListener {
    /// Create a new listener with no callbacks registered.
    pub fn new() -> Self {
        Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            on_inserted: None,
            on_updated: None,
            on_deleted: None,
        }
    }

    /// Identity of this listener handle.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Register a callback for inserted entries.
    pub fn on_inserted(mut self, f: impl Fn(&MapEvent) + Send + Sync + 'static) -> Self {
        self.on_inserted = Some(Arc::new(f));
        self
    }

    /// Register a callback for updated entries.
    pub fn on_updated(mut self, f: impl Fn(&MapEvent) + Send + Sync + 'static) -> Self {
        self.on_updated = Some(Arc::new(f));
        self
    }

    /// Register a callback for deleted entries.
    pub fn on_deleted(mut self, f: impl Fn(&MapEvent) + Send + Sync + 'static) -> Self {
        self.on_deleted = Some(Arc::new(f));
        self
    }

    /// Dispatch an event to the matching callback.
    pub(crate) fn emit(&self, event: &MapEvent) {
        let callback = match event.kind {
            MapEventKind::Inserted => &self.on_inserted,
            MapEventKind::Updated => &self.on_updated,
            MapEventKind::Deleted => &self.on_deleted,
        };
        if let Some(cb) = callback {
            cb(event);
        }
    }
}

impl fmt::Debug for MapListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapListener")
            .field("id", &self.id)
            .field("on_inserted", &self.on_inserted.is_some())
            .field("on_updated", &self.on_updated.is_some())
            .field("on_deleted", &self.on_deleted.is_some())
            .finish()
    }
}

/// Type alias for lifecycle callbacks that carry the cache name.
pub type LifecycleCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Type alias for the event-stream error callback.
pub type StreamErrorCallback = Arc<dyn Fn(&str, &GridLinkError) + Send + Sync>;

/// Callbacks for map-level lifecycle transitions.
#[derive(Clone, Default)]
pub struct MapLifecycleListener {
    pub(crate) on_released: Option<LifecycleCallback>,
    pub(crate) on_destroyed: Option<LifecycleCallback>,
    pub(crate) on_truncated: Option<LifecycleCallback>,
    pub(crate) on_error: Option<StreamErrorCallback>,
}

impl MapLifecycleListener {
    /// Create a new lifecycle listener with no callbacks registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked when the map handle is released.
    pub fn on_released(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_released = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when the cache is destroyed grid-wide.
    pub fn on_destroyed(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_destroyed = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when the cache is truncated.
    pub fn on_truncated(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_truncated = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked on event-stream failures.
    pub fn on_error(mut self, f: impl Fn(&str, &GridLinkError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for MapLifecycleListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapLifecycleListener")
            .field("on_released", &self.on_released.is_some())
            .field("on_destroyed", &self.on_destroyed.is_some())
            .field("on_truncated", &self.on_truncated.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Shared fan-out point for a map's lifecycle listeners.
///
/// Held by the map handle and by its event dispatcher; emission never
/// holds the registration lock while callbacks run.
#[derive(Clone)]
pub(crate) struct LifecycleHub {
    cache: String,
    listeners: Arc<std::sync::Mutex<Vec<MapLifecycleListener>>>,
}

impl LifecycleHub {
    pub(crate) fn new(cache: String) -> Self {
        Self { cache, listeners: Arc::new(std::sync::Mutex::new(Vec::new())) }
    }

    pub(crate) fn add(&self, listener: MapLifecycleListener) {
        self.listeners.lock().expect("lifecycle lock poisoned").push(listener);
    }

    fn snapshot(&self) -> Vec<MapLifecycleListener> {
        self.listeners.lock().expect("lifecycle lock poisoned").clone()
    }

    pub(crate) fn emit_released(&self) {
        for listener in self.snapshot() {
            if let Some(cb) = &listener.on_released {
                cb(&self.cache);
            }
        }
    }

    pub(crate) fn emit_destroyed(&self) {
        for listener in self.snapshot() {
            if let Some(cb) = &listener.on_destroyed {
                cb(&self.cache);
            }
        }
    }

    pub(crate) fn emit_truncated(&self) {
        for listener in self.snapshot() {
            if let Some(cb) = &listener.on_truncated {
                cb(&self.cache);
            }
        }
    }

    pub(crate) fn emit_error(&self, error: &GridLinkError) {
        for listener in self.snapshot() {
            if let Some(cb) = &listener.on_error {
                cb(&self.cache, error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listener_identity_survives_clone() {
        let listener = MapListener::new();
        let clone = listener.clone();
        assert_eq!(listener.id(), clone.id());
        assert_ne!(listener.id(), MapListener::new().id());
    }

    #[test]
    fn test_emit_dispatches_by_kind() {
        let inserted = Arc::new(AtomicUsize::new(0));
        let deleted = Arc::new(AtomicUsize::new(0));

        let i = inserted.clone();
        let d = deleted.clone();
        let listener = MapListener::new()
            .on_inserted(move |_| { i.fetch_add(1, Ordering::Relaxed); })
            .on_deleted(move |_| { d.fetch_add(1, Ordering::Relaxed); });

        let event = MapEvent {
            kind: MapEventKind::Inserted,
            key: json!("k"),
            old_value: None,
            new_value: Some(json!("v")),
            filter_ids: vec![],
        };
        listener.emit(&event);
        listener.emit(&MapEvent { kind: MapEventKind::Deleted, ..event.clone() });
        listener.emit(&MapEvent { kind: MapEventKind::Updated, ..event });

        assert_eq!(inserted.load(Ordering::Relaxed), 1);
        assert_eq!(deleted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_typed_accessors() {
        let event = MapEvent {
            kind: MapEventKind::Updated,
            key: json!("a"),
            old_value: Some(json!(1)),
            new_value: Some(json!(2)),
            filter_ids: vec![7],
        };
        assert_eq!(event.key::<String>().unwrap(), "a");
        assert_eq!(event.old_value::<i64>().unwrap(), Some(1));
        assert_eq!(event.new_value::<i64>().unwrap(), Some(2));
    }

    #[test]
    fn test_lifecycle_hub_fan_out() {
        let hub = LifecycleHub::new("orders".to_string());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        hub.add(MapLifecycleListener::new().on_truncated(move |cache| {
            assert_eq!(cache, "orders");
            c.fetch_add(1, Ordering::Relaxed);
        }));
        hub.emit_truncated();
        hub.emit_released();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
