use serde::{Deserialize, Serialize};

use super::payload::Payload;

/// Event-stream messages sent from client to grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamRequest {
    /// Open the stream for one cache; must be the first message.
    Init {
        /// Correlation id.
        id: String,
        /// Cache the stream observes.
        cache: String,
        /// Codec format tag for event payloads.
        format: String,
    },

    /// Subscribe to events for a single key.
    SubscribeKey {
        /// Correlation id.
        id: String,
        /// Encoded key.
        key: Payload,
        /// Lite subscriptions omit old/new values from events.
        lite: bool,
        /// Priming subscriptions request an immediate synthetic event
        /// carrying the current value.
        priming: bool,
    },

    /// Cancel a key subscription.
    UnsubscribeKey {
        /// Correlation id.
        id: String,
        /// Encoded key.
        key: Payload,
    },

    /// Subscribe to events matching a filter.
    SubscribeFilter {
        /// Correlation id.
        id: String,
        /// Encoded filter tree.
        filter: Payload,
        /// Lite subscriptions omit old/new values from events.
        lite: bool,
    },

    /// Cancel a filter subscription by its server-assigned id.
    UnsubscribeFilter {
        /// Correlation id.
        id: String,
        /// Server-assigned filter id from the subscribe acknowledgement.
        filter_id: u64,
    },
}

impl StreamRequest {
    /// The correlation id carried by this request.
    pub fn id(&self) -> &str {
        match self {
            Self::Init { id, .. }
            | Self::SubscribeKey { id, .. }
            | Self::UnsubscribeKey { id, .. }
            | Self::SubscribeFilter { id, .. }
            | Self::UnsubscribeFilter { id, .. } => id,
        }
    }
}

/// Event-stream messages sent from grid to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamResponse {
    /// Acknowledges an init or subscribe request.
    Subscribed {
        /// Correlation id of the acknowledged request.
        id: String,
        /// Server-assigned filter id; present for filter subscribes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter_id: Option<u64>,
    },

    /// Acknowledges an unsubscribe request.
    Unsubscribed {
        /// Correlation id of the acknowledged request.
        id: String,
    },

    /// A change notification.
    Event {
        /// What happened to the entry.
        kind: MapEventKind,
        /// Encoded key.
        key: Payload,
        /// Encoded previous value; absent for inserts and lite
        /// subscriptions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_value: Option<Payload>,
        /// Encoded current value; absent for deletes and lite
        /// subscriptions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_value: Option<Payload>,
        /// Server filter ids whose subscriptions matched this event.
        #[serde(default)]
        filter_ids: Vec<u64>,
    },

    /// The cache was destroyed grid-wide.
    Destroyed,

    /// The cache was truncated.
    Truncated,

    /// Error notification.
    Error {
        /// Error code.
        code: String,
        /// Human-readable error message.
        message: String,
    },
}

/// The kind of change an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapEventKind {
    /// A new entry was inserted.
    Inserted,
    /// An existing entry's value changed.
    Updated,
    /// An entry was removed.
    Deleted,
}

impl std::fmt::Display for MapEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapEventKind::Inserted => write!(f, "inserted"),
            MapEventKind::Updated => write!(f, "updated"),
            MapEventKind::Deleted => write!(f, "deleted"),
        }
    }
}
