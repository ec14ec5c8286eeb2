//! Grid session: the shared channel and the named-map registry.
//!
//! A [`Session`] owns one pooled HTTP channel to a grid endpoint plus
//! the registry of live named maps keyed by `(name, codec format)`.
//! Opening the same map name with the same format yields the same
//! underlying instance; a different format yields a distinct one.
//! Closing the session releases every live map in the order it was
//! opened, then drops the channel. Close is idempotent.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth::AuthProvider;
use crate::codec::{Codec, JsonCodec};
use crate::dispatcher::StreamConfig;
use crate::error::{GridLinkError, Result};
use crate::executor::RequestExecutor;
use crate::map::{MapInner, MapRegistry, NamedMap};
use crate::options::{SessionOptions, TlsOptions};
use crate::timeouts::GridLinkTimeouts;

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
}

/// Type alias for the session-closed callback.
pub type OnClosedCallback = Arc<dyn Fn() + Send + Sync>;

/// Type alias for the session error callback.
pub type OnSessionErrorCallback = Arc<dyn Fn(&GridLinkError) + Send + Sync>;

/// Session lifecycle event handlers.
///
/// All handlers are optional; register only the ones you need.
#[derive(Clone, Default)]
pub struct SessionEventHandlers {
    pub(crate) on_closed: Option<OnClosedCallback>,
    pub(crate) on_error: Option<OnSessionErrorCallback>,
}

impl SessionEventHandlers {
    /// Create empty handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked once when the session finishes
    /// closing.
    pub fn on_closed(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_closed = Some(Arc::new(f));
        self
    }

    /// Register a callback for errors the session swallows during
    /// teardown.
    pub fn on_error(mut self, f: impl Fn(&GridLinkError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for SessionEventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEventHandlers")
            .field("on_closed", &self.on_closed.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

struct SessionShared {
    options: SessionOptions,
    timeouts: GridLinkTimeouts,
    auth: AuthProvider,
    codec: Arc<dyn Codec>,
    http_client: reqwest::Client,
    base_url: String,
    ws_url: String,
    tls_ws: Option<Arc<rustls::ClientConfig>>,
    request_timeout: Option<Duration>,
    closed: Arc<AtomicBool>,
    phase: Mutex<Phase>,
    registry: Arc<MapRegistry>,
    handlers: SessionEventHandlers,
}

/// A logical session against one grid endpoint.
///
/// # Examples
///
/// ```rust,no_run
/// use gridlink::Session;
///
/// # async fn example() -> gridlink::Result<()> {
/// let session = Session::builder()
///     .address("localhost:1408")
///     .request_timeout(std::time::Duration::from_secs(30))
///     .build()?;
///
/// let orders = session.map::<String, String>("orders")?;
/// orders.put("o-1".to_string(), "pending".to_string()).await?;
///
/// session.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Create a new builder for configuring the session.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// The configured endpoint address.
    pub fn address(&self) -> &str {
        &self.shared.options.address
    }

    /// The session's default codec format.
    pub fn format(&self) -> &str {
        self.shared.codec.format()
    }

    /// Whether the session has been closed (or is closing).
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Obtain the named map `name` using the session's default codec.
    ///
    /// Maps are registered per `(name, format)`: the same pair always
    /// yields the same instance until it is released or destroyed.
    pub fn map<K, V>(&self, name: &str) -> Result<NamedMap<K, V>>
    where
        K: Serialize + DeserializeOwned + Send + Sync + 'static,
        V: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.map_with_codec(name, self.shared.codec.clone())
    }

    /// Obtain the named map `name` through a specific codec.
    pub fn map_with_codec<K, V>(&self, name: &str, codec: Arc<dyn Codec>) -> Result<NamedMap<K, V>>
    where
        K: Serialize + DeserializeOwned + Send + Sync + 'static,
        V: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(GridLinkError::SessionClosed);
        }

        let key = (name.to_string(), codec.format().to_string());
        let mut registry = self.shared.registry.lock().expect("map registry lock poisoned");
        // A destroy notification can defunct an entry without the
        // session noticing; such entries are replaced, not handed out.
        registry.retain(|(_, inner)| !inner.is_defunct());
        if let Some((_, inner)) = registry.iter().find(|(entry_key, _)| *entry_key == key) {
            return Ok(NamedMap::from_inner(inner.clone()));
        }

        let executor = RequestExecutor::new(
            self.shared.http_client.clone(),
            &self.shared.base_url,
            self.shared.auth.clone(),
            self.shared.request_timeout,
        );
        let stream_config = StreamConfig {
            ws_url: self.shared.ws_url.clone(),
            auth: self.shared.auth.clone(),
            timeouts: self.shared.timeouts.clone(),
            tls: self.shared.tls_ws.clone(),
        };
        let format = codec.format().to_string();
        let inner = Arc::new(MapInner::new(
            name.to_string(),
            codec,
            executor,
            stream_config,
            self.shared.closed.clone(),
            Arc::downgrade(&self.shared.registry),
        ));
        registry.push((key, inner.clone()));
        debug!("[gridlink] Opened named map '{}' (format={})", name, format);
        Ok(NamedMap::from_inner(inner))
    }

    /// Close the session: release every live named map in the order it
    /// was opened, then drop the channel.
    ///
    /// Idempotent; the first call performs the teardown and emits
    /// `closed` exactly once. Errors from individual releases are
    /// logged, reported through the session error handler, and
    /// swallowed — the channel is closed regardless.
    pub async fn close(&self) -> Result<()> {
        {
            let mut phase = self.shared.phase.lock().expect("session phase lock poisoned");
            if *phase != Phase::Open {
                return Ok(());
            }
            *phase = Phase::Closing;
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        debug!("[gridlink] Closing session to {}", self.shared.options.address);

        let maps: Vec<_> = {
            let registry = self.shared.registry.lock().expect("map registry lock poisoned");
            registry.iter().map(|(_, inner)| inner.clone()).collect()
        };
        for inner in maps {
            if let Err(e) = inner.release_internal().await {
                warn!("[gridlink] Error releasing a named map during close: {}", e);
                if let Some(cb) = &self.shared.handlers.on_error {
                    cb(&e);
                }
            }
        }
        self.shared.registry.lock().expect("map registry lock poisoned").clear();

        {
            let mut phase = self.shared.phase.lock().expect("session phase lock poisoned");
            *phase = Phase::Closed;
        }
        if let Some(cb) = &self.shared.handlers.on_closed {
            cb();
        }
        debug!("[gridlink] Session closed");
        Ok(())
    }
}

/// Builder for [`Session`] instances.
pub struct SessionBuilder {
    options: SessionOptions,
    timeouts: GridLinkTimeouts,
    auth: AuthProvider,
    codec: Option<Arc<dyn Codec>>,
    handlers: SessionEventHandlers,
}

impl SessionBuilder {
    fn new() -> Self {
        Self {
            options: SessionOptions::default(),
            timeouts: GridLinkTimeouts::default(),
            auth: AuthProvider::none(),
            codec: None,
            handlers: SessionEventHandlers::default(),
        }
    }

    /// Set the grid endpoint (`host:port`).
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.options.address = address.into();
        self
    }

    /// Set the unary request deadline. A zero duration means unbounded.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout_millis = timeout.as_millis() as i64;
        self.timeouts.request_timeout = timeout;
        self
    }

    /// Set the default codec format tag. Only meaningful together with
    /// [`codec`](Self::codec) for non-JSON formats.
    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.options.format = format.into();
        self
    }

    /// Set the session options wholesale.
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the TLS options.
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.options.tls = tls;
        self
    }

    /// Set authentication credentials.
    pub fn auth(mut self, auth: AuthProvider) -> Self {
        self.auth = auth;
        self
    }

    /// Set the full timeout configuration. This overrides
    /// [`request_timeout`](Self::request_timeout).
    pub fn timeouts(mut self, timeouts: GridLinkTimeouts) -> Self {
        self.options.request_timeout_millis = timeouts.request_timeout.as_millis() as i64;
        self.timeouts = timeouts;
        self
    }

    /// Inject a custom codec; its format tag becomes the session
    /// default.
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.options.format = codec.format().to_string();
        self.codec = Some(codec);
        self
    }

    /// Set the session lifecycle event handlers.
    pub fn event_handlers(mut self, handlers: SessionEventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Validate the configuration and construct the session. The
    /// configuration is immutable afterwards.
    pub fn build(self) -> Result<Session> {
        self.options.validate()?;

        let codec: Arc<dyn Codec> = match self.codec {
            Some(codec) => codec,
            None => {
                if self.options.format != crate::options::DEFAULT_FORMAT {
                    return Err(GridLinkError::BadConfig(format!(
                        "format '{}' requires an injected codec",
                        self.options.format
                    )));
                }
                Arc::new(JsonCodec::new())
            }
        };

        let tls_material = crate::tls::load(&self.options.tls)?;
        let secure = tls_material.is_some();
        let (http_scheme, ws_scheme) = if secure { ("https", "wss") } else { ("http", "ws") };
        let base_url = format!("{}://{}", http_scheme, self.options.address);
        let ws_url = format!("{}://{}/v1/events", ws_scheme, self.options.address);

        let request_timeout = if self.options.request_timeout_millis <= 0 {
            None
        } else {
            Some(Duration::from_millis(self.options.request_timeout_millis as u64))
        };

        let mut http_builder =
            reqwest::Client::builder().connect_timeout(self.timeouts.connection_timeout);
        if let Some(timeout) = request_timeout {
            http_builder = http_builder.timeout(timeout);
        }
        let tls_ws = match tls_material {
            Some(material) => {
                http_builder = http_builder
                    .use_rustls_tls()
                    .add_root_certificate(material.ca_certificate)
                    .identity(material.identity);
                Some(material.ws_client_config)
            }
            None => None,
        };
        let http_client = http_builder
            .build()
            .map_err(|e| GridLinkError::BadConfig(e.to_string()))?;

        Ok(Session {
            shared: Arc::new(SessionShared {
                options: self.options,
                timeouts: self.timeouts,
                auth: self.auth,
                codec,
                http_client,
                base_url,
                ws_url,
                tls_ws,
                request_timeout,
                closed: Arc::new(AtomicBool::new(false)),
                phase: Mutex::new(Phase::Open),
                registry: Arc::new(Mutex::new(Vec::new())),
                handlers: self.handlers,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_builder_defaults() {
        let session = Session::builder().build().unwrap();
        assert_eq!(session.address(), "localhost:1408");
        assert_eq!(session.format(), "json");
        assert!(!session.is_closed());
    }

    #[test]
    fn test_builder_rejects_bad_address() {
        let result = Session::builder().address("not an address").build();
        assert!(matches!(result, Err(GridLinkError::BadConfig(_))));
    }

    #[test]
    fn test_builder_rejects_incomplete_tls() {
        let result = Session::builder()
            .tls(TlsOptions::new().with_enabled(true))
            .build();
        assert!(matches!(result, Err(GridLinkError::BadConfig(_))));
    }

    #[test]
    fn test_builder_rejects_format_without_codec() {
        let result = Session::builder().format("portable").build();
        assert!(matches!(result, Err(GridLinkError::BadConfig(_))));
    }

    #[tokio::test]
    async fn test_map_registry_identity() {
        let session = Session::builder().build().unwrap();

        let a = session.map::<String, String>("orders").unwrap();
        let b = session.map::<String, String>("orders").unwrap();
        assert!(a.is_same(&b), "same (name, format) must be identity-equal");

        let c = session.map::<String, String>("payments").unwrap();
        assert_eq!(c.name(), "payments");
        assert!(!a.is_same(&c));
    }

    #[tokio::test]
    async fn test_released_map_is_reopened_fresh() {
        let session = Session::builder().build().unwrap();

        let a = session.map::<String, String>("orders").unwrap();
        a.release().await.unwrap();
        let b = session.map::<String, String>("orders").unwrap();
        assert!(!a.is_same(&b), "release must drop the registry entry");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_emits_once() {
        let emissions = Arc::new(AtomicUsize::new(0));
        let count = emissions.clone();
        let session = Session::builder()
            .event_handlers(SessionEventHandlers::new().on_closed(move || {
                count.fetch_add(1, Ordering::Relaxed);
            }))
            .build()
            .unwrap();

        let map = session.map::<String, String>("orders").unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(session.is_closed());
        assert_eq!(emissions.load(Ordering::Relaxed), 1);

        // Operations after close fail fast.
        let err = map.get(&"k".to_string()).await.unwrap_err();
        assert!(matches!(err, GridLinkError::SessionClosed));
        let err = session.map::<String, String>("orders").unwrap_err();
        assert!(matches!(err, GridLinkError::SessionClosed));
    }
}
