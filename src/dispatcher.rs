//! Event-stream dispatcher for a named map.
//!
//! Maintains exactly one duplex WebSocket stream per named map and at
//! most one active server subscription per distinct target (key or
//! filter), no matter how many application listeners are registered.
//! Handles:
//!
//! - Lazy stream establishment on the first listener registration
//! - Collapsing listeners onto the minimum set of server subscriptions,
//!   including lite/non-lite re-registration transitions
//! - Correlation of subscribe/unsubscribe acknowledgements by id
//! - Event fan-out on two indices: by canonical key and by
//!   server-assigned filter id
//! - Graceful stream close when the last listener is removed
//! - Stream-failure recovery: listener state is retained and every
//!   subscription is re-issued when the next registration rebuilds the
//!   stream
//!
//! A background task exclusively owns the stream and all dispatch state;
//! the public handle talks to it over a command channel. Listener
//! callbacks are invoked from the task with no lock held.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};

use crate::auth::AuthProvider;
use crate::codec::Codec;
use crate::error::{GridLinkError, Result};
use crate::listener::{LifecycleHub, MapEvent, MapListener};
use crate::models::{MapEventKind, Payload, StreamRequest, StreamResponse};
use crate::request::RequestFactory;
use crate::timeouts::GridLinkTimeouts;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Command channel depth; subscribe bursts beyond this suspend callers.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Maximum inbound text frame the dispatcher will parse.
const MAX_EVENT_TEXT_BYTES: usize = 16 << 20;

/// Sleep duration that will not overflow `Instant + Duration`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

// ── Targets ─────────────────────────────────────────────────────────────────

/// A listener target: one key or one filter, already encoded.
#[derive(Debug, Clone)]
pub(crate) enum SubscriptionTarget {
    /// A single encoded key.
    Key(Payload),
    /// An encoded filter tree.
    Filter(Payload),
}

impl SubscriptionTarget {
    /// Canonical index text: targets that encode identically share one
    /// listener group.
    fn canonical(&self) -> String {
        match self {
            Self::Key(payload) | Self::Filter(payload) => payload.canonical_text(),
        }
    }

    fn kind(&self) -> TargetKind {
        match self {
            Self::Key(_) => TargetKind::Key,
            Self::Filter(_) => TargetKind::Filter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetKind {
    Key,
    Filter,
}

// ── Commands ────────────────────────────────────────────────────────────────

/// Commands sent from the public handle to the background stream task.
enum StreamCmd {
    /// Register a listener for a target.
    Subscribe {
        target: SubscriptionTarget,
        listener: MapListener,
        lite: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Remove a listener from a target.
    Unsubscribe {
        target: SubscriptionTarget,
        listener_id: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Sever the stream and terminate the task.
    Shutdown { reply: oneshot::Sender<()> },
}

// ── Dispatch state ──────────────────────────────────────────────────────────

/// One listener registered in a group.
struct Registration {
    listener_id: u64,
    listener: MapListener,
    lite: bool,
}

/// Listeners collapsed onto one server subscription for one target.
struct ListenerGroup {
    target: SubscriptionTarget,
    /// Registered listeners in insertion order.
    listeners: Vec<Registration>,
    /// Whether an active server registration exists for this group.
    subscribed: bool,
    /// Lite flag of the active server registration. A single non-lite
    /// listener forces a non-lite registration: false < true.
    registered_lite: bool,
    /// Correlation id of the outstanding subscribe/re-register chain.
    pending_id: Option<String>,
    /// Server-assigned filter id (filter groups only).
    filter_id: Option<u64>,
}

impl ListenerGroup {
    fn new(target: SubscriptionTarget) -> Self {
        Self {
            target,
            listeners: Vec::new(),
            subscribed: false,
            registered_lite: false,
            pending_id: None,
            filter_id: None,
        }
    }

    /// The registration level this group needs: lite only when no
    /// listener requires values.
    fn desired_lite(&self) -> bool {
        self.listeners.iter().all(|r| r.lite)
    }
}

/// What to do when an acknowledgement arrives for a correlation id.
enum AckKind {
    /// A subscribe is outstanding; activate the group on ack.
    Subscribe {
        kind: TargetKind,
        canonical: String,
        target: SubscriptionTarget,
        lite: bool,
    },
    /// An unsubscribe issued to change the registration level; on ack,
    /// re-subscribe at the group's (re-computed) desired level.
    Reregister { kind: TargetKind, canonical: String },
    /// An unsubscribe issued because the last listener left; the group
    /// is already out of its index.
    UnsubscribeRemove,
}

struct PendingAck {
    on_ack: AckKind,
    replies: Vec<oneshot::Sender<Result<()>>>,
}

/// All dispatch bookkeeping, exclusively owned by the stream task.
///
/// Every mutation returns the wire messages it requires; pending
/// acknowledgement entries are inserted *before* the messages are handed
/// back for transmission, so a fast response can never race ahead of its
/// registration.
struct DispatchState {
    factory: Arc<RequestFactory>,
    by_key: HashMap<String, ListenerGroup>,
    by_filter: HashMap<String, ListenerGroup>,
    by_filter_id: HashMap<u64, String>,
    pending: HashMap<String, PendingAck>,
    /// Set before the task itself initiates a stream close. Observed by
    /// the stream-down handler to distinguish a requested close from a
    /// stream that died out from under the application.
    close_requested: bool,
}

impl DispatchState {
    fn new(factory: Arc<RequestFactory>) -> Self {
        Self {
            factory,
            by_key: HashMap::new(),
            by_filter: HashMap::new(),
            by_filter_id: HashMap::new(),
            pending: HashMap::new(),
            close_requested: false,
        }
    }

    fn index(&mut self, kind: TargetKind) -> &mut HashMap<String, ListenerGroup> {
        match kind {
            TargetKind::Key => &mut self.by_key,
            TargetKind::Filter => &mut self.by_filter,
        }
    }

    /// True when no listener group remains in either index.
    fn is_empty(&self) -> bool {
        self.by_key.is_empty() && self.by_filter.is_empty()
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Register a listener. Returns the messages to transmit; the reply
    /// is either completed immediately (no wire action needed) or
    /// attached to the outstanding acknowledgement.
    fn add_listener(
        &mut self,
        target: SubscriptionTarget,
        listener: MapListener,
        lite: bool,
        reply: oneshot::Sender<Result<()>>,
    ) -> Vec<StreamRequest> {
        let kind = target.kind();
        let canonical = target.canonical();
        let group = self
            .index(kind)
            .entry(canonical.clone())
            .or_insert_with(|| ListenerGroup::new(target));

        let listener_id = listener.id();
        match group.listeners.iter_mut().find(|r| r.listener_id == listener_id) {
            Some(existing) if existing.lite == lite => {
                // Same (listener, lite) pair: a no-op.
                let _ = reply.send(Ok(()));
                return Vec::new();
            }
            Some(existing) => existing.lite = lite,
            None => group.listeners.push(Registration { listener_id, listener, lite }),
        }

        self.settle(kind, &canonical, reply)
    }

    /// Remove a listener. `connected` is false while no stream is open,
    /// in which case no server registration exists to undo and removal
    /// is pure bookkeeping.
    fn remove_listener(
        &mut self,
        target: &SubscriptionTarget,
        listener_id: u64,
        connected: bool,
        reply: oneshot::Sender<Result<()>>,
    ) -> Vec<StreamRequest> {
        let kind = target.kind();
        let canonical = target.canonical();

        let Some(group) = self.index(kind).get_mut(&canonical) else {
            let _ = reply.send(Ok(()));
            return Vec::new();
        };
        let before = group.listeners.len();
        group.listeners.retain(|r| r.listener_id != listener_id);
        if group.listeners.len() == before {
            // Unknown listener for this target: nothing to undo.
            let _ = reply.send(Ok(()));
            return Vec::new();
        }

        if group.listeners.is_empty() {
            let group = self.index(kind).remove(&canonical).expect("group present");
            if let Some(filter_id) = group.filter_id {
                self.by_filter_id.remove(&filter_id);
            }

            if !connected || !group.subscribed {
                // No live server registration; if a subscribe chain is
                // still in flight its acknowledgement will find the
                // group gone and clean up after itself.
                let _ = reply.send(Ok(()));
                return Vec::new();
            }

            let message = match (&group.target, group.filter_id) {
                (SubscriptionTarget::Key(key), _) => self.factory.unsubscribe_key(key.clone()),
                (SubscriptionTarget::Filter(_), Some(filter_id)) => {
                    self.factory.unsubscribe_filter(filter_id)
                }
                (SubscriptionTarget::Filter(_), None) => {
                    let _ = reply.send(Ok(()));
                    return Vec::new();
                }
            };
            self.pending.insert(
                message.id().to_string(),
                PendingAck { on_ack: AckKind::UnsubscribeRemove, replies: vec![reply] },
            );
            return vec![message];
        }

        self.settle(kind, &canonical, reply)
    }

    /// Reconcile a group after a membership change and attach the reply
    /// to whatever acknowledgement will complete it.
    fn settle(
        &mut self,
        kind: TargetKind,
        canonical: &str,
        reply: oneshot::Sender<Result<()>>,
    ) -> Vec<StreamRequest> {
        if let Some(pending_id) = self.index(kind).get(canonical).and_then(|g| g.pending_id.clone()) {
            // A chain is already in flight; join it. The chain's
            // acknowledgement re-reconciles, picking up this change.
            if let Some(pending) = self.pending.get_mut(&pending_id) {
                pending.replies.push(reply);
                return Vec::new();
            }
        }
        let messages = self.reconcile(kind, canonical);
        match self.index(kind).get(canonical).and_then(|g| g.pending_id.clone()) {
            Some(pending_id) => {
                if let Some(pending) = self.pending.get_mut(&pending_id) {
                    pending.replies.push(reply);
                }
            }
            None => {
                let _ = reply.send(Ok(()));
            }
        }
        messages
    }

    /// Compare a group's desired registration with the server's and
    /// issue the transition, if any. Never stacks onto an in-flight
    /// chain.
    fn reconcile(&mut self, kind: TargetKind, canonical: &str) -> Vec<StreamRequest> {
        let factory = self.factory.clone();
        let Some(group) = self.index(kind).get_mut(canonical) else {
            return Vec::new();
        };
        if group.pending_id.is_some() || group.listeners.is_empty() {
            return Vec::new();
        }

        let desired_lite = group.desired_lite();
        if !group.subscribed {
            let message = match &group.target {
                SubscriptionTarget::Key(key) => factory.subscribe_key(key.clone(), desired_lite),
                SubscriptionTarget::Filter(filter) => {
                    factory.subscribe_filter(filter.clone(), desired_lite)
                }
            };
            let id = message.id().to_string();
            group.pending_id = Some(id.clone());
            let target = group.target.clone();
            self.pending.insert(
                id,
                PendingAck {
                    on_ack: AckKind::Subscribe {
                        kind,
                        canonical: canonical.to_string(),
                        target,
                        lite: desired_lite,
                    },
                    replies: Vec::new(),
                },
            );
            return vec![message];
        }

        if group.registered_lite != desired_lite {
            // Level change, either direction, is unsubscribe followed by
            // a fresh subscribe at the new level.
            let message = match (&group.target, group.filter_id) {
                (SubscriptionTarget::Key(key), _) => factory.unsubscribe_key(key.clone()),
                (SubscriptionTarget::Filter(_), Some(filter_id)) => {
                    factory.unsubscribe_filter(filter_id)
                }
                (SubscriptionTarget::Filter(_), None) => return Vec::new(),
            };
            let id = message.id().to_string();
            group.pending_id = Some(id.clone());
            self.pending.insert(
                id,
                PendingAck {
                    on_ack: AckKind::Reregister { kind, canonical: canonical.to_string() },
                    replies: Vec::new(),
                },
            );
            return vec![message];
        }

        Vec::new()
    }

    /// Process a `Subscribed` acknowledgement.
    fn handle_subscribed(&mut self, id: &str, filter_id: Option<u64>) -> Vec<StreamRequest> {
        let Some(pending) = self.pending.remove(id) else {
            debug!("[gridlink] Ignoring acknowledgement for unknown id {}", id);
            return Vec::new();
        };
        match pending.on_ack {
            AckKind::Subscribe { kind, canonical, target, lite } => {
                let registered = {
                    match self.index(kind).get_mut(&canonical) {
                        Some(group) => {
                            group.subscribed = true;
                            group.registered_lite = lite;
                            group.pending_id = None;
                            if kind == TargetKind::Filter {
                                if let Some(filter_id) = filter_id {
                                    group.filter_id = Some(filter_id);
                                }
                            }
                            true
                        }
                        None => false,
                    }
                };
                if !registered {
                    // The group vanished while the subscribe was in
                    // flight; undo the registration the server just made.
                    complete(pending.replies, || Ok(()));
                    let message = match (target, filter_id) {
                        (SubscriptionTarget::Key(key), _) => self.factory.unsubscribe_key(key),
                        (SubscriptionTarget::Filter(_), Some(filter_id)) => {
                            self.factory.unsubscribe_filter(filter_id)
                        }
                        (SubscriptionTarget::Filter(_), None) => return Vec::new(),
                    };
                    return vec![message];
                }
                if kind == TargetKind::Filter {
                    if let Some(filter_id) = filter_id {
                        self.by_filter_id.insert(filter_id, canonical.clone());
                    }
                }
                complete(pending.replies, || Ok(()));
                // Membership may have drifted while the chain was in
                // flight; reconcile picks up the difference.
                self.reconcile(kind, &canonical)
            }
            AckKind::Reregister { .. } | AckKind::UnsubscribeRemove => {
                warn!("[gridlink] Subscribed acknowledgement for an unsubscribe id {}", id);
                complete(pending.replies, || Ok(()));
                Vec::new()
            }
        }
    }

    /// Process an `Unsubscribed` acknowledgement.
    fn handle_unsubscribed(&mut self, id: &str) -> Vec<StreamRequest> {
        let Some(pending) = self.pending.remove(id) else {
            debug!("[gridlink] Ignoring acknowledgement for unknown id {}", id);
            return Vec::new();
        };
        match pending.on_ack {
            AckKind::Reregister { kind, canonical } => {
                let factory = self.factory.clone();
                let old_filter_id = match self.index(kind).get_mut(&canonical) {
                    Some(group) => {
                        group.subscribed = false;
                        group.filter_id.take()
                    }
                    None => {
                        // Every listener left while the chain was in
                        // flight; the server registration is gone, which
                        // is exactly the state an empty group wants.
                        complete(pending.replies, || Ok(()));
                        return Vec::new();
                    }
                };
                if let Some(old) = old_filter_id {
                    self.by_filter_id.remove(&old);
                }
                let group = self.index(kind).get_mut(&canonical).expect("group present");
                if group.listeners.is_empty() {
                    self.index(kind).remove(&canonical);
                    complete(pending.replies, || Ok(()));
                    return Vec::new();
                }
                // Re-subscribe at the level the group needs *now*, not
                // the level that started the chain.
                let desired_lite = group.desired_lite();
                let message = match &group.target {
                    SubscriptionTarget::Key(key) => factory.subscribe_key(key.clone(), desired_lite),
                    SubscriptionTarget::Filter(filter) => {
                        factory.subscribe_filter(filter.clone(), desired_lite)
                    }
                };
                let new_id = message.id().to_string();
                group.pending_id = Some(new_id.clone());
                let target = group.target.clone();
                self.pending.insert(
                    new_id,
                    PendingAck {
                        on_ack: AckKind::Subscribe { kind, canonical, target, lite: desired_lite },
                        replies: pending.replies,
                    },
                );
                vec![message]
            }
            AckKind::UnsubscribeRemove => {
                complete(pending.replies, || Ok(()));
                Vec::new()
            }
            AckKind::Subscribe { .. } => {
                warn!("[gridlink] Unsubscribed acknowledgement for a subscribe id {}", id);
                complete(pending.replies, || Ok(()));
                Vec::new()
            }
        }
    }

    /// Collect the listeners an event must reach: every group whose
    /// server filter id is attached to the event, plus the key-targeted
    /// group for the event's key. Each listener appears once per group
    /// membership, in group insertion order.
    fn listeners_for_event(&self, key_canonical: &str, filter_ids: &[u64]) -> Vec<MapListener> {
        let mut listeners = Vec::new();
        let mut seen_groups: HashSet<&str> = HashSet::new();
        for filter_id in filter_ids {
            if let Some(canonical) = self.by_filter_id.get(filter_id) {
                if seen_groups.insert(canonical.as_str()) {
                    if let Some(group) = self.by_filter.get(canonical) {
                        listeners.extend(group.listeners.iter().map(|r| r.listener.clone()));
                    }
                }
            }
        }
        if let Some(group) = self.by_key.get(key_canonical) {
            listeners.extend(group.listeners.iter().map(|r| r.listener.clone()));
        }
        listeners
    }

    /// Fail every outstanding acknowledgement; used when the stream
    /// dies. Listener groups are left intact so the next registration
    /// can rebuild.
    fn fail_all_pending(&mut self, error: impl Fn() -> GridLinkError) {
        for (_, pending) in self.pending.drain() {
            for reply in pending.replies {
                let _ = reply.send(Err(error()));
            }
        }
        for group in self.by_key.values_mut().chain(self.by_filter.values_mut()) {
            group.pending_id = None;
        }
    }

    /// After a stream rebuild, mark every group unregistered and issue
    /// fresh subscriptions for all of them. Stale server filter ids are
    /// dropped; the new acknowledgements repopulate the index.
    fn resubscribe_all(&mut self) -> Vec<StreamRequest> {
        self.by_filter_id.clear();
        let mut canonicals: Vec<(TargetKind, String)> = Vec::new();
        for (canonical, group) in self.by_key.iter_mut() {
            group.subscribed = false;
            group.pending_id = None;
            group.filter_id = None;
            canonicals.push((TargetKind::Key, canonical.clone()));
        }
        for (canonical, group) in self.by_filter.iter_mut() {
            group.subscribed = false;
            group.pending_id = None;
            group.filter_id = None;
            canonicals.push((TargetKind::Filter, canonical.clone()));
        }
        if !canonicals.is_empty() {
            debug!("[gridlink] Re-subscribing {} listener group(s)", canonicals.len());
        }
        let mut messages = Vec::new();
        for (kind, canonical) in canonicals {
            messages.extend(self.reconcile(kind, &canonical));
        }
        messages
    }
}

fn complete(replies: Vec<oneshot::Sender<Result<()>>>, result: impl Fn() -> Result<()>) {
    for reply in replies {
        let _ = reply.send(result());
    }
}

// ── Public handle ───────────────────────────────────────────────────────────

/// Stream-side configuration handed to the dispatcher by the session.
#[derive(Clone)]
pub(crate) struct StreamConfig {
    /// Event-stream endpoint, `ws(s)://host:port/v1/events`.
    pub ws_url: String,
    pub auth: AuthProvider,
    pub timeouts: GridLinkTimeouts,
    /// Client TLS config when the session runs over TLS.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

/// Handle to the background stream task of one named map.
pub(crate) struct MapEventDispatcher {
    cmd_tx: mpsc::Sender<StreamCmd>,
    stream_open: Arc<AtomicBool>,
    _task: JoinHandle<()>,
}

impl MapEventDispatcher {
    /// Spawn the background task. The stream itself is only opened when
    /// the first listener registers.
    pub(crate) fn spawn(
        factory: Arc<RequestFactory>,
        codec: Arc<dyn Codec>,
        lifecycle: LifecycleHub,
        destroyed: Arc<AtomicBool>,
        config: StreamConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let stream_open = Arc::new(AtomicBool::new(false));
        let open_flag = stream_open.clone();
        let task = tokio::spawn(async move {
            stream_task(cmd_rx, factory, codec, lifecycle, destroyed, config, open_flag).await;
        });
        Self { cmd_tx, stream_open, _task: task }
    }

    /// Whether the duplex stream is currently open.
    pub(crate) fn is_open(&self) -> bool {
        self.stream_open.load(Ordering::SeqCst)
    }

    /// Register a listener; completes when the server acknowledges the
    /// subscription (or immediately when no wire transition is needed).
    pub(crate) async fn add_listener(
        &self,
        target: SubscriptionTarget,
        listener: MapListener,
        lite: bool,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(StreamCmd::Subscribe { target, listener, lite, reply: reply_tx })
            .await
            .map_err(|_| GridLinkError::StreamClosed("event stream task is not running".to_string()))?;
        reply_rx
            .await
            .map_err(|_| GridLinkError::StreamClosed("event stream task died before acknowledging".to_string()))?
    }

    /// Remove a listener; completes when the server acknowledges the
    /// unsubscription (or immediately).
    pub(crate) async fn remove_listener(
        &self,
        target: SubscriptionTarget,
        listener_id: u64,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(StreamCmd::Unsubscribe { target, listener_id, reply: reply_tx })
            .await
            .map_err(|_| GridLinkError::StreamClosed("event stream task is not running".to_string()))?;
        reply_rx
            .await
            .map_err(|_| GridLinkError::StreamClosed("event stream task died before acknowledging".to_string()))?
    }

    /// Sever the stream and terminate the task. Idempotent; used by
    /// release, destroy, and session close.
    pub(crate) async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(StreamCmd::Shutdown { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

// ── Background task ─────────────────────────────────────────────────────────

/// Why the open-stream loop returned.
enum StreamExit {
    /// The stream died; `error` is `None` for a server-initiated clean
    /// close.
    Down { error: Option<GridLinkError> },
    /// The last listener group was removed; close gracefully.
    LastListenerRemoved,
    /// A shutdown command arrived.
    Shutdown { reply: oneshot::Sender<()> },
}

async fn stream_task(
    mut cmd_rx: mpsc::Receiver<StreamCmd>,
    factory: Arc<RequestFactory>,
    codec: Arc<dyn Codec>,
    lifecycle: LifecycleHub,
    destroyed: Arc<AtomicBool>,
    config: StreamConfig,
    stream_open: Arc<AtomicBool>,
) {
    let mut state = DispatchState::new(factory.clone());

    loop {
        // ── Idle: no stream. Removals are pure bookkeeping; the next
        // registration (re)builds the stream. ──
        let cmd = match cmd_rx.recv().await {
            Some(cmd) => cmd,
            None => return,
        };

        let (target, listener, lite, reply) = match cmd {
            StreamCmd::Shutdown { reply } => {
                let _ = reply.send(());
                return;
            }
            StreamCmd::Unsubscribe { target, listener_id, reply } => {
                // Without a stream there is no server registration to
                // undo; removal cannot produce wire messages.
                let _ = state.remove_listener(&target, listener_id, false, reply);
                continue;
            }
            StreamCmd::Subscribe { target, listener, lite, reply } => (target, listener, lite, reply),
        };

        let mut ws = match establish_stream(&config, &factory).await {
            Ok(ws) => ws,
            Err(e) => {
                // Bootstrap failed: the triggering registration fails and
                // retained groups wait for the next attempt.
                let _ = reply.send(Err(e));
                continue;
            }
        };
        stream_open.store(true, Ordering::SeqCst);
        state.close_requested = false;

        // Re-issue subscriptions for groups that survived a stream
        // failure, then the registration that triggered the build.
        let mut outbound = state.resubscribe_all();
        outbound.extend(state.add_listener(target, listener, lite, reply));

        let exit = match send_all(&mut ws, outbound).await {
            Err(e) => StreamExit::Down { error: Some(e) },
            Ok(()) => {
                run_open_stream(
                    &mut ws,
                    &mut cmd_rx,
                    &mut state,
                    &codec,
                    &lifecycle,
                    &destroyed,
                    &config.timeouts,
                )
                .await
            }
        };

        stream_open.store(false, Ordering::SeqCst);
        match exit {
            StreamExit::Down { error } => {
                state.fail_all_pending(|| {
                    GridLinkError::StreamClosed("event stream ended before acknowledgement".to_string())
                });
                if state.close_requested {
                    debug!("[gridlink] Event stream closed");
                } else {
                    // An unrequested stream end, clean or not, leaves the
                    // application without its subscriptions; surface it.
                    let e = error.unwrap_or_else(|| {
                        GridLinkError::StreamClosed("event stream ended unexpectedly".to_string())
                    });
                    warn!("[gridlink] Event stream failed: {}", e);
                    lifecycle.emit_error(&e);
                }
                // Listener groups are retained: the next registration
                // rebuilds the stream and re-subscribes them.
            }
            StreamExit::LastListenerRemoved => {
                state.fail_all_pending(|| {
                    GridLinkError::StreamClosed("event stream closing".to_string())
                });
                let _ = ws.close(None).await;
                debug!("[gridlink] Event stream closed (no listeners remain)");
            }
            StreamExit::Shutdown { reply } => {
                state.fail_all_pending(|| {
                    GridLinkError::StreamClosed("event stream shut down".to_string())
                });
                let _ = ws.close(None).await;
                let _ = reply.send(());
                return;
            }
        }
    }
}

/// Connect the WebSocket and run the init handshake.
async fn establish_stream(config: &StreamConfig, factory: &RequestFactory) -> Result<WsStream> {
    debug!("[gridlink] Establishing event stream to {}", config.ws_url);

    let mut request = config
        .ws_url
        .clone()
        .into_client_request()
        .map_err(|e| GridLinkError::Transport(format!("Failed to build stream request: {}", e)))?;
    config.auth.apply_to_ws_request(&mut request)?;

    let connector = config.tls.clone().map(Connector::Rustls);
    let connect = connect_async_tls_with_config(request, None, false, connector);
    let connect_result = if !GridLinkTimeouts::is_no_timeout(config.timeouts.connection_timeout) {
        match tokio::time::timeout(config.timeouts.connection_timeout, connect).await {
            Ok(result) => result,
            Err(_) => {
                return Err(GridLinkError::Timeout(format!(
                    "stream connection timeout ({:?})",
                    config.timeouts.connection_timeout
                )))
            }
        }
    } else {
        connect.await
    };
    let (mut ws, _) = connect_result
        .map_err(|e| GridLinkError::Transport(format!("stream connection failed: {}", e)))?;

    // Init handshake: the stream is usable once the grid acknowledges
    // the init id. No events can arrive before that — nothing is
    // subscribed yet.
    let init = factory.stream_init();
    let init_id = init.id().to_string();
    send_request(&mut ws, &init).await?;

    let ack = wait_for_init_ack(&mut ws, &init_id);
    let ack_result = if !GridLinkTimeouts::is_no_timeout(config.timeouts.subscribe_timeout) {
        match tokio::time::timeout(config.timeouts.subscribe_timeout, ack).await {
            Ok(result) => result,
            Err(_) => {
                let _ = ws.close(None).await;
                return Err(GridLinkError::Timeout(format!(
                    "stream init timeout ({:?})",
                    config.timeouts.subscribe_timeout
                )));
            }
        }
    } else {
        ack.await
    };
    match ack_result {
        Ok(()) => Ok(ws),
        Err(e) => {
            let _ = ws.close(None).await;
            Err(e)
        }
    }
}

async fn wait_for_init_ack(ws: &mut WsStream, init_id: &str) -> Result<()> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<StreamResponse>(&text) {
                Ok(StreamResponse::Subscribed { id, .. }) if id == init_id => return Ok(()),
                Ok(StreamResponse::Error { code, message }) => {
                    return Err(GridLinkError::Server { code, message })
                }
                Ok(other) => {
                    debug!("[gridlink] Ignoring pre-init message: {:?}", other);
                }
                Err(e) => {
                    return Err(GridLinkError::Serialization(format!(
                        "unparseable init acknowledgement: {}",
                        e
                    )))
                }
            },
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(GridLinkError::StreamClosed(
                    "stream ended during init handshake".to_string(),
                ))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(GridLinkError::Transport(e.to_string())),
        }
    }
}

async fn send_request(ws: &mut WsStream, request: &StreamRequest) -> Result<()> {
    let payload = serde_json::to_string(request)?;
    ws.send(Message::Text(payload.into()))
        .await
        .map_err(|e| GridLinkError::Transport(format!("failed to send stream request: {}", e)))
}

async fn send_all(ws: &mut WsStream, messages: Vec<StreamRequest>) -> Result<()> {
    for message in messages {
        send_request(ws, &message).await?;
    }
    Ok(())
}

/// The select loop over an open stream: commands, inbound frames, and
/// keepalive, mirroring the single-owner discipline of the idle loop.
async fn run_open_stream(
    ws: &mut WsStream,
    cmd_rx: &mut mpsc::Receiver<StreamCmd>,
    state: &mut DispatchState,
    codec: &Arc<dyn Codec>,
    lifecycle: &LifecycleHub,
    destroyed: &Arc<AtomicBool>,
    timeouts: &GridLinkTimeouts,
) -> StreamExit {
    let has_keepalive = !timeouts.keepalive_interval.is_zero();
    let keepalive_dur = if has_keepalive { timeouts.keepalive_interval } else { FAR_FUTURE };
    let has_pong_timeout = has_keepalive && !timeouts.pong_timeout.is_zero();
    let mut awaiting_pong = false;
    let mut idle_deadline = TokioInstant::now() + keepalive_dur;
    let mut pong_deadline = TokioInstant::now() + FAR_FUTURE;

    loop {
        let idle_sleep = tokio::time::sleep_until(idle_deadline);
        tokio::pin!(idle_sleep);
        let pong_sleep = tokio::time::sleep_until(pong_deadline);
        tokio::pin!(pong_sleep);

        tokio::select! {
            biased;

            // No frame since our Ping: the stream is dead.
            _ = &mut pong_sleep, if has_pong_timeout && awaiting_pong => {
                return StreamExit::Down {
                    error: Some(GridLinkError::Transport(format!(
                        "keepalive pong timeout ({:?})",
                        timeouts.pong_timeout
                    ))),
                };
            }

            cmd = cmd_rx.recv() => {
                let outbound = match cmd {
                    Some(StreamCmd::Subscribe { target, listener, lite, reply }) => {
                        state.add_listener(target, listener, lite, reply)
                    }
                    Some(StreamCmd::Unsubscribe { target, listener_id, reply }) => {
                        state.remove_listener(&target, listener_id, true, reply)
                    }
                    Some(StreamCmd::Shutdown { reply }) => {
                        state.close_requested = true;
                        return StreamExit::Shutdown { reply };
                    }
                    None => {
                        state.close_requested = true;
                        let (reply, _) = oneshot::channel();
                        return StreamExit::Shutdown { reply };
                    }
                };
                if let Err(e) = send_all(ws, outbound).await {
                    return StreamExit::Down { error: Some(e) };
                }
                if state.is_empty() && !state.has_pending() {
                    state.close_requested = true;
                    return StreamExit::LastListenerRemoved;
                }
            }

            _ = &mut idle_sleep, if has_keepalive && !awaiting_pong => {
                if let Err(e) = ws.send(Message::Ping(bytes::Bytes::new())).await {
                    return StreamExit::Down {
                        error: Some(GridLinkError::Transport(format!("keepalive ping failed: {}", e))),
                    };
                }
                if has_pong_timeout {
                    awaiting_pong = true;
                    pong_deadline = TokioInstant::now() + timeouts.pong_timeout;
                }
                idle_deadline = TokioInstant::now() + keepalive_dur;
            }

            frame = ws.next() => {
                // Any frame proves liveness.
                idle_deadline = TokioInstant::now() + keepalive_dur;
                if awaiting_pong {
                    awaiting_pong = false;
                    pong_deadline = TokioInstant::now() + FAR_FUTURE;
                }

                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_EVENT_TEXT_BYTES {
                            warn!("[gridlink] Dropping oversized stream frame ({} bytes)", text.len());
                            continue;
                        }
                        let response = match serde_json::from_str::<StreamResponse>(&text) {
                            Ok(response) => response,
                            Err(e) => {
                                warn!("[gridlink] Failed to parse stream frame: {}", e);
                                continue;
                            }
                        };
                        let outbound = handle_response(response, state, codec, lifecycle, destroyed);
                        if let Err(e) = send_all(ws, outbound).await {
                            return StreamExit::Down { error: Some(e) };
                        }
                        if state.is_empty() && !state.has_pending() {
                            state.close_requested = true;
                            return StreamExit::LastListenerRemoved;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        return StreamExit::Down { error: None };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return StreamExit::Down {
                            error: Some(GridLinkError::Transport(e.to_string())),
                        };
                    }
                }
            }
        }
    }
}

/// Route one inbound response. Listener callbacks run here, after every
/// index update is complete and with no lock held.
fn handle_response(
    response: StreamResponse,
    state: &mut DispatchState,
    codec: &Arc<dyn Codec>,
    lifecycle: &LifecycleHub,
    destroyed: &Arc<AtomicBool>,
) -> Vec<StreamRequest> {
    match response {
        StreamResponse::Subscribed { id, filter_id } => state.handle_subscribed(&id, filter_id),
        StreamResponse::Unsubscribed { id } => state.handle_unsubscribed(&id),
        StreamResponse::Event { kind, key, old_value, new_value, filter_ids } => {
            dispatch_event(state, codec, kind, key, old_value, new_value, filter_ids);
            Vec::new()
        }
        StreamResponse::Destroyed => {
            if !destroyed.swap(true, Ordering::SeqCst) {
                lifecycle.emit_destroyed();
            }
            Vec::new()
        }
        StreamResponse::Truncated => {
            lifecycle.emit_truncated();
            Vec::new()
        }
        StreamResponse::Error { code, message } => {
            lifecycle.emit_error(&GridLinkError::Server { code, message });
            Vec::new()
        }
    }
}

fn dispatch_event(
    state: &DispatchState,
    codec: &Arc<dyn Codec>,
    kind: MapEventKind,
    key: Payload,
    old_value: Option<Payload>,
    new_value: Option<Payload>,
    filter_ids: Vec<u64>,
) {
    let listeners = state.listeners_for_event(&key.canonical_text(), &filter_ids);
    if listeners.is_empty() {
        return;
    }

    let decoded_key = match codec.decode(key.as_bytes()) {
        Ok(value) => value,
        Err(e) => {
            warn!("[gridlink] Failed to decode event key: {}", e);
            return;
        }
    };
    let event = MapEvent {
        kind,
        key: decoded_key,
        old_value: decode_optional_payload(codec, old_value),
        new_value: decode_optional_payload(codec, new_value),
        filter_ids,
    };
    for listener in listeners {
        listener.emit(&event);
    }
}

fn decode_optional_payload(
    codec: &Arc<dyn Codec>,
    payload: Option<Payload>,
) -> Option<serde_json::Value> {
    let payload = payload?;
    if payload.is_empty() {
        return None;
    }
    match codec.decode(payload.as_bytes()) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("[gridlink] Failed to decode event value: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde_json::json;

    fn test_factory() -> Arc<RequestFactory> {
        Arc::new(RequestFactory::new("orders".to_string(), Arc::new(JsonCodec::new())))
    }

    fn key_target(key: &str) -> SubscriptionTarget {
        let codec = JsonCodec::new();
        SubscriptionTarget::Key(Payload::new(codec.encode(&json!(key)).unwrap()))
    }

    fn filter_target() -> SubscriptionTarget {
        let codec = JsonCodec::new();
        let filter = serde_json::to_value(crate::filter::Filters::always()).unwrap();
        SubscriptionTarget::Filter(Payload::new(codec.encode(&filter).unwrap()))
    }

    fn reply() -> (oneshot::Sender<Result<()>>, oneshot::Receiver<Result<()>>) {
        oneshot::channel()
    }

    fn ack_subscribe(state: &mut DispatchState, message: &StreamRequest) -> Vec<StreamRequest> {
        state.handle_subscribed(message.id(), None)
    }

    #[test]
    fn test_lite_upgrade_downgrade_message_sequence() {
        // Lite add, non-lite add, non-lite remove, final remove — the
        // wire sees exactly SUB(lite), UNSUB, SUB(non-lite), UNSUB,
        // SUB(lite), UNSUB.
        let mut state = DispatchState::new(test_factory());
        let l1 = MapListener::new();
        let l2 = MapListener::new();

        // add L1 lite
        let (tx, mut rx) = reply();
        let out = state.add_listener(key_target("k"), l1.clone(), true, tx);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], StreamRequest::SubscribeKey { lite: true, .. }));
        assert!(rx.try_recv().is_err(), "completes only on acknowledgement");
        let follow = ack_subscribe(&mut state, &out[0]);
        assert!(follow.is_empty());
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));

        // add L2 non-lite: upgrade chain
        let (tx, mut rx) = reply();
        let out = state.add_listener(key_target("k"), l2.clone(), false, tx);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], StreamRequest::UnsubscribeKey { .. }));
        let out = state.handle_unsubscribed(out[0].id());
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], StreamRequest::SubscribeKey { lite: false, .. }));
        assert!(rx.try_recv().is_err());
        ack_subscribe(&mut state, &out[0]);
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));

        // remove L2: downgrade chain back to lite
        let (tx, _rx) = reply();
        let out = state.remove_listener(&key_target("k"), l2.id(), true, tx);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], StreamRequest::UnsubscribeKey { .. }));
        let out = state.handle_unsubscribed(out[0].id());
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], StreamRequest::SubscribeKey { lite: true, .. }));
        ack_subscribe(&mut state, &out[0]);

        // remove L1: group drains, stream may close
        let (tx, mut rx) = reply();
        let out = state.remove_listener(&key_target("k"), l1.id(), true, tx);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], StreamRequest::UnsubscribeKey { .. }));
        assert!(!state.is_empty() || state.has_pending());
        let out = state.handle_unsubscribed(out[0].id());
        assert!(out.is_empty());
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
        assert!(state.is_empty() && !state.has_pending());
    }

    #[test]
    fn test_reregistration_is_noop() {
        let mut state = DispatchState::new(test_factory());
        let listener = MapListener::new();

        let (tx, _rx) = reply();
        let out = state.add_listener(key_target("k"), listener.clone(), false, tx);
        ack_subscribe(&mut state, &out[0]);

        let (tx, mut rx) = reply();
        let out = state.add_listener(key_target("k"), listener.clone(), false, tx);
        assert!(out.is_empty());
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn test_identical_encodings_share_one_group() {
        let mut state = DispatchState::new(test_factory());

        let (tx, _rx) = reply();
        let out = state.add_listener(key_target("k"), MapListener::new(), false, tx);
        assert_eq!(out.len(), 1);
        ack_subscribe(&mut state, &out[0]);

        // Second listener for an identically-encoded target: no wire
        // action, it joins the existing registration.
        let (tx, mut rx) = reply();
        let out = state.add_listener(key_target("k"), MapListener::new(), false, tx);
        assert!(out.is_empty());
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
        assert_eq!(state.by_key.len(), 1);
        assert_eq!(state.by_key.values().next().unwrap().listeners.len(), 2);
    }

    #[test]
    fn test_filter_ack_records_server_filter_id() {
        let mut state = DispatchState::new(test_factory());

        let (tx, _rx) = reply();
        let out = state.add_listener(filter_target(), MapListener::new(), false, tx);
        assert!(matches!(out[0], StreamRequest::SubscribeFilter { lite: false, .. }));
        state.handle_subscribed(out[0].id(), Some(7));

        assert_eq!(state.by_filter_id.len(), 1);
        let canonical = state.by_filter_id.get(&7).unwrap();
        assert_eq!(state.by_filter.get(canonical).unwrap().filter_id, Some(7));
    }

    #[test]
    fn test_fan_out_covers_filter_and_key_groups_exactly_once() {
        use std::sync::atomic::AtomicUsize;

        let mut state = DispatchState::new(test_factory());

        let filter_hits = Arc::new(AtomicUsize::new(0));
        let key_hits = Arc::new(AtomicUsize::new(0));

        let fh = filter_hits.clone();
        let (tx, _rx) = reply();
        let out = state.add_listener(
            filter_target(),
            MapListener::new().on_inserted(move |_| { fh.fetch_add(1, Ordering::Relaxed); }),
            false,
            tx,
        );
        state.handle_subscribed(out[0].id(), Some(7));

        let kh = key_hits.clone();
        let (tx, _rx) = reply();
        let out = state.add_listener(
            key_target("a"),
            MapListener::new().on_inserted(move |_| { kh.fetch_add(1, Ordering::Relaxed); }),
            false,
            tx,
        );
        ack_subscribe(&mut state, &out[0]);

        let codec = JsonCodec::new();
        let key = Payload::new(codec.encode(&json!("a")).unwrap());
        // Duplicate filter ids must not duplicate delivery.
        let listeners = state.listeners_for_event(&key.canonical_text(), &[7, 7]);
        assert_eq!(listeners.len(), 2);

        let event = MapEvent {
            kind: MapEventKind::Inserted,
            key: json!("a"),
            old_value: None,
            new_value: Some(json!("1")),
            filter_ids: vec![7],
        };
        for listener in listeners {
            listener.emit(&event);
        }
        assert_eq!(filter_hits.load(Ordering::Relaxed), 1);
        assert_eq!(key_hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_fan_out_preserves_insertion_order() {
        let mut state = DispatchState::new(test_factory());
        let first = MapListener::new();
        let second = MapListener::new();

        let (tx, _rx) = reply();
        let out = state.add_listener(key_target("k"), first.clone(), false, tx);
        ack_subscribe(&mut state, &out[0]);
        let (tx, _rx) = reply();
        state.add_listener(key_target("k"), second.clone(), false, tx);

        let codec = JsonCodec::new();
        let key = Payload::new(codec.encode(&json!("k")).unwrap());
        let listeners = state.listeners_for_event(&key.canonical_text(), &[]);
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[0].id(), first.id());
        assert_eq!(listeners[1].id(), second.id());
    }

    #[test]
    fn test_stream_failure_fails_pending_and_keeps_groups() {
        let mut state = DispatchState::new(test_factory());

        let (tx, mut rx) = reply();
        let out = state.add_listener(key_target("k"), MapListener::new(), false, tx);
        assert_eq!(out.len(), 1);

        state.fail_all_pending(|| GridLinkError::StreamClosed("gone".to_string()));
        match rx.try_recv() {
            Ok(Err(GridLinkError::StreamClosed(_))) => {}
            other => panic!("expected StreamClosed, got {:?}", other),
        }
        assert!(!state.has_pending());
        // The listener survives for the rebuild.
        assert_eq!(state.by_key.len(), 1);

        let out = state.resubscribe_all();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], StreamRequest::SubscribeKey { lite: false, .. }));
    }

    #[test]
    fn test_offline_removal_is_pure_bookkeeping() {
        let mut state = DispatchState::new(test_factory());
        let listener = MapListener::new();

        let (tx, _rx) = reply();
        let out = state.add_listener(key_target("k"), listener.clone(), false, tx);
        assert_eq!(out.len(), 1);
        state.fail_all_pending(|| GridLinkError::StreamClosed("gone".to_string()));

        let (tx, mut rx) = reply();
        let out = state.remove_listener(&key_target("k"), listener.id(), false, tx);
        assert!(out.is_empty());
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
        assert!(state.is_empty());
    }

    #[test]
    fn test_join_during_inflight_chain_reconciles_on_ack() {
        let mut state = DispatchState::new(test_factory());

        // First registration, subscribe(lite) in flight.
        let (tx, _rx) = reply();
        let out = state.add_listener(key_target("k"), MapListener::new(), true, tx);
        assert!(matches!(out[0], StreamRequest::SubscribeKey { lite: true, .. }));

        // A non-lite listener joins before the acknowledgement: no new
        // message yet.
        let (tx, _rx) = reply();
        let joined = state.add_listener(key_target("k"), MapListener::new(), false, tx);
        assert!(joined.is_empty());

        // The lite acknowledgement lands; reconciliation upgrades.
        let follow = ack_subscribe(&mut state, &out[0]);
        assert_eq!(follow.len(), 1);
        assert!(matches!(follow[0], StreamRequest::UnsubscribeKey { .. }));
        let follow = state.handle_unsubscribed(follow[0].id());
        assert_eq!(follow.len(), 1);
        assert!(matches!(follow[0], StreamRequest::SubscribeKey { lite: false, .. }));
    }
}
