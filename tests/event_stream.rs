//! Event-stream tests against an in-process mock grid.
//!
//! These tests run a minimal WebSocket endpoint that speaks the event
//! stream protocol (init/subscribe/unsubscribe acknowledgements plus
//! pushed events) and assert the wire traffic the client produces.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use futures_util::{SinkExt, StreamExt};
use gridlink::{Filters, GridLinkTimeouts, MapEvent, MapListener, Session};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

struct MockGrid {
    address: String,
    /// Every client message, in arrival order.
    log: Arc<Mutex<Vec<JsonValue>>>,
    /// Frames to push to the connected client.
    events_tx: broadcast::Sender<JsonValue>,
    connections: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
}

impl MockGrid {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock grid");
        let address = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (events_tx, _) = broadcast::channel(64);
        let connections = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let next_filter_id = Arc::new(AtomicU64::new(1));

        let grid = Self {
            address,
            log: log.clone(),
            events_tx: events_tx.clone(),
            connections: connections.clone(),
            disconnects: disconnects.clone(),
        };

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let ws = match accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => continue,
                };
                connections.fetch_add(1, Ordering::SeqCst);
                serve_connection(ws, &log, events_tx.subscribe(), &next_filter_id).await;
                disconnects.fetch_add(1, Ordering::SeqCst);
            }
        });

        grid
    }

    fn push(&self, frame: JsonValue) {
        let _ = self.events_tx.send(frame);
    }

    fn drop_connection(&self) {
        let _ = self.events_tx.send(json!("##close##"));
    }

    fn log_of_type(&self, message_type: &str) -> Vec<JsonValue> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m["type"] == message_type)
            .cloned()
            .collect()
    }

    fn subscription_log(&self) -> Vec<(String, Option<bool>)> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m["type"] != "init")
            .map(|m| {
                (
                    m["type"].as_str().unwrap_or_default().to_string(),
                    m["lite"].as_bool(),
                )
            })
            .collect()
    }

    fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }
}

async fn serve_connection(
    mut ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    log: &Arc<Mutex<Vec<JsonValue>>>,
    mut events: broadcast::Receiver<JsonValue>,
    next_filter_id: &Arc<AtomicU64>,
) {
    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(value) = serde_json::from_str::<JsonValue>(&text) else { continue };
                    log.lock().unwrap().push(value.clone());
                    let reply = match value["type"].as_str() {
                        Some("init") | Some("subscribe_key") => {
                            json!({"type": "subscribed", "id": value["id"]})
                        }
                        Some("subscribe_filter") => {
                            let filter_id = next_filter_id.fetch_add(1, Ordering::SeqCst);
                            json!({"type": "subscribed", "id": value["id"], "filter_id": filter_id})
                        }
                        Some("unsubscribe_key") | Some("unsubscribe_filter") => {
                            json!({"type": "unsubscribed", "id": value["id"]})
                        }
                        _ => continue,
                    };
                    if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            },
            event = events.recv() => {
                let Ok(value) = event else { continue };
                if value == json!("##close##") {
                    let _ = ws.close(None).await;
                    return;
                }
                if ws.send(Message::Text(value.to_string().into())).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn encoded(value: &JsonValue) -> String {
    general_purpose::STANDARD.encode(serde_json::to_vec(value).unwrap())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within deadline");
}

fn test_session(grid: &MockGrid) -> Session {
    Session::builder()
        .address(grid.address.clone())
        .timeouts(GridLinkTimeouts::fast())
        .build()
        .expect("session builds")
}

#[tokio::test]
async fn lite_transitions_produce_minimal_wire_traffic() {
    let grid = MockGrid::start().await;
    let session = test_session(&grid);
    let orders = session.map::<String, String>("orders").unwrap();

    let l1 = MapListener::new();
    let l2 = MapListener::new();
    let key = "k".to_string();

    // Lite registration opens the stream and subscribes lite.
    orders.add_key_listener(&l1, &key, true).await.unwrap();
    assert_eq!(
        grid.subscription_log(),
        vec![("subscribe_key".to_string(), Some(true))]
    );

    // A non-lite listener upgrades: unsubscribe, then subscribe non-lite.
    orders.add_key_listener(&l2, &key, false).await.unwrap();
    assert_eq!(
        grid.subscription_log(),
        vec![
            ("subscribe_key".to_string(), Some(true)),
            ("unsubscribe_key".to_string(), None),
            ("subscribe_key".to_string(), Some(false)),
        ]
    );

    // Removing the non-lite listener downgrades back to lite.
    orders.remove_key_listener(&l2, &key).await.unwrap();
    assert_eq!(
        grid.subscription_log(),
        vec![
            ("subscribe_key".to_string(), Some(true)),
            ("unsubscribe_key".to_string(), None),
            ("subscribe_key".to_string(), Some(false)),
            ("unsubscribe_key".to_string(), None),
            ("subscribe_key".to_string(), Some(true)),
        ]
    );

    // Removing the last listener unsubscribes and closes the stream.
    orders.remove_key_listener(&l1, &key).await.unwrap();
    wait_until(|| grid.disconnects.load(Ordering::SeqCst) == 1).await;
    let log = grid.subscription_log();
    assert_eq!(log.len(), 6);
    assert_eq!(log[5], ("unsubscribe_key".to_string(), None));

    session.close().await.unwrap();
}

#[tokio::test]
async fn events_fan_out_to_filter_and_key_listeners() {
    let grid = MockGrid::start().await;
    let session = test_session(&grid);
    let orders = session.map::<String, String>("orders").unwrap();

    let (filter_events_tx, mut filter_events) = tokio::sync::mpsc::unbounded_channel::<MapEvent>();
    let (key_events_tx, mut key_events) = tokio::sync::mpsc::unbounded_channel::<MapEvent>();

    let filter_listener = MapListener::new().on_inserted(move |event| {
        let _ = filter_events_tx.send(event.clone());
    });
    let key_listener = MapListener::new().on_inserted(move |event| {
        let _ = key_events_tx.send(event.clone());
    });

    orders
        .add_filter_listener(&filter_listener, &Filters::always(), false)
        .await
        .unwrap();
    orders.add_key_listener(&key_listener, &"a".to_string(), false).await.unwrap();

    // The mock assigned filter id 1 to the filter subscription.
    grid.push(json!({
        "type": "event",
        "kind": "inserted",
        "key": encoded(&json!("a")),
        "new_value": encoded(&json!("1")),
        "filter_ids": [1],
    }));

    let event = tokio::time::timeout(Duration::from_secs(2), filter_events.recv())
        .await
        .expect("filter listener fired")
        .unwrap();
    assert_eq!(event.key::<String>().unwrap(), "a");
    assert_eq!(event.new_value::<String>().unwrap(), Some("1".to_string()));
    assert_eq!(event.old_value::<String>().unwrap(), None);

    // The key-targeted listener fires for the same event, exactly once.
    let event = tokio::time::timeout(Duration::from_secs(2), key_events.recv())
        .await
        .expect("key listener fired")
        .unwrap();
    assert_eq!(event.key::<String>().unwrap(), "a");
    assert!(filter_events.try_recv().is_err());
    assert!(key_events.try_recv().is_err());

    session.close().await.unwrap();
}

#[tokio::test]
async fn events_preserve_server_order_per_listener() {
    let grid = MockGrid::start().await;
    let session = test_session(&grid);
    let orders = session.map::<String, String>("orders").unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let tx_insert = tx.clone();
    let listener = MapListener::new()
        .on_inserted(move |event| {
            let _ = tx_insert.send(format!("i:{}", event.new_value::<String>().unwrap().unwrap()));
        })
        .on_updated(move |event| {
            let _ = tx.send(format!("u:{}", event.new_value::<String>().unwrap().unwrap()));
        });

    orders.add_key_listener(&listener, &"a".to_string(), false).await.unwrap();

    for (kind, value) in [("inserted", "1"), ("updated", "2"), ("updated", "3")] {
        grid.push(json!({
            "type": "event",
            "kind": kind,
            "key": encoded(&json!("a")),
            "new_value": encoded(&json!(value)),
            "filter_ids": [],
        }));
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        let item = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event delivered")
            .unwrap();
        seen.push(item);
    }
    assert_eq!(seen, vec!["i:1", "u:2", "u:3"]);

    session.close().await.unwrap();
}

#[tokio::test]
async fn listeners_survive_stream_failure_and_resubscribe() {
    let grid = MockGrid::start().await;
    let session = test_session(&grid);
    let orders = session.map::<String, String>("orders").unwrap();

    let (error_tx, mut errors) = tokio::sync::mpsc::unbounded_channel::<String>();
    orders.on_lifecycle(gridlink::MapLifecycleListener::new().on_error(move |cache, error| {
        let _ = error_tx.send(format!("{}: {}", cache, error));
    }));

    let survivor = MapListener::new();
    orders.add_key_listener(&survivor, &"a".to_string(), false).await.unwrap();
    assert_eq!(grid.connections.load(Ordering::SeqCst), 1);

    // The grid drops the stream out from under the client: the
    // application must hear about it through the error hook.
    grid.drop_connection();
    wait_until(|| grid.disconnects.load(Ordering::SeqCst) == 1).await;
    let reported = tokio::time::timeout(Duration::from_secs(2), errors.recv())
        .await
        .expect("stream failure reported")
        .unwrap();
    assert!(reported.starts_with("orders:"));
    grid.clear_log();

    // The next registration rebuilds the stream and re-issues the
    // surviving subscription alongside the new one.
    let newcomer = MapListener::new();
    orders.add_key_listener(&newcomer, &"b".to_string(), false).await.unwrap();
    assert_eq!(grid.connections.load(Ordering::SeqCst), 2);

    wait_until(|| grid.log_of_type("subscribe_key").len() == 2).await;
    assert_eq!(grid.log_of_type("init").len(), 1);

    session.close().await.unwrap();
}

#[tokio::test]
async fn truncated_notification_reaches_lifecycle_listeners() {
    let grid = MockGrid::start().await;
    let session = test_session(&grid);
    let orders = session.map::<String, String>("orders").unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    orders.on_lifecycle(gridlink::MapLifecycleListener::new().on_truncated(move |cache| {
        let _ = tx.send(cache.to_string());
    }));

    // A listener opens the stream; the truncation arrives over it.
    let listener = MapListener::new();
    orders.add_key_listener(&listener, &"a".to_string(), false).await.unwrap();
    grid.push(json!({"type": "truncated"}));

    let cache = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("truncated delivered")
        .unwrap();
    assert_eq!(cache, "orders");

    session.close().await.unwrap();
}
