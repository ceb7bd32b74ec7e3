//! End-to-end tests against an in-process WebSocket server speaking the
//! textual flavor.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use gyre::{Client, ClientError, Config, ExponentialBackoff, Status, SubscriptionStatus};

// ---------------------------------------------------------------------------
// Mock server
// ---------------------------------------------------------------------------

/// What the server does with one decoded command.
enum Action {
    Result(Value),
    Error { code: u32, message: String },
    Ignore,
    Drop,
}

type Pusher = mpsc::UnboundedSender<String>;
type ReplyFn = dyn Fn(i64, u64, Value, &Pusher) -> Action + Send + Sync;

struct MockServer {
    url: String,
    push_tx: Pusher,
    connections: Arc<AtomicUsize>,
}

impl MockServer {
    /// Inject a raw frame into the currently served connection.
    fn push(&self, frame: Value) {
        let _ = self.push_tx.send(frame.to_string());
    }
}

/// Serve one WebSocket connection at a time, answering each command through
/// `reply`. New connections are accepted as old ones die, which is what the
/// reconnect tests rely on.
async fn start_server(reply: impl Fn(i64, u64, Value, &Pusher) -> Action + Send + Sync + 'static) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();
    let connections = Arc::new(AtomicUsize::new(0));

    let reply: Arc<ReplyFn> = Arc::new(reply);
    let conns = Arc::clone(&connections);
    let pusher = push_tx.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            conns.fetch_add(1, Ordering::SeqCst);

            loop {
                tokio::select! {
                    frame = ws.next() => {
                        let text = match frame {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(_)) => break,
                        };
                        let cmd: Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        let id = cmd["id"].as_u64().unwrap_or(0);
                        let method = cmd["method"].as_i64().unwrap_or(-1);
                        match reply(method, id, cmd["params"].clone(), &pusher) {
                            Action::Result(result) => {
                                let frame = json!({"id": id, "result": result});
                                let _ = ws.send(Message::Text(frame.to_string())).await;
                            }
                            Action::Error { code, message } => {
                                let frame = json!({
                                    "id": id,
                                    "error": {"code": code, "message": message},
                                });
                                let _ = ws.send(Message::Text(frame.to_string())).await;
                            }
                            Action::Ignore => {}
                            Action::Drop => {
                                let _ = ws.close(None).await;
                                break;
                            }
                        }
                    }
                    push = push_rx.recv() => {
                        match push {
                            Some(frame) => {
                                let _ = ws.send(Message::Text(frame)).await;
                            }
                            None => break,
                        }
                    }
                }
            }
        }
    });

    MockServer {
        url: format!("ws://{addr}/connection"),
        push_tx,
        connections,
    }
}

/// Replies every well-behaved server gives: connect, subscribe, publish,
/// unsubscribe and ping all succeed.
fn default_reply(method: i64, _id: u64, _params: Value, _push: &Pusher) -> Action {
    match method {
        0 => Action::Result(json!({"client": "client-1", "version": "0.0.0"})),
        1 | 2 | 3 | 7 => Action::Result(json!({})),
        _ => Action::Ignore,
    }
}

fn fast_config() -> Config {
    Config::default()
        .read_timeout(Duration::from_secs(2))
        .backoff(ExponentialBackoff {
            initial_delay: Duration::from_millis(30),
            max_delay: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.0,
            max_attempts: None,
        })
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_reports_client_id() {
    let server = start_server(default_reply).await;
    let client = Client::json(&server.url, fast_config()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on_connect(move |e| {
        let _ = tx.send(e.client_id);
    });

    client.connect().await.unwrap();
    let client_id = recv(&mut rx).await;
    assert_eq!(client_id, "client-1");
    assert_eq!(client.status(), Status::Connected);
    assert_eq!(client.client_id(), "client-1");

    client.close().await.unwrap();
}

#[tokio::test]
async fn dial_failure_surfaces_error_and_reconnects() {
    // Nothing listens on port 9 of localhost.
    let client = Client::json("ws://127.0.0.1:9/connection", fast_config()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on_error(move |e| {
        let _ = tx.send(e.error);
    });

    let result = client.connect().await;
    assert!(matches!(result, Err(ClientError::Transport { .. })));
    assert_eq!(client.status(), Status::Reconnecting);

    // The reconnect scheduler keeps trying and reports each failure.
    let error = recv(&mut rx).await;
    assert!(matches!(error, ClientError::Transport { .. }));

    client.close().await.unwrap();
    assert_eq!(client.status(), Status::Closed);
}

#[tokio::test]
async fn clean_disconnect_fires_event_once() {
    let server = start_server(default_reply).await;
    let client = Client::json(&server.url, fast_config()).unwrap();

    let disconnects = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let counter = Arc::clone(&disconnects);
    client.on_disconnect(move |e| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(e.reconnect);
    });

    client.connect().await.unwrap();
    client.disconnect().await.unwrap();

    let reconnect = recv(&mut rx).await;
    assert!(!reconnect);
    assert_eq!(client.status(), Status::Disconnected);
    assert!(client.client_id().is_empty());

    // Repeated disconnect is a no-op.
    client.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn subscribe_receives_publications() {
    let server = start_server(|method, _id, params, push| match method {
        0 => Action::Result(json!({"client": "client-1"})),
        1 => Action::Result(json!({})),
        3 => {
            // Echo the publication back to the channel.
            let _ = push.send(
                json!({
                    "result": {
                        "type": 0,
                        "channel": params["channel"],
                        "data": {
                            "data": params["data"],
                            "offset": 1,
                            "info": {"client": "client-1", "user": "u-1"},
                        },
                    }
                })
                .to_string(),
            );
            Action::Result(json!({}))
        }
        7 => Action::Result(json!({})),
        _ => Action::Ignore,
    })
    .await;

    let client = Client::json(&server.url, fast_config()).unwrap();
    client.connect().await.unwrap();

    let sub = client.new_subscription("test").unwrap();
    let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
    sub.on_subscribe(move |_| {
        let _ = sub_tx.send(());
    });
    let (pub_tx, mut pub_rx) = mpsc::unbounded_channel();
    sub.on_publication(move |e| {
        let _ = pub_tx.send(e);
    });

    sub.subscribe().await.unwrap();
    recv(&mut sub_rx).await;

    let msg = br#"{"unique":"m-42"}"#.to_vec();
    client.publish("test", msg.clone()).await.unwrap();

    let event = recv(&mut pub_rx).await;
    assert_eq!(event.data, msg);
    assert!(event.info.is_some(), "expected publication info");
    assert_eq!(event.offset, 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn subscription_opened_before_connect_subscribes_on_connect() {
    let server = start_server(default_reply).await;
    let client = Client::json(&server.url, fast_config()).unwrap();

    let sub = client.new_subscription("early").unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    sub.on_subscribe(move |_| {
        let _ = tx.send(());
    });

    // Nothing is on the wire yet; the command goes out once connected.
    sub.subscribe().await.unwrap();
    assert_eq!(sub.status(), SubscriptionStatus::Subscribing);

    client.connect().await.unwrap();
    recv(&mut rx).await;
    assert_eq!(sub.status(), SubscriptionStatus::Subscribed);

    client.close().await.unwrap();
}

#[tokio::test]
async fn unsubscribe_fires_event() {
    let server = start_server(default_reply).await;
    let client = Client::json(&server.url, fast_config()).unwrap();
    client.connect().await.unwrap();

    let sub = client.new_subscription("test").unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    sub.on_unsubscribe(move |_| {
        let _ = tx.send(());
    });

    sub.subscribe().await.unwrap();
    sub.unsubscribe().await.unwrap();
    recv(&mut rx).await;

    client.close().await.unwrap();
}

#[tokio::test]
async fn presence_and_history_surface_not_available() {
    let server = start_server(|method, _id, _params, _push| match method {
        0 => Action::Result(json!({"client": "client-1"})),
        4 | 5 | 6 => Action::Error {
            code: 108,
            message: "not available".to_string(),
        },
        7 => Action::Result(json!({})),
        _ => Action::Ignore,
    })
    .await;

    let client = Client::json(&server.url, fast_config()).unwrap();
    client.connect().await.unwrap();

    for result in [
        client.presence("test").await.map(|_| ()),
        client.presence_stats("test").await.map(|_| ()),
        client.history("test").await.map(|_| ()),
    ] {
        match result {
            Err(ClientError::Protocol { code, .. }) => assert_eq!(code, 108),
            other => panic!("expected protocol error 108, got {other:?}"),
        }
    }

    client.close().await.unwrap();
}

#[tokio::test]
async fn rpc_round_trip() {
    let server = start_server(|method, _id, params, _push| match method {
        0 => Action::Result(json!({"client": "client-1"})),
        9 => Action::Result(json!({"data": params["data"]})),
        7 => Action::Result(json!({})),
        _ => Action::Ignore,
    })
    .await;

    let client = Client::json(&server.url, fast_config()).unwrap();
    client.connect().await.unwrap();

    let payload = br#"{"args":[1,2],"op":"sum"}"#.to_vec();
    let result = client.rpc(payload.clone()).await.unwrap();
    assert_eq!(result, payload);

    client.close().await.unwrap();
}

#[tokio::test]
async fn unanswered_request_times_out_without_disconnect() {
    let server = start_server(|method, _id, _params, _push| match method {
        0 => Action::Result(json!({"client": "client-1"})),
        9 => Action::Ignore,
        7 => Action::Result(json!({})),
        _ => Action::Ignore,
    })
    .await;

    let config = fast_config().read_timeout(Duration::from_millis(200));
    let client = Client::json(&server.url, config).unwrap();
    client.connect().await.unwrap();

    let result = client.rpc(br#"{}"#.to_vec()).await;
    assert_eq!(result, Err(ClientError::Timeout));
    // A timeout does not by itself tear down the transport.
    assert_eq!(client.status(), Status::Connected);

    client.close().await.unwrap();
}

#[tokio::test]
async fn invalid_json_payload_fails_without_disconnect() {
    let server = start_server(default_reply).await;
    let client = Client::json(&server.url, fast_config()).unwrap();
    client.connect().await.unwrap();

    let result = client.publish("test", b"boom".to_vec()).await;
    assert!(matches!(result, Err(ClientError::Codec { .. })));
    assert_eq!(client.status(), Status::Connected);

    client.close().await.unwrap();
}

#[tokio::test]
async fn reconnects_and_resubscribes_after_connection_loss() {
    let server = start_server(|method, _id, params, _push| match method {
        0 => Action::Result(json!({"client": "client-1"})),
        1 => Action::Result(json!({"epoch": "e1", "offset": 7, "recoverable": true})),
        7 => Action::Result(json!({})),
        9 if params["data"] == json!({"kill": true}) => Action::Drop,
        _ => Action::Ignore,
    })
    .await;

    let client = Client::json(&server.url, fast_config()).unwrap();

    let (connect_tx, mut connect_rx) = mpsc::unbounded_channel();
    client.on_connect(move |_| {
        let _ = connect_tx.send(());
    });

    client.connect().await.unwrap();
    recv(&mut connect_rx).await;

    let sub = client.new_subscription("test").unwrap();
    let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
    sub.on_subscribe(move |e| {
        let _ = sub_tx.send(e.resubscribed);
    });
    sub.subscribe().await.unwrap();
    assert!(!recv(&mut sub_rx).await);

    // Kill the connection server-side; the reply never arrives.
    let _ = client.rpc(br#"{"kill":true}"#.to_vec()).await;

    // The client reconnects on its own and the subscription comes back.
    recv(&mut connect_rx).await;
    assert!(recv(&mut sub_rx).await, "expected resubscribed flag");
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);

    client.close().await.unwrap();
}

#[tokio::test]
async fn expired_token_is_refreshed_before_next_attempt() {
    let rejected = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&rejected);
    let server = start_server(move |method, _id, params, _push| match method {
        0 => {
            if !gate.swap(true, Ordering::SeqCst) {
                return Action::Error {
                    code: 109,
                    message: "token expired".to_string(),
                };
            }
            assert_eq!(params["token"], json!("fresh"));
            Action::Result(json!({"client": "client-2"}))
        }
        7 => Action::Result(json!({})),
        _ => Action::Ignore,
    })
    .await;

    let config = fast_config().token("stale");
    let client = Client::json(&server.url, config).unwrap();
    client.on_refresh(|_| Ok("fresh".to_string()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on_connect(move |e| {
        let _ = tx.send(e.client_id);
    });

    let result = client.connect().await;
    assert!(matches!(result, Err(ClientError::Protocol { code: 109, .. })));

    // The refreshed token carries the automatic reconnect through.
    assert_eq!(recv(&mut rx).await, "client-2");

    client.close().await.unwrap();
}

#[tokio::test]
async fn server_side_subscriptions_are_surfaced() {
    let server = start_server(|method, _id, _params, _push| match method {
        0 => Action::Result(json!({
            "client": "client-1",
            "subs": {
                "announcements": {
                    "recoverable": true,
                    "epoch": "e9",
                    "offset": 3,
                    "recovered": true,
                    "publications": [
                        {"data": {"text": "welcome"}, "offset": 3}
                    ],
                }
            }
        })),
        7 => Action::Result(json!({})),
        _ => Action::Ignore,
    })
    .await;

    let client = Client::json(&server.url, fast_config()).unwrap();

    let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
    client.on_server_subscribe(move |e| {
        let _ = sub_tx.send(e);
    });
    let (pub_tx, mut pub_rx) = mpsc::unbounded_channel();
    client.on_server_publish(move |e| {
        let _ = pub_tx.send(e);
    });

    client.connect().await.unwrap();

    let event = recv(&mut sub_rx).await;
    assert_eq!(event.channel, "announcements");
    assert!(!event.resubscribed);
    assert!(event.recovered);

    let event = recv(&mut pub_rx).await;
    assert_eq!(event.channel, "announcements");
    assert_eq!(event.publication.offset, 3);

    client.close().await.unwrap();
}

#[tokio::test]
async fn connection_message_push_reaches_handler() {
    let server = start_server(default_reply).await;
    let client = Client::json(&server.url, fast_config()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on_message(move |e| {
        let _ = tx.send(e.data);
    });

    client.connect().await.unwrap();
    server.push(json!({
        "result": {"type": 4, "data": {"data": {"note": "hi"}}}
    }));

    let data = recv(&mut rx).await;
    assert_eq!(data, br#"{"note":"hi"}"#.to_vec());

    client.close().await.unwrap();
}

#[tokio::test]
async fn missing_ping_reply_forces_reconnect() {
    let server = start_server(|method, _id, _params, _push| match method {
        0 => Action::Result(json!({"client": "client-1"})),
        7 => Action::Ignore,
        _ => Action::Ignore,
    })
    .await;

    let config = fast_config()
        .ping_interval(Duration::from_millis(100))
        .read_timeout(Duration::from_millis(150));
    let client = Client::json(&server.url, config).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on_disconnect(move |e| {
        let _ = tx.send((e.reason, e.reconnect));
    });

    client.connect().await.unwrap();

    let (reason, reconnect) = recv(&mut rx).await;
    assert_eq!(reason, "no ping");
    assert!(reconnect);

    client.close().await.unwrap();
}

#[tokio::test]
async fn close_resolves_pending_requests() {
    let server = start_server(|method, _id, _params, _push| match method {
        0 => Action::Result(json!({"client": "client-1"})),
        9 => Action::Ignore,
        7 => Action::Result(json!({})),
        _ => Action::Ignore,
    })
    .await;

    let client = Client::json(&server.url, fast_config()).unwrap();
    client.connect().await.unwrap();

    let racer = client.clone();
    let pending = tokio::spawn(async move { racer.rpc(br#"{}"#.to_vec()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.close().await.unwrap();

    let result = pending.await.unwrap();
    assert!(
        matches!(
            result,
            Err(ClientError::Disconnected) | Err(ClientError::Closed)
        ),
        "got {result:?}"
    );

    // Every later call fails terminally.
    assert_eq!(client.rpc(br#"{}"#.to_vec()).await, Err(ClientError::Closed));
}
