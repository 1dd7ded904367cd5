//! Exercises the dispatcher, session cache, and event streams against an
//! in-process mock CDP server instead of a real browser.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cdp_ctl::cdp::{CancelHandle, Connection, SessionManager};
use cdp_ctl::error::Error;
use cdp_ctl::ops;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// A handle to a spawned mock CDP server: its WebSocket URL, a channel to
/// push raw server-initiated frames (events) on demand, and a counter of
/// `Target.attachToTarget` calls it has answered (used to assert the
/// session cache avoids redundant round trips).
struct MockHandle {
    ws_url: String,
    push_tx: mpsc::UnboundedSender<String>,
    attach_calls: Arc<AtomicUsize>,
    query_calls: Arc<AtomicUsize>,
}

/// Spawn a one-shot mock CDP server. Answers the handful of methods the
/// dispatcher/session/ops layers issue in these tests; `query_calls`
/// controls `DOM.querySelector`: the first `query_miss_count` calls return
/// `nodeId: 0` (not found), then it returns `nodeId: 7`.
async fn spawn_mock(query_miss_count: usize, silent_methods: &'static [&'static str]) -> MockHandle {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock listener");
    let addr = listener.local_addr().expect("local addr");
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();
    let attach_calls = Arc::new(AtomicUsize::new(0));
    let query_calls = Arc::new(AtomicUsize::new(0));
    let attach_calls_bg = attach_calls.clone();
    let query_calls_bg = query_calls.clone();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept mock connection");
        let ws = tokio_tungstenite::accept_async(stream).await.expect("mock handshake");
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            let req: Value = match serde_json::from_str(&text) {
                                Ok(v) => v,
                                Err(_) => continue,
                            };
                            let Some(id) = req.get("id").and_then(Value::as_u64) else { continue };
                            let method = req.get("method").and_then(Value::as_str).unwrap_or("");
                            if silent_methods.contains(&method) {
                                continue; // simulate a request that never gets a reply
                            }
                            let result = match method {
                                "Target.attachToTarget" => {
                                    attach_calls_bg.fetch_add(1, Ordering::SeqCst);
                                    json!({ "sessionId": "SESSION-1" })
                                }
                                "DOM.getDocument" => json!({ "root": { "nodeId": 1 } }),
                                "DOM.querySelector" => {
                                    let n = query_calls_bg.fetch_add(1, Ordering::SeqCst);
                                    if n < query_miss_count {
                                        json!({ "nodeId": 0 })
                                    } else {
                                        json!({ "nodeId": 7 })
                                    }
                                }
                                "Page.navigate" => json!({ "frameId": "F1" }),
                                _ => json!({}),
                            };
                            let frame = json!({ "id": id, "result": result }).to_string();
                            if write.send(Message::Text(frame.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        _ => {}
                    }
                }
                pushed = push_rx.recv() => {
                    match pushed {
                        Some(text) => {
                            if write.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => {}
                    }
                }
            }
        }
    });

    MockHandle {
        ws_url: format!("ws://{addr}"),
        push_tx,
        attach_calls,
        query_calls,
    }
}

#[tokio::test]
async fn call_roundtrips_through_the_mock_server() {
    let mock = spawn_mock(0, &[]).await;
    let connection = Connection::connect_to_url(&mock.ws_url).await.expect("connect");

    let result = connection
        .call("Target.getTargets", None, &cdp_ctl::cdp::Cancel::none())
        .await
        .expect("call");
    assert_eq!(result, json!({}));

    connection.close().await;
}

#[tokio::test]
async fn session_manager_caches_attach_across_calls() {
    let mock = spawn_mock(0, &[]).await;
    let connection = Connection::connect_to_url(&mock.ws_url).await.expect("connect");
    let sessions = SessionManager::new(connection.clone());

    let first = sessions.attach("target-1").await.expect("attach");
    let second = sessions.attach("target-1").await.expect("attach again");
    assert_eq!(first, second);
    assert_eq!(mock.attach_calls.load(Ordering::SeqCst), 1);

    connection.close().await;
}

#[tokio::test]
async fn subscription_delivers_a_pushed_event() {
    let mock = spawn_mock(0, &[]).await;
    let connection = Connection::connect_to_url(&mock.ws_url).await.expect("connect");

    let mut sub = connection
        .subscribe(Some("SESSION-1"), "Page.loadEventFired")
        .await
        .expect("subscribe");

    mock.push_tx
        .send(json!({ "method": "Page.loadEventFired", "params": {}, "sessionId": "SESSION-1" }).to_string())
        .expect("push event");

    let event = sub.recv().await.expect("event delivered");
    assert_eq!(event.method, "Page.loadEventFired");

    sub.unsubscribe().await;
    connection.close().await;
}

#[tokio::test]
async fn cancel_wins_a_call_that_never_gets_a_reply() {
    let mock = spawn_mock(0, &["Network.neverReplies"]).await;
    let connection = Connection::connect_to_url(&mock.ws_url).await.expect("connect");
    let (cancel_handle, cancel) = CancelHandle::new();

    let connection2 = connection.clone();
    let call = tokio::spawn(async move { connection2.call("Network.neverReplies", None, &cancel).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel_handle.cancel();

    let result = call.await.expect("join");
    assert!(matches!(result, Err(Error::Cancelled)));

    connection.close().await;
}

#[tokio::test]
async fn closing_the_connection_fails_outstanding_calls() {
    let mock = spawn_mock(0, &["Network.neverReplies"]).await;
    let connection = Connection::connect_to_url(&mock.ws_url).await.expect("connect");

    let connection2 = connection.clone();
    let call = tokio::spawn(async move {
        connection2
            .call("Network.neverReplies", None, &cdp_ctl::cdp::Cancel::none())
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    connection.close().await;

    let result = call.await.expect("join");
    assert!(matches!(result, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn wait_polls_until_the_selector_resolves() {
    // DOM.querySelector misses twice (spaced by the 100ms poll interval)
    // before the mock starts returning a real node id.
    let mock = spawn_mock(2, &[]).await;
    let connection = Connection::connect_to_url(&mock.ws_url).await.expect("connect");

    let result = ops::wait::wait(
        &connection,
        "SESSION-1",
        "#ready",
        Duration::from_secs(2),
        &cdp_ctl::cdp::Cancel::none(),
    )
    .await
    .expect("selector eventually resolves");

    assert!(result.found);
    assert_eq!(result.selector, "#ready");
    assert!(mock.query_calls.load(Ordering::SeqCst) >= 3);

    connection.close().await;
}

#[tokio::test]
async fn navigate_and_wait_resolves_once_the_load_event_fires() {
    let mock = spawn_mock(0, &[]).await;
    let connection = Connection::connect_to_url(&mock.ws_url).await.expect("connect");

    let push_tx = mock.push_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = push_tx.send(
            json!({ "method": "Page.loadEventFired", "params": {}, "sessionId": "SESSION-1" }).to_string(),
        );
    });

    let result = ops::page::navigate_and_wait(
        &connection,
        "SESSION-1",
        "https://example.com",
        &cdp_ctl::cdp::Cancel::none(),
    )
    .await
    .expect("navigate_and_wait");

    assert!(result.navigated);
    assert_eq!(result.url, "https://example.com");

    connection.close().await;
}

#[tokio::test]
async fn close_is_idempotent() {
    let mock = spawn_mock(0, &[]).await;
    let connection = Connection::connect_to_url(&mock.ws_url).await.expect("connect");
    connection.close().await;
    connection.close().await;
    assert!(connection.is_closed());
}
