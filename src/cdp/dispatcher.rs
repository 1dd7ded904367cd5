//! The WebSocket request/response multiplexer, event router, and session
//! cache. `Connection` is the handle callers clone and
//! share; all state lives in a single background actor task, which is what
//! gives single-writer discipline for free (only the actor ever touches the
//! socket) instead of an explicit async lock around every send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use super::codec::{self, InboundMessage, ProtocolErrorBody, RequestRecord};
use crate::error::{Error, SetupError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Nominal per-subscriber channel capacity. Overflow drops the oldest
/// undelivered message for that subscriber rather than blocking the reader.
const SUBSCRIBER_CAPACITY: usize = 100;

/// Budget for best-effort session detaches on close.
const CLOSE_DETACH_BUDGET: Duration = Duration::from_secs(2);

/// A cooperative cancellation signal. Cloning shares the same underlying
/// flag; firing it from any clone cancels every waiter.
#[derive(Clone)]
pub struct Cancel(Option<watch::Receiver<bool>>);

impl Cancel {
    /// A signal that never fires — for call sites with no cancellation.
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(&self.0, Some(rx) if *rx.borrow())
    }

    /// Resolves once the signal fires. Never resolves for `Cancel::none()`.
    pub async fn cancelled(&self) {
        match &self.0 {
            Some(rx) => {
                let mut rx = rx.clone();
                loop {
                    if *rx.borrow() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
            None => std::future::pending::<()>().await,
        }
    }
}

/// The sending half of a `Cancel` signal.
#[derive(Clone)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    #[must_use]
    pub fn new() -> (Self, Cancel) {
        let (tx, rx) = watch::channel(false);
        (Self(tx), Cancel(Some(rx)))
    }

    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new().0
    }
}

/// One event delivered to a subscriber: the method it came from (a
/// subscription may in principle only ever see the method it asked for,
/// but callers that merge subscriptions want to know which) and its raw
/// params.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub method: String,
    pub params: Value,
}

/// A call awaiting its reply. `Attach` carries enough context for
/// `resolve()` to fold the result into the session cache before handing
/// the session id back to the caller — attaches are never resolved
/// in-line inside `handle_attach` because the reply can only be read by
/// the actor's own `run()` loop, and that loop is not re-entrant.
enum PendingSlot {
    Call(oneshot::Sender<Result<Value, Error>>),
    Attach {
        target_id: String,
        resp: oneshot::Sender<Result<String, Error>>,
    },
}

impl PendingSlot {
    fn fail(self, err: Error) {
        match self {
            PendingSlot::Call(resp) => {
                let _ = resp.send(Err(err));
            }
            PendingSlot::Attach { resp, .. } => {
                let _ = resp.send(Err(err));
            }
        }
    }
}

type SubscriberKey = (Option<String>, String);

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<RawEvent>,
}

enum ActorCommand {
    Call {
        record: RequestRecord,
        resp: oneshot::Sender<Result<Value, Error>>,
    },
    Subscribe {
        session_id: Option<String>,
        method: String,
        resp: oneshot::Sender<(u64, mpsc::Receiver<RawEvent>)>,
    },
    Unsubscribe {
        id: u64,
        session_id: Option<String>,
        method: String,
    },
    AttachSession {
        target_id: String,
        resp: oneshot::Sender<Result<String, Error>>,
    },
    ForgetSession {
        target_id: String,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// A handle to the single WebSocket connection. Cheap to clone; every
/// clone shares the same background actor, pending-call map, subscriber
/// map, and session cache.
#[derive(Clone)]
pub struct Connection {
    cmd_tx: mpsc::Sender<ActorCommand>,
    next_id: Arc<AtomicU64>,
    next_sub_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    close_rx: watch::Receiver<bool>,
}

impl Connection {
    /// Connect to a Chrome instance: discover its browser-level WebSocket
    /// URL via `/json/version`, perform the WebSocket handshake, and spawn
    /// the dispatcher actor.
    ///
    /// # Errors
    ///
    /// Returns `SetupError` if discovery or the handshake fails.
    pub async fn connect(host: &str, port: u16) -> std::result::Result<Self, SetupError> {
        let ws_url = codec::discover_websocket_url(host, port).await?;
        Self::connect_to_url(&ws_url).await
    }

    /// Connect directly to a known WebSocket URL (browser-level or a
    /// specific target's debugger URL), skipping `/json/version`
    /// discovery.
    ///
    /// # Errors
    ///
    /// Returns `SetupError::WebSocket` if the handshake fails.
    pub async fn connect_to_url(ws_url: &str) -> std::result::Result<Self, SetupError> {
        debug!(url = %ws_url, "connecting to CDP websocket");
        let (ws_stream, _) = connect_async(ws_url).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (close_tx, close_rx) = watch::channel(false);

        let actor = Actor {
            ws_stream,
            cmd_rx,
            pending: HashMap::new(),
            subscribers: HashMap::new(),
            sessions: HashMap::new(),
            close_tx,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            cmd_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            next_sub_id: Arc::new(AtomicU64::new(1)),
            closed: Arc::new(AtomicBool::new(false)),
            close_rx,
        })
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a browser-level call and await its result, honoring `cancel`
    /// and connection closure.
    ///
    /// # Errors
    ///
    /// `Error::ConnectionClosed` if the connection is gone,
    /// `Error::Cancelled` if `cancel` fires first, or `Error::Protocol`
    /// if the browser replies with an error.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &Cancel,
    ) -> Result<Value, Error> {
        self.call_inner(method, params, None, cancel).await
    }

    /// Send a call scoped to a target session (`sessionId` on the wire).
    ///
    /// # Errors
    ///
    /// Same as [`Connection::call`].
    pub async fn call_session(
        &self,
        session_id: &str,
        method: &str,
        params: Option<Value>,
        cancel: &Cancel,
    ) -> Result<Value, Error> {
        self.call_inner(method, params, Some(session_id.to_string()), cancel)
            .await
    }

    async fn call_inner(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<String>,
        cancel: &Cancel,
    ) -> Result<Value, Error> {
        let id = self.alloc_id();
        let record = RequestRecord {
            id,
            method: method.to_string(),
            params,
            session_id,
        };
        let (resp_tx, resp_rx) = oneshot::channel();

        if self
            .cmd_tx
            .send(ActorCommand::Call {
                record,
                resp: resp_tx,
            })
            .await
            .is_err()
        {
            return Err(Error::ConnectionClosed);
        }

        let mut close_rx = self.close_rx.clone();
        tokio::select! {
            result = resp_rx => result.map_err(|_| Error::ConnectionClosed)?,
            () = cancel.cancelled() => Err(Error::Cancelled),
            _ = close_rx.changed() => Err(Error::ConnectionClosed),
        }
    }

    /// Subscribe to events for `method`, optionally scoped to a session.
    /// Pass `None` for browser-level events.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConnectionClosed` if the actor has already exited.
    pub async fn subscribe(
        &self,
        session_id: Option<&str>,
        method: &str,
    ) -> Result<Subscription, Error> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(ActorCommand::Subscribe {
                session_id: session_id.map(str::to_string),
                method: method.to_string(),
                resp: resp_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let (id, rx) = resp_rx.await.map_err(|_| Error::ConnectionClosed)?;
        Ok(Subscription {
            id,
            session_id: session_id.map(str::to_string),
            method: method.to_string(),
            rx,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Attach (or reuse a cached attach) to `target_id` with
    /// `flatten: true` and return the session id.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the browser refuses the attach, or
    /// `Error::ConnectionClosed` if the connection is gone.
    pub async fn attach_session(&self, target_id: &str) -> Result<String, Error> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(ActorCommand::AttachSession {
                target_id: target_id.to_string(),
                resp: resp_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        resp_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Drop `target_id` from the session cache (but do not close the
    /// target itself — callers issue `Target.closeTarget` separately so
    /// the cache entry is gone *before* the close call, letting a later
    /// operation against the same target id re-attach instead of reusing
    /// a stale session).
    pub async fn forget_session(&self, target_id: &str) {
        let _ = self
            .cmd_tx
            .send(ActorCommand::ForgetSession {
                target_id: target_id.to_string(),
            })
            .await;
    }

    /// Idempotently close the connection: best-effort detach cached
    /// sessions within budget, fail every outstanding call with
    /// `ConnectionClosed`, close every subscriber channel, close the
    /// socket.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ActorCommand::Shutdown { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || *self.close_rx.borrow()
    }

    #[allow(dead_code)]
    fn next_subscription_id(&self) -> u64 {
        self.next_sub_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A live event subscription: the typed receive end plus the stop
/// capability. Stopping is idempotent.
pub struct Subscription {
    id: u64,
    session_id: Option<String>,
    method: String,
    rx: mpsc::Receiver<RawEvent>,
    cmd_tx: mpsc::Sender<ActorCommand>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<RawEvent> {
        self.rx.recv().await
    }

    /// Unsubscribe the underlying protocol channel and close the receive
    /// end. Idempotent: a second call is a no-op because the dispatcher
    /// simply finds nothing left to remove and the channel is already
    /// closed.
    pub async fn unsubscribe(&mut self) {
        self.rx.close();
        let _ = self
            .cmd_tx
            .send(ActorCommand::Unsubscribe {
                id: self.id,
                session_id: self.session_id.clone(),
                method: self.method.clone(),
            })
            .await;
    }
}

struct Actor {
    ws_stream: WsStream,
    cmd_rx: mpsc::Receiver<ActorCommand>,
    pending: HashMap<u64, PendingSlot>,
    subscribers: HashMap<SubscriberKey, Vec<Subscriber>>,
    sessions: HashMap<String, String>,
    close_tx: watch::Sender<bool>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                frame = self.ws_stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Close(_))) | None => {
                            self.shutdown().await;
                            return;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "websocket read error, closing connection");
                            self.shutdown().await;
                            return;
                        }
                        Some(Ok(_)) => {} // binary/ping/pong/frame: ignore
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(ActorCommand::Call { record, resp }) => {
                            self.handle_call(record, resp).await;
                        }
                        Some(ActorCommand::Subscribe { session_id, method, resp }) => {
                            self.handle_subscribe(session_id, method, resp);
                        }
                        Some(ActorCommand::Unsubscribe { id, session_id, method }) => {
                            self.handle_unsubscribe(id, session_id, method);
                        }
                        Some(ActorCommand::AttachSession { target_id, resp }) => {
                            self.handle_attach(target_id, resp).await;
                        }
                        Some(ActorCommand::ForgetSession { target_id }) => {
                            self.sessions.remove(&target_id);
                        }
                        Some(ActorCommand::Shutdown { done }) => {
                            self.shutdown().await;
                            let _ = done.send(());
                            return;
                        }
                        None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        trace!(frame = %text, "inbound cdp frame");
        let decoded = match codec::decode_frame(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping malformed cdp frame");
                return;
            }
        };
        match decoded {
            Some(InboundMessage::Response { id, result }) => self.resolve(id, result),
            Some(InboundMessage::Event {
                method,
                params,
                session_id,
            }) => self.dispatch_event(session_id, method, params),
            None => {}
        }
    }

    fn resolve(&mut self, id: u64, result: std::result::Result<Value, ProtocolErrorBody>) {
        let Some(slot) = self.pending.remove(&id) else {
            // No matching pending entry: caller cancelled or this is a
            // late duplicate. Drop silently.
            return;
        };
        let mapped = result.map_err(|e| Error::Protocol {
            code: e.code,
            message: e.message,
        });
        match slot {
            PendingSlot::Call(resp) => {
                let _ = resp.send(mapped);
            }
            PendingSlot::Attach { target_id, resp } => match mapped {
                Ok(value) => match value.get("sessionId").and_then(Value::as_str) {
                    Some(sid) => {
                        self.sessions.insert(target_id, sid.to_string());
                        let _ = resp.send(Ok(sid.to_string()));
                    }
                    None => {
                        let _ = resp.send(Err(Error::Protocol {
                            code: -32002,
                            message: "Target.attachToTarget response missing sessionId".to_string(),
                        }));
                    }
                },
                Err(e) => {
                    let _ = resp.send(Err(e));
                }
            },
        }
    }

    fn dispatch_event(&mut self, session_id: Option<String>, method: String, params: Value) {
        let key = (session_id, method.clone());
        if let Some(subs) = self.subscribers.get_mut(&key) {
            let event = RawEvent { method, params };
            subs.retain_mut(|sub| match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true, // drop this delivery, keep subscriber
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if subs.is_empty() {
                self.subscribers.remove(&key);
            }
        }
    }

    /// Serialize and write a request frame. Never waits for its reply —
    /// replies are only ever read back by `run()`'s own frame loop, so a
    /// command handler that blocks on one would deadlock the actor.
    async fn write_record(&mut self, record: &RequestRecord) -> Result<(), Error> {
        let json = codec::encode_request(record).map_err(|e| Error::Protocol {
            code: -32700,
            message: format!("failed to encode request: {e}"),
        })?;
        self.ws_stream
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| Error::Protocol {
                code: -32001,
                message: format!("websocket write failed: {e}"),
            })
    }

    async fn handle_call(
        &mut self,
        record: RequestRecord,
        resp: oneshot::Sender<Result<Value, Error>>,
    ) {
        let id = record.id;
        match self.write_record(&record).await {
            Ok(()) => {
                self.pending.insert(id, PendingSlot::Call(resp));
            }
            Err(e) => {
                let _ = resp.send(Err(e));
            }
        }
    }

    fn handle_subscribe(
        &mut self,
        session_id: Option<String>,
        method: String,
        resp: oneshot::Sender<(u64, mpsc::Receiver<RawEvent>)>,
    ) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        // Subscription ids only need to be unique per (session, method)
        // bucket, so a simple counter derived from the bucket length plus
        // one monotonic nonce keeps this self-contained in the actor.
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let key = (session_id, method);
        self.subscribers
            .entry(key)
            .or_default()
            .push(Subscriber { id, tx });
        let _ = resp.send((id, rx));
    }

    fn handle_unsubscribe(&mut self, id: u64, session_id: Option<String>, method: String) {
        let key = (session_id, method);
        if let Some(subs) = self.subscribers.get_mut(&key) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                self.subscribers.remove(&key);
            }
        }
    }

    /// Issue `Target.attachToTarget{flatten:true}` and register the
    /// caller's `resp` under a fresh id. The actual session-id extraction
    /// and cache insert happens in `resolve()` once the reply frame comes
    /// back through the normal reader path — this method only ever writes
    /// the request, it never waits for the answer.
    async fn handle_attach(&mut self, target_id: String, resp: oneshot::Sender<Result<String, Error>>) {
        if let Some(session_id) = self.sessions.get(&target_id) {
            let _ = resp.send(Ok(session_id.clone()));
            return;
        }

        let id = {
            // Borrow a scratch id from a private id space so attach calls
            // never collide with regular `Connection::call` ids.
            static ATTACH_ID: AtomicU64 = AtomicU64::new(1 << 48);
            ATTACH_ID.fetch_add(1, Ordering::Relaxed)
        };
        let record = RequestRecord {
            id,
            method: "Target.attachToTarget".to_string(),
            params: Some(serde_json::json!({ "targetId": target_id, "flatten": true })),
            session_id: None,
        };
        match self.write_record(&record).await {
            Ok(()) => {
                self.pending.insert(id, PendingSlot::Attach { target_id, resp });
            }
            Err(e) => {
                let _ = resp.send(Err(e));
            }
        }
    }

    async fn shutdown(&mut self) {
        let _ = self.close_tx.send(true);

        let detach_deadline = Instant::now() + CLOSE_DETACH_BUDGET;
        for (target_id, session_id) in std::mem::take(&mut self.sessions) {
            if Instant::now() >= detach_deadline {
                break;
            }
            let id = {
                static DETACH_ID: AtomicU64 = AtomicU64::new(1 << 56);
                DETACH_ID.fetch_add(1, Ordering::Relaxed)
            };
            let record = RequestRecord {
                id,
                method: "Target.detachFromTarget".to_string(),
                params: Some(serde_json::json!({ "sessionId": session_id, "targetId": target_id })),
                session_id: None,
            };
            // Fire-and-forget: by the time `shutdown` runs, `run()`'s
            // frame loop has already stopped reading, so nothing would
            // ever fulfil a reply wait here. Just write the request within
            // budget and move on to the next session.
            let remaining = detach_deadline.saturating_duration_since(Instant::now());
            let _ = tokio::time::timeout(remaining, self.write_record(&record)).await;
        }

        for (_, slot) in std::mem::take(&mut self.pending) {
            slot.fail(Error::ConnectionClosed);
        }
        self.subscribers.clear(); // dropping senders closes every receiver
        let _ = self.ws_stream.close(None).await;
    }
}
