//! Typed, bounded, cancellable sequences derived from CDP events. Each
//! helper enables the domain(s) it needs, subscribes to
//! the relevant event method(s), and returns an `EventStream<T>` whose
//! `stop` is idempotent (unsubscribe + best-effort domain disable).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::select_all;
use serde::Serialize;
use serde_json::Value;

use super::dispatcher::{Cancel, Connection, RawEvent, Subscription};
use crate::error::Error;

type Translate<T> = Arc<dyn Fn(&RawEvent) -> Option<T> + Send + Sync>;

/// A typed, bounded, cancellable stream of protocol-derived events.
pub struct EventStream<T> {
    subs: Vec<Subscription>,
    translate: Translate<T>,
    connection: Connection,
    session_id: Option<String>,
    disable_domains: Vec<&'static str>,
    stopped: Arc<AtomicBool>,
}

impl<T> EventStream<T> {
    /// Await the next successfully translated event. Malformed or
    /// uninteresting raw events are discarded transparently. Returns
    /// `None` once every underlying subscription has closed (stopped, or
    /// the connection closed).
    pub async fn next(&mut self) -> Option<T> {
        loop {
            if self.subs.is_empty() {
                return None;
            }
            let futs: Vec<_> = self.subs.iter_mut().map(|s| Box::pin(s.recv())).collect();
            let (result, idx, _rest) = select_all(futs).await;
            match result {
                Some(raw) => {
                    if let Some(t) = (self.translate)(&raw) {
                        return Some(t);
                    }
                }
                None => {
                    self.subs.remove(idx);
                }
            }
        }
    }

    /// Idempotent stop: unsubscribe every underlying subscription and
    /// best-effort disable the domain(s) this stream enabled.
    pub async fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for sub in &mut self.subs {
            sub.unsubscribe().await;
        }
        for domain in &self.disable_domains {
            let method = format!("{domain}.disable");
            let _ = match &self.session_id {
                Some(sid) => {
                    self.connection
                        .call_session(sid, &method, None, &Cancel::none())
                        .await
                }
                None => self.connection.call(&method, None, &Cancel::none()).await,
            };
        }
        self.subs.clear();
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        // Best-effort: if the caller forgot to `.stop()`, the subscriptions
        // are dropped here, which closes their receive ends and lets the
        // dispatcher garbage-collect them on the next dispatch attempt.
        // Domain disable is skipped (it needs an await); this is
        // acceptable since `Connection::close` already tears everything
        // down and a dangling `enable` on a live connection is harmless.
    }
}

async fn enable(connection: &Connection, session_id: Option<&str>, domain: &str) -> Result<(), Error> {
    let method = format!("{domain}.enable");
    match session_id {
        Some(sid) => connection.call_session(sid, &method, None, &Cancel::none()).await,
        None => connection.call(&method, None, &Cancel::none()).await,
    }
    .map(|_| ())
}

async fn subscribe_many(
    connection: &Connection,
    session_id: Option<&str>,
    methods: &[&str],
) -> Result<Vec<Subscription>, Error> {
    let mut subs = Vec::with_capacity(methods.len());
    for method in methods {
        subs.push(connection.subscribe(session_id, method).await?);
    }
    Ok(subs)
}

fn arg_to_string(v: &Value) -> String {
    v.get("value")
        .map(|val| match val {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .or_else(|| v.get("description").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| v.get("type").and_then(Value::as_str).unwrap_or("undefined").to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsoleEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// Console messages via `Runtime.consoleAPICalled`.
///
/// # Errors
///
/// Propagates `Connection::call`/`subscribe` failures from enabling
/// `Runtime` or subscribing to the event.
pub async fn console(connection: &Connection, session_id: &str) -> Result<EventStream<ConsoleEvent>, Error> {
    enable(connection, Some(session_id), "Runtime").await?;
    let subs = subscribe_many(connection, Some(session_id), &["Runtime.consoleAPICalled"]).await?;
    let translate: Translate<ConsoleEvent> = Arc::new(|raw| {
        let kind_raw = raw.params.get("type").and_then(Value::as_str).unwrap_or("log");
        let kind = match kind_raw {
            "warning" => "warn",
            "log" | "warn" | "error" | "info" | "debug" => kind_raw,
            _ => "log",
        }
        .to_string();
        let text = raw
            .params
            .get("args")
            .and_then(Value::as_array)
            .map(|args| {
                args.iter()
                    .map(arg_to_string)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        Some(ConsoleEvent { kind, text })
    });
    Ok(EventStream {
        subs,
        translate,
        connection: connection.clone(),
        session_id: Some(session_id.to_string()),
        disable_domains: vec!["Runtime"],
        stopped: Arc::new(AtomicBool::new(false)),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ExceptionEvent {
    pub text: String,
    pub line: Option<i64>,
    pub column: Option<i64>,
    pub url: Option<String>,
}

/// Uncaught exceptions via `Runtime.exceptionThrown`.
///
/// # Errors
///
/// Propagates `Connection::call`/`subscribe` failures.
pub async fn exceptions(connection: &Connection, session_id: &str) -> Result<EventStream<ExceptionEvent>, Error> {
    enable(connection, Some(session_id), "Runtime").await?;
    let subs = subscribe_many(connection, Some(session_id), &["Runtime.exceptionThrown"]).await?;
    let translate: Translate<ExceptionEvent> = Arc::new(|raw| {
        let details = raw.params.get("exceptionDetails")?;
        let text = details
            .get("exception")
            .and_then(|e| e.get("description"))
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("")
            .to_string();
        Some(ExceptionEvent {
            text,
            line: details.get("lineNumber").and_then(Value::as_i64),
            column: details.get("columnNumber").and_then(Value::as_i64),
            url: details
                .get("url")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    });
    Ok(EventStream {
        subs,
        translate,
        connection: connection.clone(),
        session_id: Some(session_id.to_string()),
        disable_domains: vec!["Runtime"],
        stopped: Arc::new(AtomicBool::new(false)),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub request_id: String,
    pub url: String,
    pub method: Option<String>,
    pub status: Option<i64>,
    pub mime: Option<String>,
}

/// One item per request-sent and per response-received
/// (`Network.requestWillBeSent` / `Network.responseReceived`).
///
/// # Errors
///
/// Propagates `Connection::call`/`subscribe` failures.
pub async fn network(connection: &Connection, session_id: &str) -> Result<EventStream<NetworkEvent>, Error> {
    enable(connection, Some(session_id), "Network").await?;
    let subs = subscribe_many(
        connection,
        Some(session_id),
        &["Network.requestWillBeSent", "Network.responseReceived"],
    )
    .await?;
    let translate: Translate<NetworkEvent> = Arc::new(|raw| {
        let request_id = raw.params.get("requestId")?.as_str()?.to_string();
        match raw.method.as_str() {
            "Network.requestWillBeSent" => {
                let request = raw.params.get("request")?;
                Some(NetworkEvent {
                    kind: "request",
                    request_id,
                    url: request.get("url")?.as_str()?.to_string(),
                    method: request
                        .get("method")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    status: None,
                    mime: None,
                })
            }
            "Network.responseReceived" => {
                let response = raw.params.get("response")?;
                Some(NetworkEvent {
                    kind: "response",
                    request_id,
                    url: response.get("url")?.as_str()?.to_string(),
                    method: None,
                    status: response.get("status").and_then(Value::as_i64),
                    mime: response
                        .get("mimeType")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            }
            _ => None,
        }
    });
    Ok(EventStream {
        subs,
        translate,
        connection: connection.clone(),
        session_id: Some(session_id.to_string()),
        disable_domains: vec!["Network"],
        stopped: Arc::new(AtomicBool::new(false)),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct NavigationEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub url: String,
}

/// Top-level navigations via `Page.frameNavigated`, excluding `about:blank`
/// and empty URLs, and excluding sub-frame navigations.
///
/// # Errors
///
/// Propagates `Connection::call`/`subscribe` failures.
pub async fn navigation(connection: &Connection, session_id: &str) -> Result<EventStream<NavigationEvent>, Error> {
    enable(connection, Some(session_id), "Page").await?;
    let subs = subscribe_many(connection, Some(session_id), &["Page.frameNavigated"]).await?;
    let translate: Translate<NavigationEvent> = Arc::new(|raw| {
        let frame = raw.params.get("frame")?;
        let has_parent = frame
            .get("parentId")
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty());
        if has_parent {
            return None;
        }
        let url = frame.get("url")?.as_str()?.to_string();
        if url.is_empty() || url == "about:blank" {
            return None;
        }
        Some(NavigationEvent { kind: "navigate", url })
    });
    Ok(EventStream {
        subs,
        translate,
        connection: connection.clone(),
        session_id: Some(session_id.to_string()),
        disable_domains: vec!["Page"],
        stopped: Arc::new(AtomicBool::new(false)),
    })
}

/// Build an `EventStream` that yields raw, untranslated events for
/// arbitrary `methods` without enabling any domain or registering a
/// disable — used by callers (waiters, HAR assembly) that manage domain
/// lifecycle themselves because they combine several event families with
/// different enable/disable needs.
pub(crate) async fn raw_stream(
    connection: &Connection,
    session_id: Option<&str>,
    methods: &[&str],
) -> Result<EventStream<RawEvent>, Error> {
    let subs = subscribe_many(connection, session_id, methods).await?;
    let translate: Translate<RawEvent> = Arc::new(|raw| Some(raw.clone()));
    Ok(EventStream {
        subs,
        translate,
        connection: connection.clone(),
        session_id: session_id.map(str::to_string),
        disable_domains: vec![],
        stopped: Arc::new(AtomicBool::new(false)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_to_string_prefers_value() {
        let v = serde_json::json!({"type": "string", "value": "hi"});
        assert_eq!(arg_to_string(&v), "hi");
    }

    #[test]
    fn arg_to_string_falls_back_to_description() {
        let v = serde_json::json!({"type": "object", "description": "Object"});
        assert_eq!(arg_to_string(&v), "Object");
    }

    #[test]
    fn arg_to_string_falls_back_to_type() {
        let v = serde_json::json!({"type": "undefined"});
        assert_eq!(arg_to_string(&v), "undefined");
    }
}
