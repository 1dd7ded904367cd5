//! Waiters: polling waits and event-driven waits.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;
use tokio::time::{Duration, Instant};

use super::{evaluate, is_js_truthy, resolve_node_id, sleep_or_cancel};
use crate::cdp::{Cancel, Connection};
use crate::error::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

async fn poll_truthy(
    connection: &Connection,
    session_id: &str,
    expression: &str,
    deadline: Instant,
    cancel: &Cancel,
) -> Result<(), Error> {
    loop {
        let value = evaluate(connection, session_id, expression, cancel).await?;
        if is_js_truthy(&value) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        let remaining = deadline.saturating_duration_since(Instant::now()).min(POLL_INTERVAL);
        sleep_or_cancel(remaining, cancel).await?;
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitResult {
    pub found: bool,
    pub selector: String,
}

/// `wait(selector, timeout)`: polls `DOM.querySelector` directly.
///
/// # Errors
///
/// `Error::Timeout` if `selector` never resolves within `timeout`.
pub async fn wait(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    timeout: Duration,
    cancel: &Cancel,
) -> Result<WaitResult, Error> {
    let deadline = Instant::now() + timeout;
    loop {
        match resolve_node_id(connection, session_id, selector, cancel).await {
            Ok(_) => {
                return Ok(WaitResult {
                    found: true,
                    selector: selector.to_string(),
                })
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        let remaining = deadline.saturating_duration_since(Instant::now()).min(POLL_INTERVAL);
        sleep_or_cancel(remaining, cancel).await?;
    }
}

/// `waitgone(selector, timeout)`.
///
/// # Errors
///
/// `Error::Timeout` if `selector` still matches an element at the deadline.
pub async fn waitgone(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    timeout: Duration,
    cancel: &Cancel,
) -> Result<WaitResult, Error> {
    let expression = format!("document.querySelector(\"{}\")===null", escape(selector));
    poll_truthy(connection, session_id, &expression, Instant::now() + timeout, cancel).await?;
    Ok(WaitResult {
        found: true,
        selector: selector.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitTextResult {
    pub found: bool,
    pub text: String,
}

/// `waittext(text, timeout)`.
///
/// # Errors
///
/// `Error::Timeout` if `text` never appears in `document.body.innerText`.
pub async fn waittext(
    connection: &Connection,
    session_id: &str,
    text: &str,
    timeout: Duration,
    cancel: &Cancel,
) -> Result<WaitTextResult, Error> {
    let expression = format!(
        "(document.body?.innerText.includes(\"{}\")) ?? false",
        escape(text)
    );
    poll_truthy(connection, session_id, &expression, Instant::now() + timeout, cancel).await?;
    Ok(WaitTextResult {
        found: true,
        text: text.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitFnResult {
    pub found: bool,
}

/// `waitfn(expression, timeout)`.
///
/// # Errors
///
/// `Error::Timeout` if `expression` never evaluates truthy.
pub async fn waitfn(
    connection: &Connection,
    session_id: &str,
    expression: &str,
    timeout: Duration,
    cancel: &Cancel,
) -> Result<WaitFnResult, Error> {
    poll_truthy(connection, session_id, expression, Instant::now() + timeout, cancel).await?;
    Ok(WaitFnResult { found: true })
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitUrlResult {
    pub found: bool,
    pub pattern: String,
}

/// `waiturl(pattern, timeout)`: substring match against the current URL.
///
/// # Errors
///
/// `Error::Timeout` if `pattern` never matches within `timeout`.
pub async fn waiturl(
    connection: &Connection,
    session_id: &str,
    pattern: &str,
    timeout: Duration,
    cancel: &Cancel,
) -> Result<WaitUrlResult, Error> {
    let expression = format!("location.href.includes(\"{}\")", escape(pattern));
    poll_truthy(connection, session_id, &expression, Instant::now() + timeout, cancel).await?;
    Ok(WaitUrlResult {
        found: true,
        pattern: pattern.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitNavResult {
    pub found: bool,
}

async fn wait_event(
    connection: &Connection,
    session_id: &str,
    domain: &str,
    method: &str,
    timeout: Duration,
    cancel: &Cancel,
) -> Result<(), Error> {
    connection
        .call_session(session_id, &format!("{domain}.enable"), None, cancel)
        .await?;
    let mut sub = connection.subscribe(Some(session_id), method).await?;
    let outcome = tokio::select! {
        event = sub.recv() => event.map(|_| ()).ok_or(Error::ConnectionClosed),
        () = tokio::time::sleep(timeout) => Err(Error::Timeout),
        () = cancel.cancelled() => Err(Error::Cancelled),
    };
    sub.unsubscribe().await;
    outcome
}

/// `waitnav(timeout)`: first `Page.frameNavigated`.
///
/// # Errors
///
/// `Error::Timeout` if no navigation happens within `timeout`.
pub async fn waitnav(connection: &Connection, session_id: &str, timeout: Duration, cancel: &Cancel) -> Result<WaitNavResult, Error> {
    wait_event(connection, session_id, "Page", "Page.frameNavigated", timeout, cancel).await?;
    Ok(WaitNavResult { found: true })
}

/// `waitload(timeout)`: first `Page.loadEventFired`.
///
/// # Errors
///
/// `Error::Timeout` if the load event never fires within `timeout`.
pub async fn waitload(connection: &Connection, session_id: &str, timeout: Duration, cancel: &Cancel) -> Result<WaitNavResult, Error> {
    wait_event(connection, session_id, "Page", "Page.loadEventFired", timeout, cancel).await?;
    Ok(WaitNavResult { found: true })
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitRequestResult {
    pub found: bool,
    pub url: String,
    pub method: Option<String>,
    pub request_id: String,
}

async fn wait_network(
    connection: &Connection,
    session_id: &str,
    method_name: &str,
    url_substring: &str,
    timeout: Duration,
    cancel: &Cancel,
) -> Result<WaitRequestResult, Error> {
    connection
        .call_session(session_id, "Network.enable", None, cancel)
        .await?;
    let mut sub = connection.subscribe(Some(session_id), method_name).await?;
    let deadline = Instant::now() + timeout;
    let result = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = tokio::select! {
            event = sub.recv() => event,
            () = tokio::time::sleep(remaining) => break Err(Error::Timeout),
            () = cancel.cancelled() => break Err(Error::Cancelled),
        };
        let Some(event) = event else {
            break Err(Error::ConnectionClosed);
        };
        let (url, method, request_id) = match method_name {
            "Network.requestWillBeSent" => {
                let request = event.params.get("request");
                (
                    request.and_then(|r| r.get("url")).and_then(Value::as_str).map(str::to_string),
                    request.and_then(|r| r.get("method")).and_then(Value::as_str).map(str::to_string),
                    event.params.get("requestId").and_then(Value::as_str).map(str::to_string),
                )
            }
            _ => {
                let response = event.params.get("response");
                (
                    response.and_then(|r| r.get("url")).and_then(Value::as_str).map(str::to_string),
                    None,
                    event.params.get("requestId").and_then(Value::as_str).map(str::to_string),
                )
            }
        };
        if let (Some(url), Some(request_id)) = (url, request_id) {
            if url.contains(url_substring) {
                break Ok(WaitRequestResult {
                    found: true,
                    url,
                    method,
                    request_id,
                });
            }
        }
    };
    sub.unsubscribe().await;
    result
}

/// `waitrequest(url_substring, timeout)`.
///
/// # Errors
///
/// `Error::Timeout` if no matching request is observed within `timeout`.
pub async fn waitrequest(
    connection: &Connection,
    session_id: &str,
    url_substring: &str,
    timeout: Duration,
    cancel: &Cancel,
) -> Result<WaitRequestResult, Error> {
    wait_network(connection, session_id, "Network.requestWillBeSent", url_substring, timeout, cancel).await
}

/// `waitresponse(url_substring, timeout)`.
///
/// # Errors
///
/// `Error::Timeout` if no matching response is observed within `timeout`.
pub async fn waitresponse(
    connection: &Connection,
    session_id: &str,
    url_substring: &str,
    timeout: Duration,
    cancel: &Cancel,
) -> Result<WaitRequestResult, Error> {
    wait_network(connection, session_id, "Network.responseReceived", url_substring, timeout, cancel).await
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitIdleResult {
    pub idle: bool,
}

/// `waitidle(idle_duration, timeout)`: succeeds once the in-flight request
/// set stays empty for `idle_duration`, resetting on every request
/// start/finish/failure.
///
/// # Errors
///
/// `Error::Timeout` if the network never settles within `timeout`.
pub async fn waitidle(
    connection: &Connection,
    session_id: &str,
    idle_duration: Duration,
    timeout: Duration,
    cancel: &Cancel,
) -> Result<WaitIdleResult, Error> {
    connection
        .call_session(session_id, "Network.enable", None, cancel)
        .await?;
    let mut started = connection.subscribe(Some(session_id), "Network.requestWillBeSent").await?;
    let mut finished = connection.subscribe(Some(session_id), "Network.loadingFinished").await?;
    let mut failed = connection.subscribe(Some(session_id), "Network.loadingFailed").await?;

    let mut inflight: HashSet<String> = HashSet::new();
    let deadline = Instant::now() + timeout;
    let idle_sleep = tokio::time::sleep(idle_duration);
    tokio::pin!(idle_sleep);

    let outcome = loop {
        if Instant::now() >= deadline {
            break Err(Error::Timeout);
        }
        tokio::select! {
            event = started.recv() => {
                match event {
                    Some(e) => {
                        if let Some(id) = e.params.get("requestId").and_then(Value::as_str) {
                            inflight.insert(id.to_string());
                        }
                        idle_sleep.as_mut().reset(Instant::now() + idle_duration);
                    }
                    None => break Err(Error::ConnectionClosed),
                }
            }
            event = finished.recv() => {
                match event {
                    Some(e) => {
                        if let Some(id) = e.params.get("requestId").and_then(Value::as_str) {
                            inflight.remove(id);
                        }
                        if inflight.is_empty() {
                            idle_sleep.as_mut().reset(Instant::now() + idle_duration);
                        }
                    }
                    None => break Err(Error::ConnectionClosed),
                }
            }
            event = failed.recv() => {
                match event {
                    Some(e) => {
                        if let Some(id) = e.params.get("requestId").and_then(Value::as_str) {
                            inflight.remove(id);
                        }
                        if inflight.is_empty() {
                            idle_sleep.as_mut().reset(Instant::now() + idle_duration);
                        }
                    }
                    None => break Err(Error::ConnectionClosed),
                }
            }
            () = &mut idle_sleep => {
                if inflight.is_empty() {
                    break Ok(());
                }
                idle_sleep.as_mut().reset(Instant::now() + idle_duration);
            }
            () = cancel.cancelled() => break Err(Error::Cancelled),
        }
    };

    started.unsubscribe().await;
    finished.unsubscribe().await;
    failed.unsubscribe().await;
    outcome.map(|()| WaitIdleResult { idle: true })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_handles_quotes() {
        assert_eq!(escape(r#"a"b"#), r#"a\"b"#);
    }
}
