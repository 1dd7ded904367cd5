//! Network control: URL blocking, throttling, offline mode, request
//! interception, HAR assembly, response-body fetch, and capture/profiling
//! primitives.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::{Duration, Instant};

use super::sleep_or_cancel;
use crate::cdp::{raw_stream, Cancel, Connection};
use crate::error::Error;

#[derive(Debug, Clone, Serialize)]
pub struct BlockResult {
    pub blocked: Vec<String>,
}

/// `block(patterns)` / `block --disable`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn block_urls(
    connection: &Connection,
    session_id: &str,
    patterns: &[String],
    cancel: &Cancel,
) -> Result<BlockResult, Error> {
    connection
        .call_session(session_id, "Network.enable", None, cancel)
        .await?;
    connection
        .call_session(
            session_id,
            "Network.setBlockedURLs",
            Some(json!({ "urls": patterns })),
            cancel,
        )
        .await?;
    Ok(BlockResult {
        blocked: patterns.to_vec(),
    })
}

#[derive(Debug, Clone, Copy)]
pub struct ThrottlePreset {
    pub latency_ms: f64,
    pub download_bps: f64,
    pub upload_bps: f64,
}

pub fn throttle_preset(name: &str) -> Option<ThrottlePreset> {
    Some(match name {
        "slow3g" => ThrottlePreset { latency_ms: 400.0, download_bps: 400.0 * 1024.0 / 8.0, upload_bps: 400.0 * 1024.0 / 8.0 },
        "fast3g" => ThrottlePreset { latency_ms: 150.0, download_bps: 1_600.0 * 1024.0 / 8.0, upload_bps: 750.0 * 1024.0 / 8.0 },
        "4g" => ThrottlePreset { latency_ms: 70.0, download_bps: 9_000.0 * 1024.0 / 8.0, upload_bps: 3_000.0 * 1024.0 / 8.0 },
        "wifi" => ThrottlePreset { latency_ms: 10.0, download_bps: 30_000.0 * 1024.0 / 8.0, upload_bps: 15_000.0 * 1024.0 / 8.0 },
        _ => return None,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ThrottleResult {
    pub preset: String,
}

/// `throttle(preset)`.
///
/// # Errors
///
/// `Error::InvalidArgument` if `preset` is not in the fixed table.
pub async fn throttle(
    connection: &Connection,
    session_id: &str,
    preset_name: &str,
    cancel: &Cancel,
) -> Result<ThrottleResult, Error> {
    let preset = throttle_preset(preset_name)
        .ok_or_else(|| Error::invalid_argument(format!("unknown throttling preset: {preset_name}")))?;
    connection
        .call_session(session_id, "Network.enable", None, cancel)
        .await?;
    connection
        .call_session(
            session_id,
            "Network.emulateNetworkConditions",
            Some(json!({
                "offline": false,
                "latency": preset.latency_ms,
                "downloadThroughput": preset.download_bps,
                "uploadThroughput": preset.upload_bps,
            })),
            cancel,
        )
        .await?;
    Ok(ThrottleResult {
        preset: preset_name.to_string(),
    })
}

/// `throttle --disable`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn throttle_disable(connection: &Connection, session_id: &str, cancel: &Cancel) -> Result<ThrottleResult, Error> {
    connection
        .call_session(
            session_id,
            "Network.emulateNetworkConditions",
            Some(json!({ "offline": false, "latency": 0, "downloadThroughput": -1, "uploadThroughput": -1 })),
            cancel,
        )
        .await?;
    Ok(ThrottleResult {
        preset: "none".to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct OfflineResult {
    pub offline: bool,
}

/// `offline(true|false)`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn set_offline(connection: &Connection, session_id: &str, offline: bool, cancel: &Cancel) -> Result<OfflineResult, Error> {
    connection
        .call_session(session_id, "Network.enable", None, cancel)
        .await?;
    connection
        .call_session(
            session_id,
            "Network.emulateNetworkConditions",
            Some(json!({
                "offline": offline,
                "latency": 0,
                "downloadThroughput": -1,
                "uploadThroughput": -1,
            })),
            cancel,
        )
        .await?;
    Ok(OfflineResult { offline })
}

#[derive(Debug, Clone, Default)]
pub struct InterceptOptions {
    pub url_pattern: String,
    pub response_stage: bool,
    pub body_override: Option<String>,
    pub replacements: HashMap<String, String>,
}

/// `intercept(pattern, [response], [body], [replacements])`: enables
/// `Fetch` and runs the request-pause loop until `cancel` fires. Each
/// paused request is continued unmodified unless it is in the response
/// stage and a body override/replacement is configured; any step failure
/// falls back to continuing the request unchanged so the page is never
/// wedged.
///
/// # Errors
///
/// Propagates `Connection::call`/`subscribe` failures from enabling
/// `Fetch` itself; per-request failures are swallowed by design.
pub async fn intercept(
    connection: &Connection,
    session_id: &str,
    opts: &InterceptOptions,
    cancel: &Cancel,
) -> Result<(), Error> {
    let stage = if opts.response_stage { "Response" } else { "Request" };
    connection
        .call_session(
            session_id,
            "Fetch.enable",
            Some(json!({ "patterns": [{ "urlPattern": opts.url_pattern, "requestStage": stage }] })),
            cancel,
        )
        .await?;
    let mut sub = connection.subscribe(Some(session_id), "Fetch.requestPaused").await?;

    loop {
        let event = tokio::select! {
            event = sub.recv() => event,
            () = cancel.cancelled() => break,
        };
        let Some(event) = event else { break };
        let Some(request_id) = event.params.get("requestId").and_then(Value::as_str) else {
            continue;
        };
        let is_response_stage = event.params.get("responseStatusCode").is_some();
        if !is_response_stage || (opts.body_override.is_none() && opts.replacements.is_empty()) {
            let _ = connection
                .call_session(
                    session_id,
                    "Fetch.continueRequest",
                    Some(json!({ "requestId": request_id })),
                    cancel,
                )
                .await;
            continue;
        }
        if apply_response_rewrite(connection, session_id, request_id, &event.params, opts, cancel)
            .await
            .is_err()
        {
            let _ = connection
                .call_session(
                    session_id,
                    "Fetch.continueRequest",
                    Some(json!({ "requestId": request_id })),
                    cancel,
                )
                .await;
        }
    }

    sub.unsubscribe().await;
    let _ = connection.call_session(session_id, "Fetch.disable", None, &Cancel::none()).await;
    Ok(())
}

async fn apply_response_rewrite(
    connection: &Connection,
    session_id: &str,
    request_id: &str,
    event_params: &Value,
    opts: &InterceptOptions,
    cancel: &Cancel,
) -> Result<(), Error> {
    let body_result = connection
        .call_session(
            session_id,
            "Fetch.getResponseBody",
            Some(json!({ "requestId": request_id })),
            cancel,
        )
        .await?;
    let raw_body = body_result.get("body").and_then(Value::as_str).unwrap_or("");
    let base64_encoded = body_result.get("base64Encoded").and_then(Value::as_bool).unwrap_or(false);
    let decoded = if base64_encoded {
        String::from_utf8(BASE64.decode(raw_body).map_err(|e| Error::Protocol {
            code: -32016,
            message: format!("malformed response body base64: {e}"),
        })?)
        .map_err(|e| Error::Protocol {
            code: -32017,
            message: format!("response body is not valid utf-8: {e}"),
        })?
    } else {
        raw_body.to_string()
    };

    let new_body = if let Some(override_body) = &opts.body_override {
        override_body.clone()
    } else {
        let mut body = decoded;
        for (from, to) in &opts.replacements {
            body = body.replace(from.as_str(), to.as_str());
        }
        body
    };

    let response_code = event_params.get("responseStatusCode").and_then(Value::as_i64).unwrap_or(200);
    let headers: Vec<Value> = event_params
        .get("responseHeaders")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    connection
        .call_session(
            session_id,
            "Fetch.fulfillRequest",
            Some(json!({
                "requestId": request_id,
                "responseCode": response_code,
                "responseHeaders": headers,
                "body": BASE64.encode(new_body.as_bytes()),
            })),
            cancel,
        )
        .await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct HarEntry {
    pub method: String,
    pub url: String,
    pub status: i64,
    pub mime_type: String,
    pub headers: Vec<(String, String)>,
    pub time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarDocument {
    pub version: &'static str,
    pub entries: Vec<HarEntry>,
}

struct HarInFlight {
    method: String,
    url: String,
    started_at: Instant,
    status: i64,
    mime_type: String,
    headers: Vec<(String, String)>,
    time_ms: f64,
}

/// `har(duration)`: collects `Network.requestWillBeSent` /
/// `responseReceived` / `loadingFinished` for `duration` and assembles a
/// HAR 1.2 document. Entries are emitted even for requests with no
/// observed response (status 0, empty fields).
///
/// # Errors
///
/// Propagates `Connection::call`/`subscribe` failures.
pub async fn har(
    connection: &Connection,
    session_id: &str,
    duration: Duration,
    cancel: &Cancel,
) -> Result<HarDocument, Error> {
    connection
        .call_session(session_id, "Network.enable", None, cancel)
        .await?;
    let mut started = connection.subscribe(Some(session_id), "Network.requestWillBeSent").await?;
    let mut received = connection.subscribe(Some(session_id), "Network.responseReceived").await?;
    let mut finished = connection.subscribe(Some(session_id), "Network.loadingFinished").await?;

    let mut order: Vec<String> = Vec::new();
    let mut entries: HashMap<String, HarInFlight> = HashMap::new();
    let deadline = Instant::now() + duration;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::select! {
            event = started.recv() => {
                let Some(event) = event else { break };
                if let Some(id) = event.params.get("requestId").and_then(Value::as_str) {
                    let request = event.params.get("request");
                    let method = request.and_then(|r| r.get("method")).and_then(Value::as_str).unwrap_or("GET").to_string();
                    let url = request.and_then(|r| r.get("url")).and_then(Value::as_str).unwrap_or("").to_string();
                    order.push(id.to_string());
                    entries.insert(id.to_string(), HarInFlight {
                        method, url, started_at: Instant::now(), status: 0, mime_type: String::new(), headers: Vec::new(), time_ms: 0.0,
                    });
                }
            }
            event = received.recv() => {
                let Some(event) = event else { break };
                if let Some(id) = event.params.get("requestId").and_then(Value::as_str) {
                    if let Some(entry) = entries.get_mut(id) {
                        let response = event.params.get("response");
                        entry.status = response.and_then(|r| r.get("status")).and_then(Value::as_i64).unwrap_or(0);
                        entry.mime_type = response.and_then(|r| r.get("mimeType")).and_then(Value::as_str).unwrap_or("").to_string();
                        entry.headers = response
                            .and_then(|r| r.get("headers"))
                            .and_then(Value::as_object)
                            .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.as_str().unwrap_or("").to_string())).collect())
                            .unwrap_or_default();
                    }
                }
            }
            event = finished.recv() => {
                let Some(event) = event else { break };
                if let Some(id) = event.params.get("requestId").and_then(Value::as_str) {
                    if let Some(entry) = entries.get_mut(id) {
                        entry.time_ms = entry.started_at.elapsed().as_secs_f64() * 1000.0;
                    }
                }
            }
            () = tokio::time::sleep(remaining) => break,
            () = cancel.cancelled() => { break; }
        }
    }

    started.unsubscribe().await;
    received.unsubscribe().await;
    finished.unsubscribe().await;

    let out_entries = order
        .into_iter()
        .filter_map(|id| entries.remove(&id))
        .map(|e| HarEntry {
            method: e.method,
            url: e.url,
            status: e.status,
            mime_type: e.mime_type,
            headers: e.headers,
            time_ms: e.time_ms,
        })
        .collect();

    Ok(HarDocument {
        version: "1.2",
        entries: out_entries,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseBodyResult {
    pub body: String,
    #[serde(rename = "base64Encoded")]
    pub base64_encoded: bool,
}

/// `responsebody(request_id)`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn response_body(
    connection: &Connection,
    session_id: &str,
    request_id: &str,
    cancel: &Cancel,
) -> Result<ResponseBodyResult, Error> {
    connection
        .call_session(session_id, "Network.enable", None, cancel)
        .await?;
    let result = connection
        .call_session(
            session_id,
            "Network.getResponseBody",
            Some(json!({ "requestId": request_id })),
            cancel,
        )
        .await?;
    Ok(ResponseBodyResult {
        body: result.get("body").and_then(Value::as_str).unwrap_or("").to_string(),
        base64_encoded: result.get("base64Encoded").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// A single item of the raw per-request/per-response capture stream,
/// re-exposing the same `NetworkEvent` the console/exception/navigation
/// streams share.
///
/// # Errors
///
/// Propagates `Connection::call`/`subscribe` failures.
pub async fn raw_capture(
    connection: &Connection,
    session_id: &str,
) -> Result<crate::cdp::EventStream<crate::cdp::NetworkEvent>, Error> {
    crate::cdp::network(connection, session_id).await
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageRange {
    pub script_id: String,
    pub start_offset: i64,
    pub end_offset: i64,
    pub count: i64,
}

/// `coverage()`: JS precise coverage via `Profiler.startPreciseCoverage` /
/// `takePreciseCoverage`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn js_coverage_start(connection: &Connection, session_id: &str, cancel: &Cancel) -> Result<(), Error> {
    connection
        .call_session(session_id, "Profiler.enable", None, cancel)
        .await?;
    connection
        .call_session(
            session_id,
            "Profiler.startPreciseCoverage",
            Some(json!({ "callCount": true, "detailed": true })),
            cancel,
        )
        .await?;
    Ok(())
}

/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn js_coverage_stop(connection: &Connection, session_id: &str, cancel: &Cancel) -> Result<Vec<CoverageRange>, Error> {
    let result = connection
        .call_session(session_id, "Profiler.takePreciseCoverage", None, cancel)
        .await?;
    let mut ranges = Vec::new();
    if let Some(scripts) = result.get("result").and_then(Value::as_array) {
        for script in scripts {
            let script_id = script.get("scriptId").and_then(Value::as_str).unwrap_or("").to_string();
            if let Some(functions) = script.get("functions").and_then(Value::as_array) {
                for function in functions {
                    if let Some(function_ranges) = function.get("ranges").and_then(Value::as_array) {
                        for r in function_ranges {
                            ranges.push(CoverageRange {
                                script_id: script_id.clone(),
                                start_offset: r.get("startOffset").and_then(Value::as_i64).unwrap_or(0),
                                end_offset: r.get("endOffset").and_then(Value::as_i64).unwrap_or(0),
                                count: r.get("count").and_then(Value::as_i64).unwrap_or(0),
                            });
                        }
                    }
                }
            }
        }
    }
    connection
        .call_session(session_id, "Profiler.stopPreciseCoverage", None, cancel)
        .await?;
    connection
        .call_session(session_id, "Profiler.disable", None, cancel)
        .await?;
    Ok(ranges)
}

/// `css_coverage()`: `CSS.startRuleUsageTracking` / `takeCoverageDelta`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn css_coverage_start(connection: &Connection, session_id: &str, cancel: &Cancel) -> Result<(), Error> {
    connection
        .call_session(session_id, "DOM.enable", None, cancel)
        .await?;
    connection
        .call_session(session_id, "CSS.enable", None, cancel)
        .await?;
    connection
        .call_session(session_id, "CSS.startRuleUsageTracking", None, cancel)
        .await?;
    Ok(())
}

/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn css_coverage_stop(connection: &Connection, session_id: &str, cancel: &Cancel) -> Result<Value, Error> {
    let delta = connection
        .call_session(session_id, "CSS.takeCoverageDelta", None, cancel)
        .await?;
    connection
        .call_session(session_id, "CSS.disable", None, cancel)
        .await?;
    Ok(delta)
}

/// `heapsnapshot()`: concatenates `HeapProfiler.addHeapSnapshotChunk`
/// chunks in receipt order into one buffer.
///
/// # Errors
///
/// Propagates `Connection::call`/`subscribe` failures.
pub async fn heapsnapshot(connection: &Connection, session_id: &str, cancel: &Cancel) -> Result<String, Error> {
    connection
        .call_session(session_id, "HeapProfiler.enable", None, cancel)
        .await?;
    let mut sub = connection
        .subscribe(Some(session_id), "HeapProfiler.addHeapSnapshotChunk")
        .await?;

    let call_future = connection.call_session(
        session_id,
        "HeapProfiler.takeHeapSnapshot",
        Some(json!({ "reportProgress": false })),
        cancel,
    );
    tokio::pin!(call_future);

    let mut buffer = String::new();
    let mut call_done = false;
    let result = loop {
        if call_done {
            // Drain any chunks still queued after the call resolved.
            match sub.recv().await {
                Some(event) => {
                    if let Some(chunk) = event.params.get("chunk").and_then(Value::as_str) {
                        buffer.push_str(chunk);
                    }
                    continue;
                }
                None => break Ok(()),
            }
        }
        tokio::select! {
            biased;
            call_result = &mut call_future, if !call_done => {
                call_done = true;
                if let Err(e) = call_result { break Err(e); }
            }
            event = sub.recv() => {
                match event {
                    Some(event) => {
                        if let Some(chunk) = event.params.get("chunk").and_then(Value::as_str) {
                            buffer.push_str(chunk);
                        }
                    }
                    None => break Ok(()),
                }
            }
            () = cancel.cancelled() => break Err(Error::Cancelled),
        }
    };
    sub.unsubscribe().await;
    result?;
    Ok(buffer)
}

const TRACING_COMPLETE_BUDGET: Duration = Duration::from_secs(10);

/// `trace(duration)`: `Tracing.start`, sleep, `Tracing.end`, collect
/// `dataCollected` events until `tracingComplete` (up to a 10 s budget),
/// serialized as a JSON array.
///
/// # Errors
///
/// Propagates `Connection::call`/`subscribe` failures.
pub async fn trace(connection: &Connection, session_id: &str, duration: Duration, cancel: &Cancel) -> Result<Vec<Value>, Error> {
    let mut data_sub = raw_stream(connection, Some(session_id), &["Tracing.dataCollected"]).await?;
    let mut complete_sub = raw_stream(connection, Some(session_id), &["Tracing.tracingComplete"]).await?;

    connection
        .call_session(
            session_id,
            "Tracing.start",
            Some(json!({
                "categories": "-*,devtools.timeline,v8.execute,disabled-by-default-devtools.timeline",
            })),
            cancel,
        )
        .await?;

    sleep_or_cancel(duration, cancel).await?;

    connection
        .call_session(session_id, "Tracing.end", None, cancel)
        .await?;

    let mut events = Vec::new();
    let deadline = Instant::now() + TRACING_COMPLETE_BUDGET;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::select! {
            event = data_sub.next() => {
                if let Some(raw) = event {
                    if let Some(arr) = raw.params.get("value").and_then(Value::as_array) {
                        events.extend(arr.iter().cloned());
                    }
                }
            }
            event = complete_sub.next() => {
                if event.is_some() {
                    break;
                }
            }
            () = tokio::time::sleep(remaining) => break,
        }
    }
    data_sub.stop().await;
    complete_sub.stop().await;
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_preset_table_has_fixed_names() {
        assert!(throttle_preset("slow3g").is_some());
        assert!(throttle_preset("fast3g").is_some());
        assert!(throttle_preset("4g").is_some());
        assert!(throttle_preset("wifi").is_some());
        assert!(throttle_preset("5g").is_none());
    }

    #[test]
    fn throttle_preset_latency_ordering() {
        let slow = throttle_preset("slow3g").unwrap();
        let wifi = throttle_preset("wifi").unwrap();
        assert!(slow.latency_ms > wifi.latency_ms);
        assert!(slow.download_bps < wifi.download_bps);
    }
}
