//! Page operations: navigation, history, reload, source/info extraction,
//! screenshot/PDF, scroll, viewport/emulation, tabs.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};

use super::evaluate;
use crate::cdp::{Cancel, Connection, SessionManager};
use crate::error::Error;

const NAVIGATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct NavigateResult {
    pub navigated: bool,
    pub url: String,
}

/// `navigate(url)`.
///
/// # Errors
///
/// `Error::Protocol` (surfaced as `NavigationFailed`) if the browser
/// reports a non-empty `errorText`.
pub async fn navigate(
    connection: &Connection,
    session_id: &str,
    url: &str,
    cancel: &Cancel,
) -> Result<NavigateResult, Error> {
    connection
        .call_session(session_id, "Page.enable", None, cancel)
        .await?;
    let result = connection
        .call_session(session_id, "Page.navigate", Some(json!({ "url": url })), cancel)
        .await?;
    check_navigate_error(&result)?;
    Ok(NavigateResult {
        navigated: true,
        url: url.to_string(),
    })
}

fn check_navigate_error(result: &Value) -> Result<(), Error> {
    if let Some(text) = result.get("errorText").and_then(Value::as_str) {
        if !text.is_empty() {
            let frame_id = result.get("frameId").and_then(Value::as_str).unwrap_or("");
            return Err(Error::Protocol {
                code: -32010,
                message: format!("NavigationFailed({text}, frame={frame_id})"),
            });
        }
    }
    Ok(())
}

/// `navigate --wait`: subscribes to `Page.loadEventFired` before issuing
/// the navigate call and waits (30 s ceiling) for it, unless the navigate
/// reply itself already reports a failure.
///
/// # Errors
///
/// `Error::Protocol` on immediate navigation failure, `Error::Timeout` if
/// the load event never arrives, `Error::Cancelled` on cancellation.
pub async fn navigate_and_wait(
    connection: &Connection,
    session_id: &str,
    url: &str,
    cancel: &Cancel,
) -> Result<NavigateResult, Error> {
    connection
        .call_session(session_id, "Page.enable", None, cancel)
        .await?;
    let mut sub = connection
        .subscribe(Some(session_id), "Page.loadEventFired")
        .await?;
    let result = connection
        .call_session(session_id, "Page.navigate", Some(json!({ "url": url })), cancel)
        .await?;
    check_navigate_error(&result)?;

    let outcome = tokio::select! {
        event = sub.recv() => {
            if event.is_some() {
                Ok(())
            } else {
                Err(Error::ConnectionClosed)
            }
        }
        () = tokio::time::sleep(NAVIGATION_TIMEOUT) => Err(Error::Timeout),
        () = cancel.cancelled() => Err(Error::Cancelled),
    };
    sub.unsubscribe().await;
    outcome?;
    Ok(NavigateResult {
        navigated: true,
        url: url.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryResult {
    pub navigated: bool,
    pub direction: &'static str,
}

async fn navigate_history(
    connection: &Connection,
    session_id: &str,
    delta: i64,
    direction: &'static str,
    cancel: &Cancel,
) -> Result<HistoryResult, Error> {
    connection
        .call_session(session_id, "Page.enable", None, cancel)
        .await?;
    let history = connection
        .call_session(session_id, "Page.getNavigationHistory", None, cancel)
        .await?;
    let current_index = history.get("currentIndex").and_then(Value::as_i64).unwrap_or(0);
    let entries = history.get("entries").and_then(Value::as_array).cloned().unwrap_or_default();
    let target_index = current_index + delta;
    if target_index < 0 || target_index as usize >= entries.len() {
        return Err(Error::unsupported(format!("NoHistory({direction})")));
    }
    let entry_id = entries[target_index as usize]
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Protocol {
            code: -32011,
            message: "history entry missing id".to_string(),
        })?;
    connection
        .call_session(
            session_id,
            "Page.navigateToHistoryEntry",
            Some(json!({ "entryId": entry_id })),
            cancel,
        )
        .await?;
    Ok(HistoryResult {
        navigated: true,
        direction,
    })
}

/// # Errors
///
/// `Error::Unsupported` (`NoHistory`) at the start of history.
pub async fn go_back(connection: &Connection, session_id: &str, cancel: &Cancel) -> Result<HistoryResult, Error> {
    navigate_history(connection, session_id, -1, "back", cancel).await
}

/// # Errors
///
/// `Error::Unsupported` (`NoHistory`) at the end of history.
pub async fn go_forward(connection: &Connection, session_id: &str, cancel: &Cancel) -> Result<HistoryResult, Error> {
    navigate_history(connection, session_id, 1, "forward", cancel).await
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadResult {
    pub reloaded: bool,
}

/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn reload(
    connection: &Connection,
    session_id: &str,
    ignore_cache: bool,
    cancel: &Cancel,
) -> Result<ReloadResult, Error> {
    connection
        .call_session(session_id, "Page.enable", None, cancel)
        .await?;
    connection
        .call_session(
            session_id,
            "Page.reload",
            Some(json!({ "ignoreCache": ignore_cache })),
            cancel,
        )
        .await?;
    Ok(ReloadResult { reloaded: true })
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceResult {
    pub html: String,
}

/// `source()`: `DOM.getDocument{depth:-1}` + `DOM.getOuterHTML`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn source(connection: &Connection, session_id: &str, cancel: &Cancel) -> Result<SourceResult, Error> {
    connection
        .call_session(session_id, "DOM.enable", None, cancel)
        .await?;
    let doc = connection
        .call_session(session_id, "DOM.getDocument", Some(json!({ "depth": -1 })), cancel)
        .await?;
    let root_id = doc
        .get("root")
        .and_then(|r| r.get("nodeId"))
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Protocol {
            code: -32005,
            message: "DOM.getDocument response missing root nodeId".to_string(),
        })?;
    let result = connection
        .call_session(
            session_id,
            "DOM.getOuterHTML",
            Some(json!({ "nodeId": root_id })),
            cancel,
        )
        .await?;
    Ok(SourceResult {
        html: result.get("outerHTML").and_then(Value::as_str).unwrap_or("").to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoResult {
    pub title: String,
    pub url: String,
    #[serde(rename = "readyState")]
    pub ready_state: String,
    #[serde(rename = "characterSet")]
    pub character_set: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
}

/// `info()`: one `Runtime.evaluate` returning the page's identity fields.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn info(connection: &Connection, session_id: &str, cancel: &Cancel) -> Result<InfoResult, Error> {
    let script = "({title:document.title,url:document.URL,readyState:document.readyState,\
                   characterSet:document.characterSet,contentType:document.contentType})";
    let value = evaluate(connection, session_id, script, cancel).await?;
    serde_json::from_value(value).map_err(|e| Error::Protocol {
        code: -32012,
        message: format!("malformed page info: {e}"),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ScreenshotResult {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }
}

/// `screenshot(format?, quality?)`.
///
/// # Errors
///
/// Propagates `Connection::call` failures or a malformed base64 payload.
pub async fn screenshot(
    connection: &Connection,
    session_id: &str,
    format: Option<&str>,
    quality: Option<i64>,
    cancel: &Cancel,
) -> Result<ScreenshotResult, Error> {
    let mut params = json!({});
    if let Some(f) = format {
        params["format"] = json!(f);
    }
    if let Some(q) = quality {
        params["quality"] = json!(q);
    }
    let result = connection
        .call_session(session_id, "Page.captureScreenshot", Some(params), cancel)
        .await?;
    decode_screenshot(&result)
}

/// `screenshot_element(selector, format?, quality?)`: additionally clips
/// to the element's bounding rect.
///
/// # Errors
///
/// `Error::NotFound` if `selector` matches nothing.
pub async fn screenshot_element(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    format: Option<&str>,
    quality: Option<i64>,
    cancel: &Cancel,
) -> Result<ScreenshotResult, Error> {
    let escaped = selector.replace('\\', "\\\\").replace('"', "\\\"");
    let script = format!(
        "document.querySelector(\"{escaped}\").getBoundingClientRect().toJSON()"
    );
    let rect = evaluate(connection, session_id, &script, cancel).await?;
    if rect.is_null() {
        return Err(Error::not_found(selector));
    }
    let clip = json!({
        "x": rect.get("x").and_then(Value::as_f64).unwrap_or(0.0),
        "y": rect.get("y").and_then(Value::as_f64).unwrap_or(0.0),
        "width": rect.get("width").and_then(Value::as_f64).unwrap_or(0.0),
        "height": rect.get("height").and_then(Value::as_f64).unwrap_or(0.0),
        "scale": 1,
    });
    let mut params = json!({ "clip": clip });
    if let Some(f) = format {
        params["format"] = json!(f);
        if matches!(f, "jpeg" | "webp") {
            if let Some(q) = quality {
                params["quality"] = json!(q);
            }
        }
    }
    let result = connection
        .call_session(session_id, "Page.captureScreenshot", Some(params), cancel)
        .await?;
    decode_screenshot(&result)
}

fn decode_screenshot(result: &Value) -> Result<ScreenshotResult, Error> {
    let data = result
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol {
            code: -32013,
            message: "Page.captureScreenshot response missing data".to_string(),
        })?;
    let bytes = BASE64.decode(data).map_err(|e| Error::Protocol {
        code: -32014,
        message: format!("malformed screenshot base64: {e}"),
    })?;
    Ok(ScreenshotResult { data: bytes })
}

#[derive(Debug, Clone, Serialize)]
pub struct PdfResult {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// `pdf(opts?)`.
///
/// # Errors
///
/// Propagates `Connection::call` failures or a malformed base64 payload.
pub async fn pdf(
    connection: &Connection,
    session_id: &str,
    opts: Option<Value>,
    cancel: &Cancel,
) -> Result<PdfResult, Error> {
    let result = connection
        .call_session(session_id, "Page.printToPDF", opts, cancel)
        .await?;
    let data = result
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol {
            code: -32015,
            message: "Page.printToPDF response missing data".to_string(),
        })?;
    let bytes = BASE64.decode(data).map_err(|e| Error::Protocol {
        code: -32014,
        message: format!("malformed pdf base64: {e}"),
    })?;
    Ok(PdfResult { data: bytes })
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DevicePreset {
    pub width: i64,
    pub height: i64,
    pub scale_factor: f64,
    pub mobile: bool,
}

pub fn device_preset(name: &str) -> Option<(DevicePreset, &'static str)> {
    Some(match name {
        "iPhone SE" => (DevicePreset { width: 375, height: 667, scale_factor: 2.0, mobile: true }, IPHONE_SE_UA),
        "iPhone 12" => (DevicePreset { width: 390, height: 844, scale_factor: 3.0, mobile: true }, IPHONE_12_UA),
        "iPhone 12 Pro" => (DevicePreset { width: 390, height: 844, scale_factor: 3.0, mobile: true }, IPHONE_12_UA),
        "iPhone 12 Pro Max" => (DevicePreset { width: 428, height: 926, scale_factor: 3.0, mobile: true }, IPHONE_12_UA),
        "Pixel 5" => (DevicePreset { width: 393, height: 851, scale_factor: 2.75, mobile: true }, PIXEL_5_UA),
        "Galaxy S21" => (DevicePreset { width: 360, height: 800, scale_factor: 3.0, mobile: true }, GALAXY_S21_UA),
        "iPad" => (DevicePreset { width: 810, height: 1080, scale_factor: 2.0, mobile: true }, IPAD_UA),
        "iPad Pro" => (DevicePreset { width: 1024, height: 1366, scale_factor: 2.0, mobile: true }, IPAD_UA),
        _ => return None,
    })
}

const IPHONE_SE_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 15_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Mobile/15E148 Safari/604.1";
const IPHONE_12_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 15_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Mobile/15E148 Safari/604.1";
const PIXEL_5_UA: &str = "Mozilla/5.0 (Linux; Android 12; Pixel 5) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/111.0.0.0 Mobile Safari/537.36";
const GALAXY_S21_UA: &str = "Mozilla/5.0 (Linux; Android 12; SM-G991B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/111.0.0.0 Mobile Safari/537.36";
const IPAD_UA: &str = "Mozilla/5.0 (iPad; CPU OS 15_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Mobile/15E148 Safari/604.1";

#[derive(Debug, Clone, Serialize)]
pub struct ViewportResult {
    pub set: bool,
    pub width: i64,
    pub height: i64,
}

/// `viewport(width, height, scale?, mobile?)`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn viewport(
    connection: &Connection,
    session_id: &str,
    width: i64,
    height: i64,
    scale: Option<f64>,
    mobile: bool,
    cancel: &Cancel,
) -> Result<ViewportResult, Error> {
    connection
        .call_session(
            session_id,
            "Emulation.setDeviceMetricsOverride",
            Some(json!({
                "width": width,
                "height": height,
                "deviceScaleFactor": scale.unwrap_or(1.0),
                "mobile": mobile,
            })),
            cancel,
        )
        .await?;
    Ok(ViewportResult { set: true, width, height })
}

#[derive(Debug, Clone, Serialize)]
pub struct UserAgentResult {
    pub set: bool,
    pub user_agent: String,
}

/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn set_user_agent(
    connection: &Connection,
    session_id: &str,
    user_agent: &str,
    cancel: &Cancel,
) -> Result<UserAgentResult, Error> {
    connection
        .call_session(
            session_id,
            "Emulation.setUserAgentOverride",
            Some(json!({ "userAgent": user_agent })),
            cancel,
        )
        .await?;
    Ok(UserAgentResult {
        set: true,
        user_agent: user_agent.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct EmulateResult {
    pub device: String,
    pub width: i64,
    pub height: i64,
}

/// `emulate(device)`: combines `viewport` + `set_user_agent` from the
/// fixed device table.
///
/// # Errors
///
/// `Error::Unsupported` (`UnknownDevice`) if `device` is not in the table.
pub async fn emulate(
    connection: &Connection,
    session_id: &str,
    device: &str,
    cancel: &Cancel,
) -> Result<EmulateResult, Error> {
    let (preset, ua) = device_preset(device).ok_or_else(|| Error::unsupported(format!("UnknownDevice({device})")))?;
    viewport(connection, session_id, preset.width, preset.height, Some(preset.scale_factor), preset.mobile, cancel).await?;
    set_user_agent(connection, session_id, ua, cancel).await?;
    Ok(EmulateResult {
        device: device.to_string(),
        width: preset.width,
        height: preset.height,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaResult {
    pub set: bool,
}

/// `media(features)`: `features` maps names (`prefers-color-scheme`,
/// `prefers-reduced-motion`, `forced-colors`) to values.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn media(
    connection: &Connection,
    session_id: &str,
    features: &HashMap<String, String>,
    cancel: &Cancel,
) -> Result<MediaResult, Error> {
    let entries: Vec<Value> = features
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    connection
        .call_session(
            session_id,
            "Emulation.setEmulatedMedia",
            Some(json!({ "features": entries })),
            cancel,
        )
        .await?;
    Ok(MediaResult { set: true })
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrollResult {
    pub scrolled: bool,
}

/// `scrollto(selector)`.
///
/// # Errors
///
/// `Error::NotFound` if `selector` matches nothing.
pub async fn scrollto(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    cancel: &Cancel,
) -> Result<ScrollResult, Error> {
    let escaped = selector.replace('\\', "\\\\").replace('"', "\\\"");
    let script = format!(
        "(function(){{const e=document.querySelector(\"{escaped}\");\
         if(!e)return false;e.scrollIntoView({{behavior:'instant',block:'center'}});return true;}})()"
    );
    let found = evaluate(connection, session_id, &script, cancel).await?;
    if !found.as_bool().unwrap_or(false) {
        return Err(Error::not_found(selector));
    }
    Ok(ScrollResult { scrolled: true })
}

/// `scrolltop()`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn scrolltop(connection: &Connection, session_id: &str, cancel: &Cancel) -> Result<ScrollResult, Error> {
    evaluate(connection, session_id, "window.scrollTo(0,0)", cancel).await?;
    Ok(ScrollResult { scrolled: true })
}

/// `scrollbottom()`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn scrollbottom(connection: &Connection, session_id: &str, cancel: &Cancel) -> Result<ScrollResult, Error> {
    evaluate(
        connection,
        session_id,
        "window.scrollTo(0,document.body.scrollHeight)",
        cancel,
    )
    .await?;
    Ok(ScrollResult { scrolled: true })
}

/// `scroll(dx, dy)`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn scroll(
    connection: &Connection,
    session_id: &str,
    dx: f64,
    dy: f64,
    cancel: &Cancel,
) -> Result<ScrollResult, Error> {
    evaluate(connection, session_id, &format!("window.scrollBy({dx},{dy})"), cancel).await?;
    Ok(ScrollResult { scrolled: true })
}

#[derive(Debug, Clone, Serialize)]
pub struct NewTabResult {
    pub target_id: String,
}

/// `new_tab(url?)`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn new_tab(sessions: &SessionManager, url: Option<&str>) -> Result<NewTabResult, Error> {
    let target_id = sessions.new_tab(url).await?;
    Ok(NewTabResult { target_id })
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseTabResult {
    pub closed: bool,
}

/// Closes a tab, dropping its cached session first so a later operation
/// against the same target id re-attaches instead of reusing a stale
/// session.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn close_tab(sessions: &SessionManager, target_id: &str) -> Result<CloseTabResult, Error> {
    sessions.close_tab(target_id).await?;
    Ok(CloseTabResult { closed: true })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_preset_known_names() {
        assert!(device_preset("iPhone SE").is_some());
        assert!(device_preset("iPad Pro").is_some());
        assert!(device_preset("Nokia 3310").is_none());
    }

    #[test]
    fn check_navigate_error_ignores_empty_error_text() {
        let v = json!({ "frameId": "f1", "errorText": "" });
        assert!(check_navigate_error(&v).is_ok());
    }

    #[test]
    fn check_navigate_error_surfaces_non_empty_error_text() {
        let v = json!({ "frameId": "f1", "errorText": "net::ERR_ABORTED" });
        let err = check_navigate_error(&v).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }
}
