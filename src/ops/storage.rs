//! Storage, permissions, and emulation extras: cookies, local/session
//! storage, permissions, geolocation, clipboard, dialogs.

use serde::Serialize;
use serde_json::{json, Value};

use super::{evaluate, evaluate_await_promise};
use crate::cdp::{Cancel, Connection};
use crate::error::Error;

#[derive(Debug, Clone, Serialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

/// `cookies()`: `Network.getCookies`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn cookies(connection: &Connection, session_id: &str, cancel: &Cancel) -> Result<Vec<Cookie>, Error> {
    let result = connection
        .call_session(session_id, "Network.getCookies", None, cancel)
        .await?;
    let raw = result.get("cookies").and_then(Value::as_array).cloned().unwrap_or_default();
    Ok(raw
        .into_iter()
        .map(|c| Cookie {
            name: c.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
            value: c.get("value").and_then(Value::as_str).unwrap_or("").to_string(),
            domain: c.get("domain").and_then(Value::as_str).unwrap_or("").to_string(),
            path: c.get("path").and_then(Value::as_str).unwrap_or("/").to_string(),
        })
        .collect())
}

#[derive(Debug, Clone, Default)]
pub struct SetCookieArgs {
    pub name: String,
    pub value: String,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: Option<bool>,
    pub http_only: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetCookieResult {
    pub set: bool,
    pub name: String,
}

/// `cookies --set name=value [...]`. Only non-empty/non-default fields are
/// forwarded on the wire.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn set_cookie(
    connection: &Connection,
    session_id: &str,
    args: &SetCookieArgs,
    cancel: &Cancel,
) -> Result<SetCookieResult, Error> {
    let mut params = json!({ "name": args.name, "value": args.value });
    if let Some(url) = &args.url {
        params["url"] = json!(url);
    }
    if let Some(domain) = &args.domain {
        params["domain"] = json!(domain);
    }
    if let Some(path) = &args.path {
        params["path"] = json!(path);
    }
    if let Some(true) = args.secure {
        params["secure"] = json!(true);
    }
    if let Some(true) = args.http_only {
        params["httpOnly"] = json!(true);
    }
    connection
        .call_session(session_id, "Network.setCookie", Some(params), cancel)
        .await?;
    Ok(SetCookieResult {
        set: true,
        name: args.name.clone(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteCookiesResult {
    pub deleted: bool,
}

/// `cookies --delete name [--domain d] [--path p]`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn delete_cookies(
    connection: &Connection,
    session_id: &str,
    name: &str,
    domain: Option<&str>,
    path: Option<&str>,
    cancel: &Cancel,
) -> Result<DeleteCookiesResult, Error> {
    let mut params = json!({ "name": name });
    if let Some(d) = domain {
        params["domain"] = json!(d);
    }
    if let Some(p) = path {
        params["path"] = json!(p);
    }
    connection
        .call_session(session_id, "Network.deleteCookies", Some(params), cancel)
        .await?;
    Ok(DeleteCookiesResult { deleted: true })
}

/// `cookies --clear`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn clear_cookies(connection: &Connection, session_id: &str, cancel: &Cancel) -> Result<DeleteCookiesResult, Error> {
    connection
        .call_session(session_id, "Network.clearBrowserCookies", None, cancel)
        .await?;
    Ok(DeleteCookiesResult { deleted: true })
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageResult {
    pub key: String,
    pub value: String,
}

fn storage_api(session: bool) -> &'static str {
    if session { "sessionStorage" } else { "localStorage" }
}

/// `storage key value` (set) or `storage key` (get, returns `value: ""`
/// if absent).
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn storage_get(
    connection: &Connection,
    session_id: &str,
    key: &str,
    use_session_storage: bool,
    cancel: &Cancel,
) -> Result<StorageResult, Error> {
    let api = storage_api(use_session_storage);
    let escaped = key.replace('\\', "\\\\").replace('"', "\\\"");
    let script = format!("{api}.getItem(\"{escaped}\") ?? \"\"");
    let value = evaluate(connection, session_id, &script, cancel).await?;
    Ok(StorageResult {
        key: key.to_string(),
        value: value.as_str().unwrap_or("").to_string(),
    })
}

/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn storage_set(
    connection: &Connection,
    session_id: &str,
    key: &str,
    value: &str,
    use_session_storage: bool,
    cancel: &Cancel,
) -> Result<StorageResult, Error> {
    let api = storage_api(use_session_storage);
    let key_esc = key.replace('\\', "\\\\").replace('"', "\\\"");
    let val_esc = value.replace('\\', "\\\\").replace('"', "\\\"");
    let script = format!("{api}.setItem(\"{key_esc}\",\"{val_esc}\")");
    evaluate(connection, session_id, &script, cancel).await?;
    Ok(StorageResult {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// `storage --clear`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn storage_clear(
    connection: &Connection,
    session_id: &str,
    use_session_storage: bool,
    cancel: &Cancel,
) -> Result<(), Error> {
    let api = storage_api(use_session_storage);
    evaluate(connection, session_id, &format!("{api}.clear()"), cancel).await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct PermissionResult {
    pub permission: String,
    pub setting: String,
}

/// `permission(name, setting)`: resolves the target's origin first
/// (`Error::Unsupported`/`NoOrigin` if null), then
/// `Browser.setPermission` at the browser level.
///
/// # Errors
///
/// `Error::Unsupported` (`NoOrigin`) if the page has no origin.
pub async fn set_permission(
    connection: &Connection,
    session_id: &str,
    name: &str,
    setting: &str,
    cancel: &Cancel,
) -> Result<PermissionResult, Error> {
    let origin = evaluate(connection, session_id, "window.location.origin", cancel).await?;
    let origin = origin
        .as_str()
        .filter(|o| !o.is_empty() && *o != "null")
        .ok_or_else(|| Error::unsupported("NoOrigin"))?;
    connection
        .call(
            "Browser.setPermission",
            Some(json!({
                "permission": { "name": name },
                "setting": setting,
                "origin": origin,
            })),
            cancel,
        )
        .await?;
    Ok(PermissionResult {
        permission: name.to_string(),
        setting: setting.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct GeolocationResult {
    pub set: bool,
    pub latitude: f64,
    pub longitude: f64,
}

/// `geolocation(lat, lon)`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn set_geolocation(
    connection: &Connection,
    session_id: &str,
    latitude: f64,
    longitude: f64,
    cancel: &Cancel,
) -> Result<GeolocationResult, Error> {
    connection
        .call_session(
            session_id,
            "Emulation.setGeolocationOverride",
            Some(json!({ "latitude": latitude, "longitude": longitude, "accuracy": 1 })),
            cancel,
        )
        .await?;
    Ok(GeolocationResult { set: true, latitude, longitude })
}

#[derive(Debug, Clone, Serialize)]
pub struct ClipboardResult {
    pub value: String,
}

/// `clipboard --read`: best-effort grants `clipboard-read` then reads via
/// `navigator.clipboard.readText()`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn clipboard_read(connection: &Connection, session_id: &str, cancel: &Cancel) -> Result<ClipboardResult, Error> {
    let _ = set_permission(connection, session_id, "clipboard-read", "granted", cancel).await;
    let value = evaluate_await_promise(connection, session_id, "navigator.clipboard.readText()", cancel).await?;
    Ok(ClipboardResult {
        value: value.as_str().unwrap_or("").to_string(),
    })
}

/// `clipboard --write text`: best-effort grants `clipboard-write` then
/// writes via `navigator.clipboard.writeText(text)`.
///
/// # Errors
///
/// Propagates `Connection::call` failures.
pub async fn clipboard_write(
    connection: &Connection,
    session_id: &str,
    text: &str,
    cancel: &Cancel,
) -> Result<ClipboardResult, Error> {
    let _ = set_permission(connection, session_id, "clipboard-write", "granted", cancel).await;
    let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
    let script = format!("navigator.clipboard.writeText(\"{escaped}\")");
    evaluate_await_promise(connection, session_id, &script, cancel).await?;
    Ok(ClipboardResult { value: text.to_string() })
}

#[derive(Debug, Clone, Serialize)]
pub struct DialogResult {
    pub handled: bool,
    pub message: String,
}

/// `handle_dialog(accept, prompt_text?)`: enables `Page`, subscribes to
/// `Page.javascriptDialogOpening`, and handles the first dialog that
/// opens within the caller's cancellation/deadline.
///
/// # Errors
///
/// `Error::Cancelled` if cancelled before a dialog opens,
/// `Error::ConnectionClosed` if the connection closes first.
pub async fn handle_dialog(
    connection: &Connection,
    session_id: &str,
    accept: bool,
    prompt_text: Option<&str>,
    cancel: &Cancel,
) -> Result<DialogResult, Error> {
    connection
        .call_session(session_id, "Page.enable", None, cancel)
        .await?;
    let mut sub = connection
        .subscribe(Some(session_id), "Page.javascriptDialogOpening")
        .await?;
    let event = tokio::select! {
        event = sub.recv() => event,
        () = cancel.cancelled() => { sub.unsubscribe().await; return Err(Error::Cancelled); }
    };
    sub.unsubscribe().await;
    let event = event.ok_or(Error::ConnectionClosed)?;
    let message = event.params.get("message").and_then(Value::as_str).unwrap_or("").to_string();

    let mut params = json!({ "accept": accept });
    if let Some(text) = prompt_text {
        params["promptText"] = json!(text);
    }
    connection
        .call_session(session_id, "Page.handleJavaScriptDialog", Some(params), cancel)
        .await?;
    Ok(DialogResult { handled: true, message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_api_selects_session_vs_local() {
        assert_eq!(storage_api(true), "sessionStorage");
        assert_eq!(storage_api(false), "localStorage");
    }
}
