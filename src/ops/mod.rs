//! Operation families: DOM resolution, input synthesis, page operations,
//! storage/permissions, waiters, and network control. Every
//! function here takes a `Connection` (already attached to a target
//! session) plus whatever arguments the operation needs, and returns a
//! small `Serialize` result type rather than a bare JSON value.

pub mod dom;
pub mod input;
pub mod network;
pub mod page;
pub mod storage;
pub mod wait;

use serde_json::Value;
use tokio::time::Duration;

use crate::cdp::{Cancel, Connection};
use crate::error::Error;

/// Sleep for `duration`, or fail with `Error::Cancelled` if `cancel` fires
/// first. Shared by the polling waiters and any other operation that needs
/// a plain cancellable delay (e.g. `network::trace`'s capture window).
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &Cancel) -> Result<(), Error> {
    tokio::select! {
        () = tokio::time::sleep(duration) => Ok(()),
        () = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// `Runtime.evaluate` with `returnByValue: true`, surfacing a JS-side
/// exception as `Error::Protocol`.
pub(crate) async fn evaluate(
    connection: &Connection,
    session_id: &str,
    expression: &str,
    cancel: &Cancel,
) -> Result<Value, Error> {
    evaluate_with(connection, session_id, expression, false, cancel).await
}

/// `Runtime.evaluate` with `returnByValue: true` and `awaitPromise: true`,
/// for expressions that return a Promise (e.g. `navigator.clipboard.*`)
/// and so need the resolved value rather than the Promise object itself.
pub(crate) async fn evaluate_await_promise(
    connection: &Connection,
    session_id: &str,
    expression: &str,
    cancel: &Cancel,
) -> Result<Value, Error> {
    evaluate_with(connection, session_id, expression, true, cancel).await
}

async fn evaluate_with(
    connection: &Connection,
    session_id: &str,
    expression: &str,
    await_promise: bool,
    cancel: &Cancel,
) -> Result<Value, Error> {
    let result = connection
        .call_session(
            session_id,
            "Runtime.evaluate",
            Some(serde_json::json!({
                "expression": expression,
                "returnByValue": true,
                "awaitPromise": await_promise,
            })),
            cancel,
        )
        .await?;
    if let Some(details) = result.get("exceptionDetails") {
        let text = details
            .get("exception")
            .and_then(|e| e.get("description"))
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("evaluation threw")
            .to_string();
        return Err(Error::Protocol {
            code: -32600,
            message: text,
        });
    }
    Ok(result
        .get("result")
        .and_then(|r| r.get("value"))
        .cloned()
        .unwrap_or(Value::Null))
}

/// Resolve the document root node id for a session (`DOM.enable` +
/// `DOM.getDocument`, no pierce).
pub(crate) async fn document_root(
    connection: &Connection,
    session_id: &str,
    cancel: &Cancel,
) -> Result<i64, Error> {
    connection
        .call_session(session_id, "DOM.enable", None, cancel)
        .await?;
    let doc = connection
        .call_session(
            session_id,
            "DOM.getDocument",
            Some(serde_json::json!({ "depth": 1 })),
            cancel,
        )
        .await?;
    doc.get("root")
        .and_then(|r| r.get("nodeId"))
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Protocol {
            code: -32005,
            message: "DOM.getDocument response missing root nodeId".to_string(),
        })
}

/// Resolve a CSS selector to a node id within a session's document.
/// A zero node-id from `DOM.querySelector` means "not found".
pub(crate) async fn resolve_node_id(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    cancel: &Cancel,
) -> Result<i64, Error> {
    let root = document_root(connection, session_id, cancel).await?;
    let result = connection
        .call_session(
            session_id,
            "DOM.querySelector",
            Some(serde_json::json!({ "nodeId": root, "selector": selector })),
            cancel,
        )
        .await?;
    let node_id = result.get("nodeId").and_then(Value::as_i64).unwrap_or(0);
    if node_id == 0 {
        return Err(Error::not_found(selector));
    }
    Ok(node_id)
}

/// Resolve the center of a node's content box (`DOM.getBoxModel`).
pub(crate) async fn node_center(
    connection: &Connection,
    session_id: &str,
    node_id: i64,
    cancel: &Cancel,
) -> Result<(f64, f64), Error> {
    let result = connection
        .call_session(
            session_id,
            "DOM.getBoxModel",
            Some(serde_json::json!({ "nodeId": node_id })),
            cancel,
        )
        .await?;
    let quad = result
        .get("model")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .ok_or_else(|| Error::invalid_argument("element has no box model"))?;
    if quad.len() < 8 {
        return Err(Error::invalid_argument("box model content quad has fewer than 8 entries"));
    }
    let nums: Vec<f64> = quad.iter().filter_map(Value::as_f64).collect();
    if nums.len() < 8 {
        return Err(Error::invalid_argument("box model content quad has non-numeric entries"));
    }
    let cx = (nums[0] + nums[2] + nums[4] + nums[6]) / 4.0;
    let cy = (nums[1] + nums[3] + nums[5] + nums[7]) / 4.0;
    Ok((cx, cy))
}

/// Resolve a selector directly to its element center, the combination
/// most C6 gestures need.
pub(crate) async fn resolve_center(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    cancel: &Cancel,
) -> Result<(f64, f64), Error> {
    let node_id = resolve_node_id(connection, session_id, selector, cancel).await?;
    node_center(connection, session_id, node_id, cancel).await
}

/// Fold a flat `[k0, v0, k1, v1, ...]` attribute list (as returned by
/// `DOM.describeNode`) into a map, last-write-wins on duplicates.
pub(crate) fn fold_attributes(flat: &[String]) -> std::collections::HashMap<String, String> {
    let mut map = std::collections::HashMap::new();
    let mut iter = flat.iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        map.insert(k.clone(), v.clone());
    }
    map
}

/// JS-truthiness as used by the polling waiters: `null`, `false`, `0`, and
/// `""` are falsey; everything else (including empty arrays/objects) is
/// truthy.
pub(crate) fn is_js_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_attributes_last_write_wins() {
        let flat = vec![
            "class".to_string(),
            "a".to_string(),
            "class".to_string(),
            "b".to_string(),
        ];
        let map = fold_attributes(&flat);
        assert_eq!(map.get("class"), Some(&"b".to_string()));
    }

    #[test]
    fn fold_attributes_empty_is_empty_map() {
        assert!(fold_attributes(&[]).is_empty());
    }

    #[test]
    fn js_truthy_falsey_values() {
        assert!(!is_js_truthy(&Value::Null));
        assert!(!is_js_truthy(&serde_json::json!(false)));
        assert!(!is_js_truthy(&serde_json::json!(0)));
        assert!(!is_js_truthy(&serde_json::json!("")));
    }

    #[test]
    fn js_truthy_truthy_values() {
        assert!(is_js_truthy(&serde_json::json!([])));
        assert!(is_js_truthy(&serde_json::json!({})));
        assert!(is_js_truthy(&serde_json::json!("x")));
        assert!(is_js_truthy(&serde_json::json!(1)));
    }
}
