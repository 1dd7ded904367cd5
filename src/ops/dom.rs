//! DOM resolution helpers: selector resolution, element geometry, and
//! shadow-root traversal.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use super::{fold_attributes, resolve_node_id};
use crate::cdp::{Cancel, Connection};
use crate::error::Error;

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    #[serde(rename = "nodeId")]
    pub node_id: i64,
    #[serde(rename = "tagName")]
    pub tag_name: String,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttrResult {
    pub selector: String,
    pub attribute: String,
    pub value: String,
}

async fn describe(
    connection: &Connection,
    session_id: &str,
    node_id: i64,
    cancel: &Cancel,
) -> Result<(String, HashMap<String, String>), Error> {
    let result = connection
        .call_session(
            session_id,
            "DOM.describeNode",
            Some(serde_json::json!({ "nodeId": node_id, "depth": 1 })),
            cancel,
        )
        .await?;
    let node = result
        .get("node")
        .ok_or_else(|| Error::Protocol {
            code: -32006,
            message: "DOM.describeNode response missing node".to_string(),
        })?;
    let tag_name = node
        .get("nodeName")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let flat: Vec<String> = node
        .get("attributes")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok((tag_name, fold_attributes(&flat)))
}

/// `query(selector)`: resolve and describe an element.
///
/// # Errors
///
/// `Error::NotFound` if the selector matches nothing.
pub async fn query(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    cancel: &Cancel,
) -> Result<QueryResult, Error> {
    let node_id = resolve_node_id(connection, session_id, selector, cancel).await?;
    let (tag_name, attributes) = describe(connection, session_id, node_id, cancel).await?;
    Ok(QueryResult {
        node_id,
        tag_name,
        attributes,
    })
}

/// `attr(selector, name)`: a missing attribute returns an empty string
/// rather than failing.
///
/// # Errors
///
/// `Error::NotFound` if the selector matches nothing.
pub async fn attr(
    connection: &Connection,
    session_id: &str,
    selector: &str,
    name: &str,
    cancel: &Cancel,
) -> Result<AttrResult, Error> {
    let node_id = resolve_node_id(connection, session_id, selector, cancel).await?;
    let (_, attributes) = describe(connection, session_id, node_id, cancel).await?;
    Ok(AttrResult {
        selector: selector.to_string(),
        attribute: name.to_string(),
        value: attributes.get(name).cloned().unwrap_or_default(),
    })
}

/// `shadow(host_selector, inner_selector)`: resolve the host, pierce into
/// its shadow root, then resolve `inner_selector` against that root.
///
/// # Errors
///
/// `Error::NotFound` if the host or inner selector matches nothing, or
/// `Error::Unsupported` (`NoShadowRoot`) if the host has no shadow root.
pub async fn shadow(
    connection: &Connection,
    session_id: &str,
    host_selector: &str,
    inner_selector: &str,
    cancel: &Cancel,
) -> Result<QueryResult, Error> {
    let host_id = resolve_node_id(connection, session_id, host_selector, cancel).await?;
    let result = connection
        .call_session(
            session_id,
            "DOM.describeNode",
            Some(serde_json::json!({ "nodeId": host_id, "depth": 1, "pierce": true })),
            cancel,
        )
        .await?;
    let shadow_root_id = result
        .get("node")
        .and_then(|n| n.get("shadowRoots"))
        .and_then(Value::as_array)
        .and_then(|roots| roots.first())
        .and_then(|root| root.get("nodeId"))
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::unsupported(format!("NoShadowRoot({host_selector})")))?;

    let inner = connection
        .call_session(
            session_id,
            "DOM.querySelector",
            Some(serde_json::json!({ "nodeId": shadow_root_id, "selector": inner_selector })),
            cancel,
        )
        .await?;
    let node_id = inner.get("nodeId").and_then(Value::as_i64).unwrap_or(0);
    if node_id == 0 {
        return Err(Error::not_found(inner_selector));
    }
    let (tag_name, attributes) = describe(connection, session_id, node_id, cancel).await?;
    Ok(QueryResult {
        node_id,
        tag_name,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_result_serializes_with_cdp_style_field_names() {
        let mut attributes = HashMap::new();
        attributes.insert("class".to_string(), "label".to_string());
        let result = QueryResult {
            node_id: 5,
            tag_name: "SPAN".to_string(),
            attributes,
        };
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["tagName"], "SPAN");
        assert_eq!(v["nodeId"], 5);
        assert_eq!(v["attributes"]["class"], "label");
    }
}
