//! Frames CDP request/response/event JSON over the single WebSocket, and
//! discovers the browser-level WebSocket URL via the
//! `/json/version` HTTP endpoint. This module never interprets CDP
//! semantics — it only knows the shape of the envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SetupError;

/// A request record as sent to the browser.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// The raw shape of an inbound frame before it is classified as a response
/// or an event. CDP frames never carry both `id` and `method`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    pub id: Option<u64>,
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ProtocolErrorBody>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolErrorBody {
    pub code: i64,
    pub message: String,
}

/// A classified inbound message: either a reply to a pending call or an
/// unsolicited protocol event.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Response {
        id: u64,
        result: std::result::Result<Value, ProtocolErrorBody>,
    },
    Event {
        method: String,
        params: Value,
        session_id: Option<String>,
    },
}

impl RawFrame {
    /// Classify a raw frame. Returns `None` for frames that are neither a
    /// reply (has `id`) nor an event (has `method`) — such frames are
    /// dropped by the reader without affecting connection liveness.
    #[must_use]
    pub fn classify(self) -> Option<InboundMessage> {
        if let Some(id) = self.id {
            let result = match self.error {
                Some(e) => Err(e),
                None => Ok(self.result.unwrap_or(Value::Null)),
            };
            return Some(InboundMessage::Response { id, result });
        }
        if let Some(method) = self.method {
            return Some(InboundMessage::Event {
                method,
                params: self.params.unwrap_or(Value::Null),
                session_id: self.session_id,
            });
        }
        None
    }
}

/// Parse one text frame into a classified inbound message. Malformed JSON
/// returns `Ok(None)` so the reader loop can drop the frame and continue.
pub fn decode_frame(text: &str) -> std::result::Result<Option<InboundMessage>, serde_json::Error> {
    let raw: RawFrame = serde_json::from_str(text)?;
    Ok(raw.classify())
}

pub fn encode_request(req: &RequestRecord) -> std::result::Result<String, serde_json::Error> {
    serde_json::to_string(req)
}

/// Browser version/handshake info returned by `/json/version`.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "Browser")]
    pub browser: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: Option<String>,
}

/// Issue `GET http://{host}:{port}/json/version` and return the
/// browser-level WebSocket URL advertised by Chrome.
///
/// # Errors
///
/// Returns `SetupError::Http` if the HTTP request fails, or
/// `SetupError::NoWebSocketUrl` if the response omits the WebSocket URL
/// (e.g. a protocol downgrade without WebSocket support).
pub async fn discover_websocket_url(host: &str, port: u16) -> std::result::Result<String, SetupError> {
    let url = format!("http://{host}:{port}/json/version");
    let info: VersionInfo = reqwest::get(&url).await?.json().await?;
    info.web_socket_debugger_url
        .ok_or(SetupError::NoWebSocketUrl)
}

/// Target info returned by `/json/list` (used by the session manager to
/// enumerate page targets without going through `Target.getTargets`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpTargetInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub title: String,
    pub url: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: Option<String>,
}

pub async fn list_targets_http(host: &str, port: u16) -> std::result::Result<Vec<HttpTargetInfo>, SetupError> {
    let url = format!("http://{host}:{port}/json/list");
    let targets: Vec<HttpTargetInfo> = reqwest::get(&url).await?.json().await?;
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_response_success() {
        let frame: RawFrame =
            serde_json::from_str(r#"{"id":1,"result":{"ok":true}}"#).unwrap();
        match frame.classify().unwrap() {
            InboundMessage::Response { id, result } => {
                assert_eq!(id, 1);
                assert_eq!(result.unwrap(), serde_json::json!({"ok": true}));
            }
            InboundMessage::Event { .. } => panic!("expected response"),
        }
    }

    #[test]
    fn classify_response_error() {
        let frame: RawFrame =
            serde_json::from_str(r#"{"id":2,"error":{"code":-32000,"message":"boom"}}"#).unwrap();
        match frame.classify().unwrap() {
            InboundMessage::Response { id, result } => {
                assert_eq!(id, 2);
                let err = result.unwrap_err();
                assert_eq!(err.code, -32000);
                assert_eq!(err.message, "boom");
            }
            InboundMessage::Event { .. } => panic!("expected response"),
        }
    }

    #[test]
    fn classify_event() {
        let frame: RawFrame = serde_json::from_str(
            r#"{"method":"Page.loadEventFired","params":{},"sessionId":"s1"}"#,
        )
        .unwrap();
        match frame.classify().unwrap() {
            InboundMessage::Event {
                method, session_id, ..
            } => {
                assert_eq!(method, "Page.loadEventFired");
                assert_eq!(session_id.as_deref(), Some("s1"));
            }
            InboundMessage::Response { .. } => panic!("expected event"),
        }
    }

    #[test]
    fn classify_neither_is_dropped() {
        let frame: RawFrame = serde_json::from_str(r#"{"foo":"bar"}"#).unwrap();
        assert!(frame.classify().is_none());
    }

    #[test]
    fn malformed_json_does_not_panic() {
        assert!(decode_frame("{not json").is_err());
    }

    #[test]
    fn encode_request_includes_session_id_when_present() {
        let req = RequestRecord {
            id: 7,
            method: "Page.navigate".to_string(),
            params: Some(serde_json::json!({"url": "https://example.com"})),
            session_id: Some("sess-1".to_string()),
        };
        let json = encode_request(&req).unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["sessionId"], "sess-1");
        assert_eq!(v["method"], "Page.navigate");
    }

    #[test]
    fn encode_request_omits_session_id_when_absent() {
        let req = RequestRecord {
            id: 1,
            method: "Target.getTargets".to_string(),
            params: None,
            session_id: None,
        };
        let json = encode_request(&req).unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        assert!(v.get("sessionId").is_none());
        assert!(v.get("params").is_none());
    }
}
