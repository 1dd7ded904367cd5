//! Target discovery and the attach/close lifecycle. The session cache
//! itself lives inside the `Connection` actor, which owns it; this module
//! is the operation-facing façade that talks `Target.*` and hands back
//! session ids.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::dispatcher::{Cancel, Connection};
use crate::error::Error;

/// A debuggable target as reported by `Target.getTargets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfo {
    #[serde(rename = "targetId")]
    pub target_id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub attached: bool,
}

pub struct SessionManager {
    connection: Connection,
}

impl SessionManager {
    #[must_use]
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// List page-typed targets via `Target.getTargets`.
    ///
    /// # Errors
    ///
    /// Propagates `Connection::call` failures.
    pub async fn pages(&self) -> Result<Vec<TargetInfo>, Error> {
        let result = self
            .connection
            .call("Target.getTargets", None, &Cancel::none())
            .await?;
        let all: Vec<TargetInfo> = result
            .get("targetInfos")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::Protocol {
                code: -32003,
                message: format!("malformed Target.getTargets response: {e}"),
            })?
            .unwrap_or_default();
        Ok(all.into_iter().filter(|t| t.target_type == "page").collect())
    }

    /// Attach (or reuse a cached attach) to `target_id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the browser refuses the attach.
    pub async fn attach(&self, target_id: &str) -> Result<String, Error> {
        self.connection.attach_session(target_id).await
    }

    /// Close a tab: drop it from the session cache first (so any later
    /// operation re-attaches rather than reusing a stale session id), then
    /// ask the browser to close the target.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the close call fails.
    pub async fn close_tab(&self, target_id: &str) -> Result<(), Error> {
        self.connection.forget_session(target_id).await;
        self.connection
            .call(
                "Target.closeTarget",
                Some(serde_json::json!({ "targetId": target_id })),
                &Cancel::none(),
            )
            .await?;
        Ok(())
    }

    /// Create a new tab/target and return its target id.
    ///
    /// # Errors
    ///
    /// Propagates `Connection::call` failures.
    pub async fn new_tab(&self, url: Option<&str>) -> Result<String, Error> {
        let params = serde_json::json!({ "url": url.unwrap_or("about:blank") });
        let result = self
            .connection
            .call("Target.createTarget", Some(params), &Cancel::none())
            .await?;
        result
            .get("targetId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol {
                code: -32004,
                message: "Target.createTarget response missing targetId".to_string(),
            })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_info_deserializes_from_target_getTargets_shape() {
        let json = serde_json::json!({
            "targetId": "ABC",
            "type": "page",
            "title": "Example",
            "url": "https://example.com",
            "attached": true
        });
        let info: TargetInfo = serde_json::from_value(json).unwrap();
        assert_eq!(info.target_id, "ABC");
        assert_eq!(info.target_type, "page");
        assert!(info.attached);
    }
}
