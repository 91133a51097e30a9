//! OpenCode wire types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `GET /global/health` body.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HealthInfo {
    #[serde(default)]
    pub healthy: bool,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: Option<i64>,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub updated: Option<i64>,
}

/// One entry of `GET /session`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RemoteSession {
    pub id: String,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default, rename = "parentID")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub time: SessionTime,
}

impl RemoteSession {
    pub fn is_root(&self) -> bool {
        self.parent_id.as_deref().is_none_or(str::is_empty)
    }

    pub fn updated(&self) -> i64 {
        self.time.updated.unwrap_or(0)
    }
}

/// Body of a completed `POST /session/{id}/message`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageReply {
    #[serde(default)]
    pub parts: Vec<Value>,
}

impl MessageReply {
    /// Joined `text` parts of the reply, or the `tool-result` content when there are none.
    pub fn text(&self) -> String {
        let texts = self.collect("text", |part| {
            part.get("text").and_then(Value::as_str).map(str::to_string)
        });
        let chunks = if texts.is_empty() {
            self.collect("tool-result", |part| match part.get("content") {
                Some(Value::String(s)) if s.is_empty() => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Null) | None => None,
                Some(other) => Some(other.to_string()),
            })
        } else {
            texts
        };
        chunks.join("\n").trim().to_string()
    }

    fn collect(&self, kind: &str, extract: impl Fn(&Value) -> Option<String>) -> Vec<String> {
        self.parts
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some(kind))
            .filter_map(extract)
            .collect()
    }
}

/// Parse a session listing, which newer servers return as an array and older ones
/// as an object keyed by session id.
pub(crate) fn parse_session_list(body: Value) -> Result<Vec<RemoteSession>, serde_json::Error> {
    match body {
        Value::Object(map) => map
            .into_iter()
            .map(|(id, mut value)| {
                if let Value::Object(obj) = &mut value {
                    obj.entry("id").or_insert(Value::String(id));
                }
                serde_json::from_value(value)
            })
            .collect(),
        other => serde_json::from_value(other),
    }
}
