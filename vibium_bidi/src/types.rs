//! The WebDriver BiDi wire envelope.
//!
//! BiDi is a flat JSON-RPC-style protocol: commands `{id, method, params}`
//! are answered by exactly one `{type:"success"}` or `{type:"error"}`
//! message carrying the same id, and the browser pushes `{type:"event"}`
//! messages at any time.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier for a command sent over the websocket.
///
/// Ids are chosen by the connection, are process-unique and never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct CallId(usize);

impl CallId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a BiDi method, e.g. `browsingContext.navigate`.
pub type MethodId = Cow<'static, str>;

/// A command serialized onto the websocket.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub id: CallId,
    pub method: MethodId,
    pub params: serde_json::Value,
}

/// Protocol-level error payload of a `{type:"error"}` message.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{error}: {message}")]
pub struct ErrorObject {
    /// Machine readable error code, e.g. `no such node`.
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

/// Payload of a `{type:"success"}` message.
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    pub id: CallId,
    #[serde(default)]
    pub result: serde_json::Value,
}

/// Payload of a `{type:"error"}` message.
///
/// The id is absent when the browser could not parse the command at all.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandError {
    #[serde(default)]
    pub id: Option<CallId>,
    #[serde(flatten)]
    pub error: ErrorObject,
}

/// A `{type:"event"}` message pushed by the browser.
#[derive(Debug, Clone, Deserialize)]
pub struct EventMessage {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl EventMessage {
    /// The browsing context this event belongs to, when the event carries
    /// one. Most `browsingContext.*` events put it at `params.context`,
    /// the `network.*` events inside `params.context` as well.
    pub fn browsing_context(&self) -> Option<&str> {
        self.params.get("context").and_then(|v| v.as_str())
    }
}

/// An incoming message: either the outcome of a command or an event.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Success(Response),
    Error(CommandError),
    Event(EventMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_success() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"success","id":3,"result":{"contexts":[]}}"#).unwrap();
        match msg {
            Message::Success(resp) => {
                assert_eq!(resp.id, CallId::new(3));
                assert!(resp.result.get("contexts").is_some());
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn deserialize_error_without_id() {
        let msg: Message = serde_json::from_str(
            r#"{"type":"error","id":null,"error":"invalid argument","message":"malformed"}"#,
        )
        .unwrap();
        match msg {
            Message::Error(err) => {
                assert!(err.id.is_none());
                assert_eq!(err.error.error, "invalid argument");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn deserialize_event_with_context() {
        let msg: Message = serde_json::from_str(
            r#"{"type":"event","method":"browsingContext.load","params":{"context":"ctx-9","url":"https://example.com"}}"#,
        )
        .unwrap();
        match msg {
            Message::Event(ev) => {
                assert_eq!(ev.method, "browsingContext.load");
                assert_eq!(ev.browsing_context(), Some("ctx-9"));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn request_serializes_flat() {
        let req = Request {
            id: CallId::new(7),
            method: "session.subscribe".into(),
            params: serde_json::json!({"events": ["log.entryAdded"]}),
        };
        let raw = serde_json::to_value(&req).unwrap();
        assert_eq!(raw["id"], 7);
        assert_eq!(raw["method"], "session.subscribe");
        assert_eq!(raw["params"]["events"][0], "log.entryAdded");
    }
}
