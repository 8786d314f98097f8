use std::time::Duration;

use futures::channel::oneshot::Sender as OneshotSender;
use serde::Serialize;

use crate::error::Result;
use crate::types::MethodId;

/// Messages used internally to communicate with the connection, which is
/// executed in the the background task.
#[derive(Debug, Serialize)]
pub struct CommandMessage {
    pub method: MethodId,
    pub params: serde_json::Value,
    /// Caller supplied deadline; the handler evicts the in-flight slot once
    /// it elapses. Falls back to the handler default when `None`.
    #[serde(skip_serializing)]
    pub timeout: Option<Duration>,
    #[serde(skip_serializing)]
    pub sender: OneshotSender<Result<serde_json::Value>>,
}

impl CommandMessage {
    pub fn new(
        method: impl Into<MethodId>,
        params: serde_json::Value,
        sender: OneshotSender<Result<serde_json::Value>>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            method: method.into(),
            params,
            timeout,
            sender,
        }
    }
}
