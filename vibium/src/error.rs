use std::io;

use thiserror::Error;
use vibium_bidi::BidiError;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// JSON-RPC error codes surfaced on the daemon socket.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const BROWSER_CRASHED: i64 = -32000;
    pub const ELEMENT_NOT_FOUND: i64 = -32001;
    pub const TIMEOUT: i64 = -32002;
    pub const STALE_HANDLE: i64 = -32003;
    pub const NOT_SUPPORTED: i64 = -32004;
}

/// Terminal outcome of a single command; the daemon never partially applies
/// an operation across an error boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No element matches {selector:?} (waited {waited_ms} ms)")]
    ElementNotFound { selector: String, waited_ms: u64 },
    #[error("Stale handle {handle}: the page navigated since it was captured")]
    StaleHandle { handle: String },
    #[error("{tool} timed out after {timeout_ms} ms")]
    Timeout { tool: String, timeout_ms: u64 },
    #[error("Script threw: {text}")]
    ScriptException { text: String },
    #[error("The browser crashed or the connection was lost; the next command relaunches it")]
    BrowserCrashed,
    #[error("{what} is not supported on a remote browser endpoint")]
    NotSupported { what: String },
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error("Unknown tool {name:?}")]
    MethodNotFound { name: String },
    #[error("Connection error: {message}")]
    Connection { message: String },
    #[error("Protocol error: {message}")]
    Protocol { message: String },
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
}

impl EngineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        EngineError::Protocol {
            message: message.into(),
        }
    }

    /// The JSON-RPC error code this error surfaces as.
    pub fn code(&self) -> i64 {
        match self {
            EngineError::ElementNotFound { .. } => codes::ELEMENT_NOT_FOUND,
            EngineError::StaleHandle { .. } => codes::STALE_HANDLE,
            EngineError::Timeout { .. } => codes::TIMEOUT,
            EngineError::BrowserCrashed | EngineError::Connection { .. } => codes::BROWSER_CRASHED,
            EngineError::NotSupported { .. } => codes::NOT_SUPPORTED,
            EngineError::InvalidArgument { .. } => codes::INVALID_PARAMS,
            EngineError::MethodNotFound { .. } => codes::METHOD_NOT_FOUND,
            EngineError::ScriptException { .. }
            | EngineError::Protocol { .. }
            | EngineError::Io(_)
            | EngineError::Serde(_) => codes::INTERNAL_ERROR,
        }
    }
}

impl From<BidiError> for EngineError {
    fn from(err: BidiError) -> Self {
        match err {
            BidiError::Timeout => EngineError::Timeout {
                tool: "bidi command".to_string(),
                timeout_ms: 0,
            },
            BidiError::ConnectionClosed
            | BidiError::ReadTimeout
            | BidiError::Ws(_)
            | BidiError::ChannelSendError(_) => EngineError::BrowserCrashed,
            BidiError::Browser(obj) => EngineError::Protocol {
                message: format!("{}: {}", obj.error, obj.message),
            },
            other => EngineError::Protocol {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_daemon_contract() {
        assert_eq!(
            EngineError::ElementNotFound {
                selector: "#x".into(),
                waited_ms: 1000
            }
            .code(),
            -32001
        );
        assert_eq!(
            EngineError::Timeout {
                tool: "find".into(),
                timeout_ms: 1000
            }
            .code(),
            -32002
        );
        assert_eq!(
            EngineError::StaleHandle {
                handle: "@e1".into()
            }
            .code(),
            -32003
        );
        assert_eq!(EngineError::BrowserCrashed.code(), -32000);
        assert_eq!(
            EngineError::NotSupported {
                what: "set-window".into()
            }
            .code(),
            -32004
        );
        assert_eq!(EngineError::invalid("nope").code(), -32602);
    }
}
