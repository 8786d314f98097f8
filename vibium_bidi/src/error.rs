use std::fmt;
use std::io;
use std::process::ExitStatus;

use base64::DecodeError;
use futures::channel::mpsc::SendError;
use futures::channel::oneshot::Canceled;
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::types::ErrorObject;

pub type Result<T, E = BidiError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BidiError {
    #[error("{0}")]
    Ws(#[from] tungstenite::Error),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// A `{type:"error"}` answer from the browser.
    #[error("{0}")]
    Browser(#[from] ErrorObject),
    #[error("Received no response from the browser.")]
    NoResponse,
    #[error("Received unexpected ws message: {0:?}")]
    UnexpectedWsMessage(WsMessage),
    #[error("{0}")]
    ChannelSendError(#[from] ChannelError),
    #[error("Browser process exited with status {0:?} before the BiDi websocket URL could be resolved, stderr: {1:?}")]
    LaunchExit(ExitStatus, BrowserStderr),
    #[error("Timeout while resolving the BiDi websocket URL from the browser process, stderr: {0:?}")]
    LaunchTimeout(BrowserStderr),
    #[error("Input/Output error while resolving the BiDi websocket URL from the browser process, stderr: {1:?}: {0}")]
    LaunchIo(#[source] io::Error, BrowserStderr),
    #[error("Request timed out.")]
    Timeout,
    #[error("No inbound frame within the read deadline.")]
    ReadTimeout,
    #[error("The websocket connection is closed.")]
    ConnectionClosed,
    #[error("{0}")]
    DecodeError(#[from] DecodeError),
    #[error("{0}")]
    Url(#[from] url::ParseError),
    /// Error message related to a browser answer that is not an
    /// [`ErrorObject`]
    #[error("{0}")]
    Message(String),
}

impl BidiError {
    pub fn msg(msg: impl Into<String>) -> Self {
        BidiError::Message(msg.into())
    }

    /// Whether the error carries a specific BiDi protocol error code,
    /// e.g. `no such node`.
    pub fn is_protocol_error(&self, code: &str) -> bool {
        matches!(self, BidiError::Browser(err) if err.error == code)
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{0}")]
    Send(#[from] SendError),
    #[error("{0}")]
    Canceled(#[from] Canceled),
}

impl From<Canceled> for BidiError {
    fn from(err: Canceled) -> Self {
        ChannelError::from(err).into()
    }
}

impl From<SendError> for BidiError {
    fn from(err: SendError) -> Self {
        ChannelError::from(err).into()
    }
}

/// `stderr` output of the browser child process
///
/// This implements a custom `Debug` formatter similar to [`std::process::Output`]. If the output
/// is valid UTF-8, format as a string; otherwise format the byte sequence.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BrowserStderr(Vec<u8>);

impl BrowserStderr {
    pub fn new(stderr: Vec<u8>) -> Self {
        Self(stderr)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for BrowserStderr {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stderr_utf8 = std::str::from_utf8(&self.0);
        let stderr_debug: &dyn fmt::Debug = match stderr_utf8 {
            Ok(ref str) => str,
            Err(_) => &self.0,
        };

        fmt.debug_tuple("BrowserStderr")
            .field(stderr_debug)
            .finish()
    }
}
