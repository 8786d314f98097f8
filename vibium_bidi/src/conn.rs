use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::ready;
use std::time::Duration;

use futures::stream::Stream;
use futures::task::{Context, Poll};
use futures::{SinkExt, StreamExt};
use futures_timer::Delay;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{BidiError, Result};
use crate::types::{CallId, Message, MethodId, Request};

/// Floor for the maximum inbound message size. Full-page screenshots of
/// large viewports arrive as a single text frame.
pub const MIN_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default deadline for any inbound frame to arrive.
pub const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval of the keep-alive ping.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How the [`Connection`] socket is configured.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// The deadline for any inbound frame; each received frame rearms it.
    pub read_timeout: Duration,
    /// Cadence of keep-alive pings; a pong extends the read deadline.
    pub ping_interval: Duration,
    /// Maximum inbound message size, floored at [`MIN_MESSAGE_SIZE`].
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout: READ_TIMEOUT,
            ping_interval: PING_INTERVAL,
            max_message_size: MIN_MESSAGE_SIZE,
        }
    }
}

/// Exchanges the messages with the websocket
#[must_use = "streams do nothing unless polled"]
#[derive(Debug)]
pub struct Connection {
    /// Queue of commands to send.
    pending_commands: VecDeque<Request>,
    /// The websocket to the browser instance
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// The identifier for a specific command
    next_id: usize,
    needs_flush: bool,
    /// The message that is currently being processed
    pending_flush: Option<Request>,
    /// A keep-alive ping became due and was not sent yet
    ping_due: bool,
    keepalive: Delay,
    read_deadline: Delay,
    read_timeout: Duration,
    ping_interval: Duration,
    /// Terminal state; once set all polls return `None`.
    closed: bool,
}

impl Connection {
    pub async fn connect(request: impl IntoClientRequest + Unpin) -> Result<Self> {
        Self::connect_with_config(request, ConnectionConfig::default()).await
    }

    pub async fn connect_with_config<R>(request: R, config: ConnectionConfig) -> Result<Self>
    where
        R: IntoClientRequest + Unpin,
    {
        let max_message_size = config.max_message_size.max(MIN_MESSAGE_SIZE);
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(max_message_size))
            .max_frame_size(Some(max_message_size));

        let (ws, _) =
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false).await?;

        Ok(Self {
            pending_commands: Default::default(),
            ws,
            next_id: 0,
            needs_flush: false,
            pending_flush: None,
            ping_due: false,
            keepalive: Delay::new(config.ping_interval),
            read_deadline: Delay::new(config.read_timeout),
            read_timeout: config.read_timeout,
            ping_interval: config.ping_interval,
            closed: false,
        })
    }

    fn next_call_id(&mut self) -> CallId {
        let id = CallId::new(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Queue in the command to send over the socket and return the id for
    /// this command
    pub fn submit_command(&mut self, method: MethodId, params: serde_json::Value) -> Result<CallId> {
        if self.closed {
            return Err(BidiError::ConnectionClosed);
        }
        let id = self.next_call_id();
        self.pending_commands.push_back(Request { id, method, params });
        Ok(id)
    }

    /// Whether the connection reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send a normal-closure frame and tear the socket down. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(err) = self.ws.close(None).await {
            tracing::debug!("Error closing the websocket: {err}");
        }
        Ok(())
    }

    /// Drive a graceful close handshake from a polling context. Idempotent.
    pub fn poll_close(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        use tokio_tungstenite::tungstenite::Error as WsError;

        if self.closed {
            return Poll::Ready(Ok(()));
        }
        match self.ws.poll_close_unpin(cx) {
            Poll::Ready(Ok(())) => {
                self.closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(WsError::ConnectionClosed)) | Poll::Ready(Err(WsError::AlreadyClosed)) => {
                self.closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                self.closed = true;
                Poll::Ready(Err(err.into()))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// flush any processed message and start sending the next over the conn
    /// sink
    fn start_send_next(&mut self, cx: &mut Context<'_>) -> Result<()> {
        if self.needs_flush {
            if let Poll::Ready(Ok(())) = self.ws.poll_flush_unpin(cx) {
                self.needs_flush = false;
            }
        }
        if self.pending_flush.is_none() && !self.needs_flush {
            if self.ping_due {
                if self.ws.poll_ready_unpin(cx).is_ready() {
                    self.ws.start_send_unpin(WsMessage::Ping(Vec::new().into()))?;
                    self.ping_due = false;
                    self.needs_flush = true;
                }
            } else if let Some(cmd) = self.pending_commands.pop_front() {
                tracing::trace!("Sending {:?}", cmd);
                let msg = serde_json::to_string(&cmd)?;
                self.ws.start_send_unpin(msg.into())?;
                self.pending_flush = Some(cmd);
            }
        }
        Ok(())
    }
}

impl Stream for Connection {
    type Item = Result<Message>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let pin = self.get_mut();

        if pin.closed {
            return Poll::Ready(None);
        }

        if Pin::new(&mut pin.keepalive).poll(cx).is_ready() {
            pin.ping_due = true;
            pin.keepalive.reset(pin.ping_interval);
        }

        loop {
            // queue in the next message if not currently flushing
            if let Err(err) = pin.start_send_next(cx) {
                return Poll::Ready(Some(Err(err)));
            }

            // send the message
            if let Some(call) = pin.pending_flush.take() {
                if pin.ws.poll_ready_unpin(cx).is_ready() {
                    pin.needs_flush = true;
                    // try another flush
                    continue;
                } else {
                    pin.pending_flush = Some(call);
                }
            }

            break;
        }

        // no frame within the deadline: the connection is considered dead
        if Pin::new(&mut pin.read_deadline).poll(cx).is_ready() {
            pin.closed = true;
            return Poll::Ready(Some(Err(BidiError::ReadTimeout)));
        }

        // read from the ws
        match ready!(pin.ws.poll_next_unpin(cx)) {
            Some(Ok(WsMessage::Text(text))) => {
                pin.read_deadline.reset(pin.read_timeout);
                let ready = match serde_json::from_str::<Message>(&text) {
                    Ok(msg) => {
                        tracing::trace!("Received {:?}", msg);
                        Ok(msg)
                    }
                    Err(err) => {
                        tracing::error!("Failed to deserialize WS response {}", err);
                        Err(err.into())
                    }
                };
                Poll::Ready(Some(ready))
            }
            Some(Ok(WsMessage::Close(_))) => {
                pin.closed = true;
                Poll::Ready(None)
            }
            // tungstenite queues the pong reply itself; both frames extend
            // the read deadline
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                pin.read_deadline.reset(pin.read_timeout);
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Some(Ok(msg)) => Poll::Ready(Some(Err(BidiError::UnexpectedWsMessage(msg)))),
            Some(Err(err)) => {
                pin.closed = true;
                Poll::Ready(Some(Err(BidiError::Ws(err))))
            }
            None => {
                // ws connection closed
                pin.closed = true;
                Poll::Ready(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_size_floor() {
        let config = ConnectionConfig {
            max_message_size: 1024,
            ..Default::default()
        };
        assert!(config.max_message_size.max(MIN_MESSAGE_SIZE) >= MIN_MESSAGE_SIZE);
    }
}
