use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::mpsc::{unbounded, Sender};
use futures::channel::oneshot::{self, channel as oneshot_channel};
use futures::SinkExt;
use pin_project_lite::pin_project;

use crate::cmd::CommandMessage;
use crate::error::{BidiError, Result};
use crate::handler::{HandlerMessage, REQUEST_TIMEOUT};
use crate::listeners::{EventListenerRequest, EventStream};
use crate::types::MethodId;

/// A clonable handle used to issue commands and register event listeners on
/// the connection driven by the [`Handler`](crate::Handler).
///
/// Concurrency-safe: any number of clones may send simultaneously; the
/// handler serializes the frames onto the socket.
#[derive(Debug, Clone)]
pub struct BidiClient {
    pub(crate) sender: Sender<HandlerMessage>,
    request_timeout: Duration,
}

impl BidiClient {
    pub(crate) fn new(sender: Sender<HandlerMessage>) -> Self {
        Self {
            sender,
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT),
        }
    }

    /// Issue a command and return a future resolving to its raw result.
    pub fn send(
        &self,
        method: impl Into<MethodId>,
        params: serde_json::Value,
    ) -> Result<CommandFuture> {
        CommandFuture::new(method.into(), params, self.sender.clone(), self.request_timeout)
    }

    /// Issue a command with a caller supplied timeout.
    pub fn send_with_timeout(
        &self,
        method: impl Into<MethodId>,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<CommandFuture> {
        CommandFuture::new(method.into(), params, self.sender.clone(), timeout)
    }

    /// Register a listener for an event method, optionally scoped to a
    /// single browsing context, and return the receiver part.
    pub async fn listen(
        &self,
        method: impl Into<String>,
        context: Option<String>,
    ) -> Result<EventStream> {
        let (tx, rx) = unbounded();
        self.sender
            .clone()
            .send(HandlerMessage::AddEventListener(EventListenerRequest::new(
                method, context, tx,
            )))
            .await?;
        Ok(EventStream::new(rx))
    }

    /// Ask the handler to close the websocket gracefully.
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot_channel();
        self.sender
            .clone()
            .send(HandlerMessage::CloseConnection(tx))
            .await?;
        rx.await?
    }
}

pin_project! {
    /// Resolves to the raw result payload of a single BiDi command.
    ///
    /// The future first enqueues the command with the handler, then awaits
    /// the single-shot delivery channel bounded by the caller's deadline.
    pub struct CommandFuture {
        #[pin]
        rx_command: oneshot::Receiver<Result<serde_json::Value>>,
        #[pin]
        sender: Sender<HandlerMessage>,
        // We need delay to be pinned because it's a future and we need to be
        // able to poll it; it bounds the whole round trip.
        #[pin]
        delay: futures_timer::Delay,
        message: Option<HandlerMessage>,
    }
}

impl CommandFuture {
    fn new(
        method: MethodId,
        params: serde_json::Value,
        sender: Sender<HandlerMessage>,
        timeout: Duration,
    ) -> Result<Self> {
        let (tx, rx_command) = oneshot_channel::<Result<serde_json::Value>>();

        let message = Some(HandlerMessage::Command(CommandMessage::new(
            method,
            params,
            tx,
            Some(timeout),
        )));

        Ok(Self {
            sender,
            rx_command,
            message,
            delay: futures_timer::Delay::new(timeout),
        })
    }
}

impl Future for CommandFuture {
    type Output = Result<serde_json::Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        if this.message.is_some() {
            match this.sender.poll_ready(cx) {
                Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
                Poll::Ready(Ok(_)) => {
                    let message = this.message.take().expect("existence checked above");
                    this.sender.start_send(message)?;

                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
                Poll::Pending => Poll::Pending,
            }
        } else if this.delay.poll(cx).is_ready() {
            Poll::Ready(Err(BidiError::Timeout))
        } else {
            match this.rx_command.as_mut().poll(cx) {
                Poll::Ready(Ok(res)) => Poll::Ready(res),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
                Poll::Pending => Poll::Pending,
            }
        }
    }
}
