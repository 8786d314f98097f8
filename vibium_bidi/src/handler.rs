use std::pin::Pin;
use std::time::{Duration, Instant};

use fnv::FnvHashMap;
use futures::channel::mpsc::Receiver;
use futures::channel::oneshot::Sender as OneshotSender;
use futures::stream::{Fuse, Stream, StreamExt};
use futures::task::{Context, Poll};

use crate::cmd::CommandMessage;
use crate::conn::Connection;
use crate::error::{BidiError, Result};
use crate::job::PeriodicJob;
use crate::listeners::{EventListenerRequest, EventListeners};
use crate::types::{CallId, CommandError, Message, MethodId, Response};

/// Standard timeout in MS
pub const REQUEST_TIMEOUT: u64 = 30_000;

/// The handler that drives the websocket connection: it correlates command
/// responses to their callers and fans events out to all registered
/// listeners.
///
/// The owner drives it from a spawned task:
///
/// ```no_run
/// # use futures::StreamExt;
/// # async fn demo(mut handler: vibium_bidi::Handler) {
/// tokio::task::spawn(async move {
///     while let Some(res) = handler.next().await {
///         if res.is_err() {
///             break;
///         }
///     }
/// });
/// # }
/// ```
#[must_use = "streams do nothing unless polled"]
#[derive(Debug)]
pub struct Handler {
    /// Commands that are being processed and awaiting a response from the
    /// browser together with the instant their slot expires.
    pending_commands: FnvHashMap<CallId, PendingCommand>,
    /// Commands and subscriptions arriving from [`BidiClient`] handles
    from_client: Fuse<Receiver<HandlerMessage>>,
    /// The websocket connection to the browser instance
    conn: Connection,
    /// Evicts timed out requests periodically
    evict_command_timeout: PeriodicJob,
    /// Default per-command deadline when the caller supplies none
    request_timeout: Duration,
    /// All registered event subscriptions
    event_listeners: EventListeners,
    /// Keeps track if the connection is shutting down
    closing: bool,
}

#[derive(Debug)]
struct PendingCommand {
    sender: OneshotSender<Result<serde_json::Value>>,
    method: MethodId,
    deadline: Instant,
}

/// How to configure the handler
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// default request timeout to use
    pub request_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT),
        }
    }
}

impl Handler {
    /// Create a new `Handler` that drives the connection and listens for
    /// messages on the receiver `rx`.
    pub(crate) fn new(conn: Connection, rx: Receiver<HandlerMessage>, config: HandlerConfig) -> Self {
        Self {
            pending_commands: Default::default(),
            from_client: rx.fuse(),
            conn,
            evict_command_timeout: PeriodicJob::new(Duration::from_secs(1)),
            request_timeout: config.request_timeout,
            event_listeners: Default::default(),
            closing: false,
        }
    }

    /// Submit a command initiated via channel
    fn submit_command(&mut self, msg: CommandMessage, now: Instant) {
        let CommandMessage {
            method,
            params,
            timeout,
            sender,
        } = msg;
        match self.conn.submit_command(method.clone(), params) {
            Ok(call_id) => {
                let deadline = now + timeout.unwrap_or(self.request_timeout);
                self.pending_commands.insert(
                    call_id,
                    PendingCommand {
                        sender,
                        method,
                        deadline,
                    },
                );
            }
            Err(err) => {
                let _ = sender.send(Err(err));
            }
        }
    }

    /// Received a response to a request.
    fn on_response(&mut self, resp: Response) {
        if let Some(pending) = self.pending_commands.remove(&resp.id) {
            let _ = pending.sender.send(Ok(resp.result));
        } else {
            // late answer for an evicted slot
            tracing::debug!(id = %resp.id, "Response for unknown call id");
        }
    }

    /// Received a `{type:"error"}` answer.
    fn on_error(&mut self, err: CommandError) {
        match err.id.and_then(|id| self.pending_commands.remove(&id)) {
            Some(pending) => {
                let _ = pending.sender.send(Err(err.error.into()));
            }
            None => {
                tracing::warn!(error = %err.error, "Browser error without a matching call");
            }
        }
    }

    /// House keeping of commands
    ///
    /// Remove all commands whose deadline elapsed and notify the senders
    /// that their request timed out. A late response for an evicted id is
    /// dropped on arrival.
    fn evict_timed_out_commands(&mut self, now: Instant) {
        let timed_out = self
            .pending_commands
            .iter()
            .filter(|(_, cmd)| now > cmd.deadline)
            .map(|(k, _)| *k)
            .collect::<Vec<_>>();

        for call in timed_out {
            if let Some(pending) = self.pending_commands.remove(&call) {
                tracing::warn!(method = %pending.method, id = %call, "Command timed out");
                let _ = pending.sender.send(Err(BidiError::Timeout));
            }
        }
    }

    /// Fail every in-flight caller with a terminal error.
    fn fail_in_flight(&mut self) {
        for (_, pending) in self.pending_commands.drain() {
            let _ = pending.sender.send(Err(BidiError::ConnectionClosed));
        }
    }
}

impl Stream for Handler {
    type Item = Result<()>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let pin = self.get_mut();

        loop {
            let now = Instant::now();

            while let Poll::Ready(Some(msg)) = Pin::new(&mut pin.from_client).poll_next(cx) {
                match msg {
                    HandlerMessage::Command(cmd) => {
                        pin.submit_command(cmd, now);
                    }
                    HandlerMessage::AddEventListener(req) => {
                        pin.event_listeners.add_listener(req);
                    }
                    HandlerMessage::CloseConnection(tx) => {
                        pin.closing = true;
                        let _ = tx.send(Ok(()));
                    }
                }
            }

            if pin.closing {
                pin.fail_in_flight();
                return match futures::ready!(Pin::new(&mut pin.conn).poll_close(cx)) {
                    Ok(()) => Poll::Ready(None),
                    Err(err) => Poll::Ready(Some(Err(err))),
                };
            }

            let mut done = true;

            while let Poll::Ready(Some(ev)) = Pin::new(&mut pin.conn).poll_next(cx) {
                match ev {
                    Ok(Message::Success(resp)) => {
                        pin.on_response(resp);
                    }
                    Ok(Message::Error(err)) => {
                        pin.on_error(err);
                    }
                    Ok(Message::Event(event)) => {
                        pin.event_listeners.start_send(event);
                    }
                    Err(err) => {
                        tracing::error!("WS Connection error: {:?}", err);
                        pin.closing = true;
                        pin.fail_in_flight();
                        return Poll::Ready(Some(Err(err)));
                    }
                }
                done = false;
            }

            if pin.conn.is_closed() && !pin.closing {
                // the browser went away without a close initiated by us
                pin.closing = true;
                pin.fail_in_flight();
                return Poll::Ready(Some(Err(BidiError::ConnectionClosed)));
            }

            // poll the event listeners
            pin.event_listeners.poll(cx);

            if pin.evict_command_timeout.poll_ready(cx) {
                // evict all commands that timed out
                pin.evict_timed_out_commands(now);
            }

            if done {
                // no events/responses were read from the websocket
                return Poll::Pending;
            }
        }
    }
}

/// Events used internally to communicate with the handler, which are executed
/// in the background
#[derive(Debug)]
pub(crate) enum HandlerMessage {
    Command(CommandMessage),
    AddEventListener(EventListenerRequest),
    CloseConnection(OneshotSender<Result<()>>),
}
