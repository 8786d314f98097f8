use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::mpsc::{SendError, UnboundedReceiver, UnboundedSender};
use futures::{Sink, Stream};
use hashbrown::HashMap;

use crate::types::EventMessage;

/// All the currently active listeners
///
/// Listeners are keyed by the event method name; each listener may further
/// restrict itself to a single browsing context. Every matching listener
/// receives the same shared event, so registering multiple listeners for the
/// same event is possible.
#[derive(Debug, Default)]
pub struct EventListeners {
    /// Tracks the listeners for each event identified by the key
    listeners: HashMap<String, Vec<EventListener>>,
}

impl EventListeners {
    /// Register a subscription for a method
    pub fn add_listener(&mut self, req: EventListenerRequest) {
        let EventListenerRequest {
            listener,
            method,
            context,
        } = req;
        let subs = self.listeners.entry(method).or_default();
        subs.push(EventListener {
            listener,
            context,
            queued_events: Default::default(),
        });
    }

    /// Queue in an event that should be sent to all matching listeners
    pub fn start_send(&mut self, event: EventMessage) {
        if let Some(subscriptions) = self.listeners.get_mut(event.method.as_str()) {
            let context = event.browsing_context().map(str::to_string);
            let event = Arc::new(event);
            for sub in subscriptions.iter_mut() {
                let matches = match (&sub.context, &context) {
                    (Some(wanted), Some(ctx)) => wanted == ctx,
                    (Some(_), None) => false,
                    (None, _) => true,
                };
                if matches {
                    sub.start_send(Arc::clone(&event));
                }
            }
        }
    }

    /// Drains all queued events and does the housekeeping when the receiver
    /// part of a subscription is dropped
    pub fn poll(&mut self, cx: &mut Context<'_>) {
        for subscriptions in self.listeners.values_mut() {
            for n in (0..subscriptions.len()).rev() {
                let mut sub = subscriptions.swap_remove(n);
                match sub.poll(cx) {
                    Poll::Ready(Err(err)) => {
                        if !err.is_disconnected() {
                            subscriptions.push(sub)
                        }
                    }
                    _ => subscriptions.push(sub),
                }
            }
        }
    }
}

pub struct EventListenerRequest {
    pub listener: UnboundedSender<Arc<EventMessage>>,
    /// The event method name, e.g. `network.beforeRequestSent`.
    pub method: String,
    /// Restrict delivery to this browsing context when set.
    pub context: Option<String>,
}

impl EventListenerRequest {
    pub fn new(
        method: impl Into<String>,
        context: Option<String>,
        listener: UnboundedSender<Arc<EventMessage>>,
    ) -> Self {
        Self {
            listener,
            method: method.into(),
            context,
        }
    }
}

impl fmt::Debug for EventListenerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListenerRequest")
            .field("method", &self.method)
            .field("context", &self.context)
            .finish()
    }
}

/// Represents a single event listener
pub struct EventListener {
    /// the sender half of the event channel
    listener: UnboundedSender<Arc<EventMessage>>,
    /// currently queued events
    queued_events: VecDeque<Arc<EventMessage>>,
    /// only deliver events of this browsing context when set
    context: Option<String>,
}

impl EventListener {
    /// queue in a new event
    pub fn start_send(&mut self, event: Arc<EventMessage>) {
        self.queued_events.push_back(event)
    }

    /// Drains all queued events and begins the process of sending them to the
    /// sink.
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), SendError>> {
        loop {
            match Sink::poll_ready(Pin::new(&mut self.listener), cx) {
                Poll::Ready(Ok(_)) => {}
                Poll::Ready(Err(err)) => {
                    // disconnected
                    return Poll::Ready(Err(err));
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
            if let Some(event) = self.queued_events.pop_front() {
                if let Err(err) = Sink::start_send(Pin::new(&mut self.listener), event) {
                    return Poll::Ready(Err(err));
                }
            } else {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

impl fmt::Debug for EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListener")
            .field("context", &self.context)
            .finish()
    }
}

/// The receiver part of an event subscription
pub struct EventStream {
    events: UnboundedReceiver<Arc<EventMessage>>,
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream").finish()
    }
}

impl EventStream {
    pub fn new(events: UnboundedReceiver<Arc<EventMessage>>) -> Self {
        Self { events }
    }
}

impl Stream for EventStream {
    type Item = Arc<EventMessage>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let pin = self.get_mut();
        Stream::poll_next(Pin::new(&mut pin.events), cx)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn event(method: &str, context: Option<&str>) -> EventMessage {
        let params = match context {
            Some(ctx) => serde_json::json!({ "context": ctx }),
            None => serde_json::json!({}),
        };
        EventMessage {
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn event_stream() {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let mut listeners = EventListeners::default();

        listeners.add_listener(EventListenerRequest::new("log.entryAdded", None, tx));
        listeners.start_send(event("log.entryAdded", None));

        let mut stream = EventStream::new(rx);

        tokio::task::spawn(async move {
            loop {
                futures::future::poll_fn(|cx| {
                    listeners.poll(cx);
                    Poll::Pending
                })
                .await
            }
        });

        let next = stream.next().await.unwrap();
        assert_eq!(next.method, "log.entryAdded");
    }

    #[tokio::test]
    async fn context_scoped_listener_filters() {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let mut listeners = EventListeners::default();

        listeners.add_listener(EventListenerRequest::new(
            "browsingContext.load",
            Some("ctx-1".to_string()),
            tx,
        ));
        listeners.start_send(event("browsingContext.load", Some("ctx-2")));
        listeners.start_send(event("browsingContext.load", Some("ctx-1")));

        let mut stream = EventStream::new(rx);

        tokio::task::spawn(async move {
            loop {
                futures::future::poll_fn(|cx| {
                    listeners.poll(cx);
                    Poll::Pending
                })
                .await
            }
        });

        let next = stream.next().await.unwrap();
        assert_eq!(next.browsing_context(), Some("ctx-1"));
    }
}
