//! Typed duplex channel over one websocket connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::channel::pubsub::{ChannelEvent, ChannelFault, ChannelSubscriber, SubscriberSet};
use crate::channel::socket::{close_code, ConnectionHandle};
use crate::error::HostingError;

/// Payload type that maps onto one websocket frame kind.
pub trait WireMessage: Clone + Send + Sync + 'static {
    /// Frame kind name for logging.
    const KIND: &'static str;

    fn into_message(self) -> Message;

    /// Extract a payload of this kind, `None` for any other frame kind.
    fn from_message(message: &Message) -> Option<Self>;
}

impl WireMessage for Bytes {
    const KIND: &'static str = "binary";

    fn into_message(self) -> Message {
        Message::Binary(self)
    }

    fn from_message(message: &Message) -> Option<Self> {
        match message {
            Message::Binary(payload) => Some(payload.clone()),
            _ => None,
        }
    }
}

impl WireMessage for String {
    const KIND: &'static str = "text";

    fn into_message(self) -> Message {
        Message::Text(self.into())
    }

    fn from_message(message: &Message) -> Option<Self> {
        match message {
            Message::Text(payload) => Some(payload.as_str().to_owned()),
            _ => None,
        }
    }
}

/// A typed message channel multiplexed over one connection.
///
/// Several channels (one per sub-protocol kind) may share a connection;
/// each fans inbound payloads out to its own subscribers and serializes
/// outbound payloads through the shared [`ConnectionHandle`].
pub struct WebSocketChannel<T> {
    connection: Arc<ConnectionHandle>,
    kind: String,
    subscribers: SubscriberSet<T>,
    broken: AtomicBool,
}

/// Channel carrying binary frames.
pub type BinaryChannel = WebSocketChannel<Bytes>;

/// Channel carrying text frames.
pub type TextChannel = WebSocketChannel<String>;

impl<T: WireMessage> WebSocketChannel<T> {
    pub fn new(connection: Arc<ConnectionHandle>, kind: impl Into<String>) -> Self {
        Self {
            connection,
            kind: kind.into(),
            subscribers: SubscriberSet::new(),
            broken: AtomicBool::new(false),
        }
    }

    /// The sub-protocol kind this channel carries.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        &self.connection
    }

    /// A broken channel has had a subscriber failure and delivers nothing
    /// further.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ChannelSubscriber<T>>) {
        self.subscribers.subscribe(subscriber);
    }

    pub fn unsubscribe(&self, subscriber: &Arc<dyn ChannelSubscriber<T>>) -> bool {
        self.subscribers.unsubscribe(subscriber)
    }

    /// Send one payload to the peer.
    pub async fn send(&self, payload: T) -> Result<(), HostingError> {
        if self.is_broken() {
            return Err(HostingError::invalid_operation(
                "cannot send on a broken channel",
            ));
        }
        self.connection.send(payload.into_message()).await
    }

    /// Deliver one inbound payload to the subscribers.
    ///
    /// Any subscriber error breaks the channel: the connection is closed
    /// with an internal-error code and the collected errors are delivered
    /// once as a fault event.
    pub async fn dispatch_message(&self, payload: T) {
        if self.is_broken() {
            debug!(
                connection = self.connection.id(),
                kind = %self.kind,
                "discarding inbound payload on broken channel"
            );
            return;
        }

        let errors = self.subscribers.notify(ChannelEvent::Data(payload)).await;
        if !errors.is_empty() {
            self.break_with(ChannelFault::Subscribers(errors)).await;
        }
    }

    /// Tell the subscribers the connection is gone.
    ///
    /// Broken channels already delivered their terminal fault and are
    /// skipped.
    pub async fn notify_closed(&self, fault: ChannelFault) {
        if self.is_broken() {
            return;
        }
        let errors = self
            .subscribers
            .notify(ChannelEvent::Fault(Arc::new(fault)))
            .await;
        for error in errors {
            debug!(
                connection = self.connection.id(),
                kind = %self.kind,
                error = %error,
                "subscriber failed while handling close"
            );
        }
    }

    async fn break_with(&self, fault: ChannelFault) {
        if self.broken.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!(
            connection = self.connection.id(),
            kind = %self.kind,
            fault = %fault,
            "channel broken, closing connection"
        );
        self.connection
            .close(close_code::INTERNAL_ERROR, "internal error")
            .await;

        let errors = self
            .subscribers
            .notify(ChannelEvent::Fault(Arc::new(fault)))
            .await;
        for error in errors {
            debug!(
                connection = self.connection.id(),
                kind = %self.kind,
                error = %error,
                "subscriber failed while handling fault"
            );
        }
    }
}

impl<T: WireMessage> std::fmt::Debug for WebSocketChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketChannel")
            .field("connection", &self.connection.id())
            .field("kind", &self.kind)
            .field("broken", &self.is_broken())
            .finish()
    }
}
