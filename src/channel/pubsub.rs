//! Subscriber registry and event fan-out.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::join_all;
use thiserror::Error;

use crate::error::BoxError;

/// Event delivered to channel subscribers.
pub enum ChannelEvent<T> {
    /// An inbound payload from the peer.
    Data(T),
    /// The channel stopped working; no further data events will follow.
    Fault(Arc<ChannelFault>),
}

impl<T: Clone> Clone for ChannelEvent<T> {
    fn clone(&self) -> Self {
        match self {
            ChannelEvent::Data(payload) => ChannelEvent::Data(payload.clone()),
            ChannelEvent::Fault(fault) => ChannelEvent::Fault(Arc::clone(fault)),
        }
    }
}

impl<T> std::fmt::Debug for ChannelEvent<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelEvent::Data(_) => f.write_str("ChannelEvent::Data"),
            ChannelEvent::Fault(fault) => write!(f, "ChannelEvent::Fault({})", fault),
        }
    }
}

/// Why a channel stopped delivering data.
#[derive(Debug, Error)]
pub enum ChannelFault {
    /// The peer closed the connection.
    #[error("connection closed by peer (code {code}, reason '{reason}')")]
    ConnectionClosed { code: u16, reason: String },

    /// The transport failed while reading from the peer.
    #[error("transport failure: {0}")]
    Transport(String),

    /// One or more subscribers returned an error; the channel is broken.
    #[error("{} subscriber(s) failed while handling a message", .0.len())]
    Subscribers(Vec<BoxError>),
}

/// Receives events from a channel.
///
/// Returning an error from a data event breaks the channel: the
/// connection is closed with an internal-error code and every subscriber
/// receives one final fault event. Errors returned from fault events are
/// logged and dropped.
#[async_trait]
pub trait ChannelSubscriber<T>: Send + Sync {
    async fn on_event(&self, event: ChannelEvent<T>) -> Result<(), BoxError>;
}

/// The set of subscribers attached to one channel.
pub(crate) struct SubscriberSet<T> {
    inner: Mutex<Vec<Arc<dyn ChannelSubscriber<T>>>>,
}

impl<T: Clone + Send + Sync> SubscriberSet<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ChannelSubscriber<T>>) {
        self.inner.lock().unwrap().push(subscriber);
    }

    /// Remove one registration of `subscriber`, by identity. Returns
    /// whether anything was removed.
    pub fn unsubscribe(&self, subscriber: &Arc<dyn ChannelSubscriber<T>>) -> bool {
        let mut subscribers = self.inner.lock().unwrap();
        let before = subscribers.len();
        if let Some(position) = subscribers
            .iter()
            .position(|s| Arc::ptr_eq(s, subscriber))
        {
            subscribers.remove(position);
        }
        subscribers.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Deliver `event` to a snapshot of the current subscribers,
    /// concurrently, and collect every error.
    pub async fn notify(&self, event: ChannelEvent<T>) -> Vec<BoxError> {
        let snapshot: Vec<_> = self.inner.lock().unwrap().clone();
        if snapshot.is_empty() {
            return Vec::new();
        }

        let deliveries = snapshot.iter().map(|s| s.on_event(event.clone()));
        join_all(deliveries)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect()
    }
}
