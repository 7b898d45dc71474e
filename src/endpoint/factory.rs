//! Channel factory endpoint: the application supplies the channels, the
//! endpoint wires connections to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

use crate::channel::{close_code, ChannelEvent, ChannelSubscriber, ConnectionHandle, WireMessage};
use crate::config::WebSocketEndpointConfig;
use crate::endpoint::negotiate_sub_protocol;
use crate::error::{BoxError, HostingError};
use crate::http::{HostingEndpoint, UpgradeContext, WebSocketSubServer};

/// A channel the application hands to the endpoint, usually a bridge to
/// some backend.
///
/// Data events published to subscribers flow out to the websocket peer;
/// payloads passed to [`send`](Self::send) are the peer's inbound frames.
/// A fault event closes the peer connection with an internal-error code.
#[async_trait]
pub trait ProvidedChannel<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn ChannelSubscriber<T>>);

    fn unsubscribe(&self, subscriber: &Arc<dyn ChannelSubscriber<T>>) -> bool;

    /// Consume one inbound payload from the peer.
    async fn send(&self, payload: T) -> Result<(), HostingError>;

    /// Release whatever the channel holds; called once when the
    /// connection ends.
    async fn dispose(&self);
}

/// Creates channels for accepted connections.
///
/// The defaults reject the payload kind, mirroring
/// [`ChannelSupplyHandler`](crate::endpoint::supply::ChannelSupplyHandler).
/// `cancellation` flips to `true` when the connection closes, so a
/// long-running factory can give up early.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn create_binary_channel(
        &self,
        connection: &Arc<ConnectionHandle>,
        cancellation: watch::Receiver<bool>,
    ) -> Result<Arc<dyn ProvidedChannel<Bytes>>, BoxError> {
        let _ = (connection, cancellation);
        Err(HostingError::invalid_operation("binary channels are not supported").into())
    }

    async fn create_text_channel(
        &self,
        connection: &Arc<ConnectionHandle>,
        cancellation: watch::Receiver<bool>,
    ) -> Result<Arc<dyn ProvidedChannel<String>>, BoxError> {
        let _ = (connection, cancellation);
        Err(HostingError::invalid_operation("text channels are not supported").into())
    }
}

/// WebSocket endpoint that pumps each connection into factory-provided
/// channels.
pub struct WebSocketChannelFactoryEndpoint {
    shared: Arc<FactoryShared>,
    disposed: OnceCell<()>,
}

struct FactoryShared {
    opts: WebSocketEndpointConfig,
    factory: Arc<dyn ChannelFactory>,
    auto_create_binary: bool,
    auto_create_text: bool,
    connections: Mutex<HashMap<u64, Arc<ConnectionHandle>>>,
    counter: AtomicU64,
    disposing: AtomicBool,
}

impl WebSocketChannelFactoryEndpoint {
    /// Channels are created on the first inbound frame of each kind.
    pub fn new(opts: WebSocketEndpointConfig, factory: Arc<dyn ChannelFactory>) -> Arc<Self> {
        Self::with_auto_create(opts, factory, false, false)
    }

    /// Create channels of the flagged kinds as soon as a connection
    /// opens, so backend data can flow out before the peer sends
    /// anything.
    pub fn with_auto_create(
        opts: WebSocketEndpointConfig,
        factory: Arc<dyn ChannelFactory>,
        binary: bool,
        text: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(FactoryShared {
                opts,
                factory,
                auto_create_binary: binary,
                auto_create_text: text,
                connections: Mutex::new(HashMap::new()),
                counter: AtomicU64::new(0),
                disposing: AtomicBool::new(false),
            }),
            disposed: OnceCell::new(),
        })
    }

    /// Bind this endpoint on a hosting endpoint.
    pub fn bind(self: &Arc<Self>, endpoint: &HostingEndpoint) -> Result<(), HostingError> {
        endpoint.create_web_socket_server(Arc::clone(self) as Arc<dyn WebSocketSubServer>)
    }

    pub fn bind_path(&self) -> &str {
        &self.shared.opts.bind_path
    }

    pub fn active_connections(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }

    /// Stop accepting connections and force-close the active ones.
    /// Idempotent; concurrent callers wait for the one teardown.
    pub async fn dispose(&self) {
        self.disposed
            .get_or_init(|| async {
                let handles: Vec<Arc<ConnectionHandle>> = {
                    let mut connections = self.shared.connections.lock().unwrap();
                    self.shared.disposing.store(true, Ordering::SeqCst);
                    connections.drain().map(|(_, handle)| handle).collect()
                };
                info!(
                    bind_path = %self.shared.opts.bind_path,
                    connections = handles.len(),
                    "closing websocket endpoint"
                );
                for handle in handles {
                    handle
                        .close(close_code::GOING_AWAY, "server is going away")
                        .await;
                }
            })
            .await;
    }
}

#[async_trait]
impl WebSocketSubServer for WebSocketChannelFactoryEndpoint {
    fn bind_path(&self) -> &str {
        &self.shared.opts.bind_path
    }

    async fn accept(&self, socket: WebSocket, context: UpgradeContext) {
        run_connection(Arc::clone(&self.shared), socket, context).await;
    }

    async fn dispose(&self) {
        WebSocketChannelFactoryEndpoint::dispose(self).await;
    }
}

/// Forwards channel events back out over the websocket.
struct OutboundForwarder {
    connection: Arc<ConnectionHandle>,
}

#[async_trait]
impl<T: WireMessage> ChannelSubscriber<T> for OutboundForwarder {
    async fn on_event(&self, event: ChannelEvent<T>) -> Result<(), BoxError> {
        match event {
            ChannelEvent::Data(payload) => self
                .connection
                .send(payload.into_message())
                .await
                .map_err(|e| Box::new(e) as BoxError),
            ChannelEvent::Fault(fault) => {
                warn!(
                    connection = self.connection.id(),
                    fault = %fault,
                    "provided channel faulted, closing connection"
                );
                self.connection
                    .close(close_code::INTERNAL_ERROR, "internal error")
                    .await;
                Ok(())
            }
        }
    }
}

async fn run_connection(
    shared: Arc<FactoryShared>,
    mut socket: WebSocket,
    context: UpgradeContext,
) {
    if shared.disposing.load(Ordering::SeqCst) {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::GOING_AWAY,
                reason: "server is going away".into(),
            })))
            .await;
        return;
    }

    let protocol = match negotiate_sub_protocol(&shared.opts, context.sub_protocol.as_deref()) {
        Ok(protocol) => protocol,
        Err(proposal) => {
            debug!(
                bind_path = %shared.opts.bind_path,
                proposal = %proposal,
                "rejecting disallowed sub-protocol"
            );
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::UNSUPPORTED_PROTOCOL,
                    reason: "sub-protocol is not allowed".into(),
                })))
                .await;
            return;
        }
    };

    let id = shared.counter.fetch_add(1, Ordering::SeqCst);
    let (sink, mut stream) = socket.split();
    let handle = Arc::new(ConnectionHandle::new(id, protocol, context.peer, sink));
    // The flag and the registry share one lock: a connection either lands
    // in the map before dispose drains it, or sees the flag and backs out.
    let admitted = {
        let mut connections = shared.connections.lock().unwrap();
        if shared.disposing.load(Ordering::SeqCst) {
            false
        } else {
            connections.insert(id, Arc::clone(&handle));
            true
        }
    };
    if !admitted {
        handle
            .close(close_code::GOING_AWAY, "server is going away")
            .await;
        return;
    }

    debug!(
        bind_path = %shared.opts.bind_path,
        connection = id,
        sub_protocol = %handle.sub_protocol(),
        peer = ?context.peer,
        "connection opened"
    );

    let forwarder = Arc::new(OutboundForwarder {
        connection: Arc::clone(&handle),
    });
    let mut binary: Option<Arc<dyn ProvidedChannel<Bytes>>> = None;
    let mut text: Option<Arc<dyn ProvidedChannel<String>>> = None;
    let mut failed = false;

    if shared.auto_create_binary {
        match shared
            .factory
            .create_binary_channel(&handle, handle.closed_signal())
            .await
        {
            Ok(channel) => {
                channel.subscribe(Arc::clone(&forwarder) as Arc<dyn ChannelSubscriber<Bytes>>);
                binary = Some(channel);
            }
            Err(e) => {
                warn!(connection = id, error = %e, "binary channel factory failed");
                failed = true;
            }
        }
    }
    if shared.auto_create_text && !failed {
        match shared
            .factory
            .create_text_channel(&handle, handle.closed_signal())
            .await
        {
            Ok(channel) => {
                channel.subscribe(Arc::clone(&forwarder) as Arc<dyn ChannelSubscriber<String>>);
                text = Some(channel);
            }
            Err(e) => {
                warn!(connection = id, error = %e, "text channel factory failed");
                failed = true;
            }
        }
    }

    if failed {
        handle
            .close(close_code::INTERNAL_ERROR, "internal error")
            .await;
    } else {
        let mut closed = handle.closed_signal();
        loop {
            tokio::select! {
                _ = closed.changed() => break,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Binary(payload))) => {
                        let channel = match &binary {
                            Some(channel) => Arc::clone(channel),
                            None => match shared
                                .factory
                                .create_binary_channel(&handle, handle.closed_signal())
                                .await
                            {
                                Ok(channel) => {
                                    channel.subscribe(
                                        Arc::clone(&forwarder) as Arc<dyn ChannelSubscriber<Bytes>>,
                                    );
                                    binary = Some(Arc::clone(&channel));
                                    channel
                                }
                                Err(e) => {
                                    warn!(connection = id, error = %e, "binary channel factory failed");
                                    handle.close(close_code::INTERNAL_ERROR, "internal error").await;
                                    break;
                                }
                            },
                        };
                        if let Err(e) = channel.send(payload).await {
                            warn!(connection = id, error = %e, "provided channel rejected payload");
                            handle.close(close_code::INTERNAL_ERROR, "internal error").await;
                            break;
                        }
                    }
                    Some(Ok(Message::Text(payload))) => {
                        let channel = match &text {
                            Some(channel) => Arc::clone(channel),
                            None => match shared
                                .factory
                                .create_text_channel(&handle, handle.closed_signal())
                                .await
                            {
                                Ok(channel) => {
                                    channel.subscribe(
                                        Arc::clone(&forwarder) as Arc<dyn ChannelSubscriber<String>>,
                                    );
                                    text = Some(Arc::clone(&channel));
                                    channel
                                }
                                Err(e) => {
                                    warn!(connection = id, error = %e, "text channel factory failed");
                                    handle.close(close_code::INTERNAL_ERROR, "internal error").await;
                                    break;
                                }
                            },
                        };
                        if let Err(e) = channel.send(payload.as_str().to_owned()).await {
                            warn!(connection = id, error = %e, "provided channel rejected payload");
                            handle.close(close_code::INTERNAL_ERROR, "internal error").await;
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        handle.mark_closed();
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(connection = id, error = %e, "transport error, closing");
                        handle.close(close_code::UNSUPPORTED_DATA, "unsupported data").await;
                        break;
                    }
                }
            }
        }
    }

    // Forwarder comes off before the channel is disposed.
    if let Some(channel) = binary {
        channel.unsubscribe(&(Arc::clone(&forwarder) as Arc<dyn ChannelSubscriber<Bytes>>));
        channel.dispose().await;
    }
    if let Some(channel) = text {
        channel.unsubscribe(&(Arc::clone(&forwarder) as Arc<dyn ChannelSubscriber<String>>));
        channel.dispose().await;
    }

    shared.connections.lock().unwrap().remove(&id);
    debug!(bind_path = %shared.opts.bind_path, connection = id, "connection finished");
}
