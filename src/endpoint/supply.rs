//! Channel supply endpoint: the endpoint owns the channels, the
//! application subscribes to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::StreamExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::channel::{
    close_code, BinaryChannel, ChannelFault, ConnectionHandle, TextChannel, WebSocketChannel,
};
use crate::config::WebSocketEndpointConfig;
use crate::endpoint::negotiate_sub_protocol;
use crate::error::{BoxError, HostingError};
use crate::http::{HostingEndpoint, UpgradeContext, WebSocketSubServer};

/// Application hooks invoked when a channel opens on a connection.
///
/// Channels are created lazily: the binary hook fires when the first
/// binary frame arrives on a connection, the text hook on the first text
/// frame. Hooks attach subscribers before any payload is dispatched. A
/// hook error closes the connection with an internal-error code and the
/// channel is discarded.
///
/// The defaults reject the payload kind, so an endpoint carrying only
/// text channels just leaves the binary hook alone.
pub trait ChannelSupplyHandler: Send + Sync {
    fn on_open_binary_channel(&self, _channel: &Arc<BinaryChannel>) -> Result<(), BoxError> {
        Err(HostingError::invalid_operation("binary channels are not supported").into())
    }

    fn on_open_text_channel(&self, _channel: &Arc<TextChannel>) -> Result<(), BoxError> {
        Err(HostingError::invalid_operation("text channels are not supported").into())
    }
}

/// WebSocket endpoint that supplies one typed channel per payload kind
/// per connection.
pub struct WebSocketChannelSupplyEndpoint {
    shared: Arc<SupplyShared>,
    disposed: OnceCell<()>,
}

struct SupplyShared {
    opts: WebSocketEndpointConfig,
    handler: Arc<dyn ChannelSupplyHandler>,
    connections: Mutex<HashMap<u64, Arc<ConnectionHandle>>>,
    counter: AtomicU64,
    disposing: AtomicBool,
}

/// How a connection loop ended.
enum Exit {
    /// The peer closed or the transport ended.
    Closed { code: u16, reason: String },
    /// Reading from the transport failed.
    Transport(String),
    /// An open hook rejected a channel.
    HookFailed,
}

impl Exit {
    fn fault(&self) -> ChannelFault {
        match self {
            Exit::Closed { code, reason } => ChannelFault::ConnectionClosed {
                code: *code,
                reason: reason.clone(),
            },
            Exit::Transport(message) => ChannelFault::Transport(message.clone()),
            Exit::HookFailed => ChannelFault::ConnectionClosed {
                code: close_code::INTERNAL_ERROR,
                reason: "internal error".to_string(),
            },
        }
    }
}

impl WebSocketChannelSupplyEndpoint {
    pub fn new(
        opts: WebSocketEndpointConfig,
        handler: Arc<dyn ChannelSupplyHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(SupplyShared {
                opts,
                handler,
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
impl WebSocketSubServer for WebSocketChannelSupplyEndpoint {
    fn bind_path(&self) -> &str {
        &self.shared.opts.bind_path
    }

    async fn accept(&self, socket: WebSocket, context: UpgradeContext) {
        run_connection(Arc::clone(&self.shared), socket, context).await;
    }

    async fn dispose(&self) {
        WebSocketChannelSupplyEndpoint::dispose(self).await;
    }
}

async fn run_connection(shared: Arc<SupplyShared>, mut socket: WebSocket, context: UpgradeContext) {
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

    let mut binary: Option<Arc<BinaryChannel>> = None;
    let mut text: Option<Arc<TextChannel>> = None;
    let mut closed = handle.closed_signal();

    let exit = loop {
        tokio::select! {
            _ = closed.changed() => {
                // Closed from this side; report the code it was closed
                // with, 1011 when a broken channel did it.
                let (code, reason) = handle.close_frame().unwrap_or((
                    close_code::GOING_AWAY,
                    "server is going away".to_string(),
                ));
                break Exit::Closed { code, reason };
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(payload))) => {
                    let channel = match &binary {
                        Some(channel) => Arc::clone(channel),
                        None => {
                            let channel = Arc::new(WebSocketChannel::new(
                                Arc::clone(&handle),
                                handle.sub_protocol().to_owned(),
                            ));
                            if let Err(e) = shared.handler.on_open_binary_channel(&channel) {
                                warn!(connection = id, error = %e, "binary channel rejected");
                                handle.close(close_code::INTERNAL_ERROR, "internal error").await;
                                break Exit::HookFailed;
                            }
                            binary = Some(Arc::clone(&channel));
                            channel
                        }
                    };
                    channel.dispatch_message(payload).await;
                }
                Some(Ok(Message::Text(payload))) => {
                    let channel = match &text {
                        Some(channel) => Arc::clone(channel),
                        None => {
                            let channel = Arc::new(WebSocketChannel::new(
                                Arc::clone(&handle),
                                handle.sub_protocol().to_owned(),
                            ));
                            if let Err(e) = shared.handler.on_open_text_channel(&channel) {
                                warn!(connection = id, error = %e, "text channel rejected");
                                handle.close(close_code::INTERNAL_ERROR, "internal error").await;
                                break Exit::HookFailed;
                            }
                            text = Some(Arc::clone(&channel));
                            channel
                        }
                    };
                    channel.dispatch_message(payload.as_str().to_owned()).await;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    handle.mark_closed();
                    let (code, reason) = frame
                        .map(|f| (f.code, f.reason.as_str().to_owned()))
                        .unwrap_or((1005, String::new()));
                    break Exit::Closed { code, reason };
                }
                Some(Err(e)) => {
                    debug!(connection = id, error = %e, "transport error, closing");
                    handle.close(close_code::UNSUPPORTED_DATA, "unsupported data").await;
                    break Exit::Transport(e.to_string());
                }
                None => {
                    handle.mark_closed();
                    break Exit::Closed { code: 1005, reason: String::new() };
                }
            }
        }
    };

    if let Some(channel) = &binary {
        channel.notify_closed(exit.fault()).await;
    }
    if let Some(channel) = &text {
        channel.notify_closed(exit.fault()).await;
    }

    shared.connections.lock().unwrap().remove(&id);
    debug!(bind_path = %shared.opts.bind_path, connection = id, "connection finished");
}
