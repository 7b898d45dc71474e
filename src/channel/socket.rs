//! Per-connection write half and close state.

use std::net::SocketAddr;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::error::HostingError;

/// Close codes used by the hosting layer.
pub mod close_code {
    /// Server is shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// The connection produced data the endpoint cannot consume.
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// The negotiated sub-protocol is not allowed on this endpoint.
    pub const UNSUPPORTED_PROTOCOL: u16 = 1007;
    /// Channel machinery failed while handling the connection.
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// One accepted websocket connection.
///
/// Owns the write half behind an async mutex so channels sharing the
/// connection never interleave frames, and tracks close state through a
/// watch channel that per-connection tasks select on.
pub struct ConnectionHandle {
    id: u64,
    sub_protocol: String,
    peer: Option<SocketAddr>,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    closed: watch::Sender<bool>,
    close_frame: std::sync::Mutex<Option<(u16, String)>>,
}

impl ConnectionHandle {
    pub fn new(
        id: u64,
        sub_protocol: impl Into<String>,
        peer: Option<SocketAddr>,
        sink: SplitSink<WebSocket, Message>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            sub_protocol: sub_protocol.into(),
            peer,
            sink: Mutex::new(sink),
            closed,
            close_frame: std::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sub-protocol the connection settled on at upgrade time.
    pub fn sub_protocol(&self) -> &str {
        &self.sub_protocol
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// A receiver that flips to `true` once the connection is closed.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Write one frame to the peer.
    pub async fn send(&self, message: Message) -> Result<(), HostingError> {
        if self.is_closed() {
            return Err(HostingError::invalid_operation(
                "cannot send on a closed connection",
            ));
        }
        let mut sink = self.sink.lock().await;
        sink.send(message)
            .await
            .map_err(|e| HostingError::Transport(e.to_string()))
    }

    /// Code and reason this side closed with, if [`close`](Self::close)
    /// ran.
    pub fn close_frame(&self) -> Option<(u16, String)> {
        self.close_frame.lock().unwrap().clone()
    }

    /// Close the connection with the given code. Later calls are no-ops.
    pub async fn close(&self, code: u16, reason: &str) {
        {
            // Stored before the watch flips, so tasks woken by it can
            // read the code.
            let mut stored = self.close_frame.lock().unwrap();
            if stored.is_none() {
                *stored = Some((code, reason.to_owned()));
            }
        }
        if self.closed.send_replace(true) {
            return;
        }

        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!(connection = self.id, error = %e, "close frame not delivered");
        }
    }

    /// Flag the connection closed without writing a close frame, for peers
    /// that already closed or errored. Returns whether this call performed
    /// the transition.
    pub fn mark_closed(&self) -> bool {
        !self.closed.send_replace(true)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("sub_protocol", &self.sub_protocol)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
