//! Seam between the hosting endpoint and websocket channel endpoints.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::ws::WebSocket;

/// What the hosting endpoint learned about a connection at upgrade time.
#[derive(Debug, Clone)]
pub struct UpgradeContext {
    /// First sub-protocol the peer proposed, echoed back in the upgrade
    /// response. `None` when the peer proposed nothing.
    pub sub_protocol: Option<String>,

    /// Peer socket address, when the transport exposes one.
    pub peer: Option<SocketAddr>,
}

/// A websocket endpoint bound on a hosting endpoint path.
///
/// The hosting endpoint routes upgrade requests whose path matches
/// [`bind_path`](Self::bind_path) to [`accept`](Self::accept), and calls
/// [`dispose`](Self::dispose) during teardown so the sub-server can
/// force-close its connections before the listener goes away.
#[async_trait]
pub trait WebSocketSubServer: Send + Sync {
    /// Exact request path this sub-server answers on.
    fn bind_path(&self) -> &str;

    /// Take ownership of one upgraded connection.
    async fn accept(&self, socket: WebSocket, context: UpgradeContext);

    /// Stop accepting and close every active connection.
    async fn dispose(&self);
}
