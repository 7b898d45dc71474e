//! WebSocket Channel Hosting Layer
//!
//! Multiplexes typed message channels over websocket connections and
//! fronts them with HTTP listeners carrying configurable client
//! certificate policies.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌────────────────────────────────────────────┐
//!                     │              HOSTING ENDPOINT              │
//!                     │                                            │
//!   Client Request    │  ┌─────────┐   ┌──────────┐   ┌─────────┐ │
//!   ──────────────────┼─▶│listener │──▶│ XFCC gate│──▶│dispatch │ │
//!                     │  │(tcp/tls)│   │(xfcc mode)│  └────┬────┘ │
//!                     │  └─────────┘   └──────────┘       │       │
//!                     │                    upgrade ◀──────┼──────▶ bound
//!                     │                       │           │       handlers,
//!                     │                       ▼           ▼       root app
//!                     │              ┌────────────────────────┐   │
//!                     │              │  websocket sub-server  │   │
//!                     │              │  (supply / factory)    │   │
//!                     │              └───────────┬────────────┘   │
//!                     │                          │                │
//!                     │                          ▼                │
//!                     │              ┌────────────────────────┐   │
//!                     │              │ channels: one typed    │   │
//!                     │              │ pub/sub lane per kind  │   │
//!                     │              └────────────────────────┘   │
//!                     └────────────────────────────────────────────┘
//! ```
//!
//! Trust decisions live in [`tls`]: handshake-level policies for plain
//! and mutual TLS, plus application-level validation of certificates
//! forwarded by a terminating proxy.

// Core subsystems
pub mod channel;
pub mod config;
pub mod http;
pub mod tls;

// Channel endpoints
pub mod endpoint;

// Cross-cutting concerns
pub mod error;

pub use channel::{
    BinaryChannel, ChannelEvent, ChannelFault, ChannelSubscriber, ConnectionHandle, TextChannel,
    WebSocketChannel,
};
pub use config::{ClientCertificateMode, EndpointConfig, HostingConfig, WebSocketEndpointConfig};
pub use endpoint::{
    ChannelFactory, ChannelSupplyHandler, ProvidedChannel, WebSocketChannelFactoryEndpoint,
    WebSocketChannelSupplyEndpoint,
};
pub use error::{BoxError, HostingError};
pub use http::{HostingEndpoint, UpgradeContext, WebSocketSubServer};
pub use tls::TrustAnchorSet;
