//! HTTP hosting layer.
//!
//! # Data Flow
//! ```text
//! listener (plain TCP or TLS)
//!     → endpoint.rs (HostingEndpoint: accept, dispatch)
//!         → XFCC gate (xfcc mode only)
//!         → websocket upgrade → subserver.rs (registered acceptors)
//!         → prefix-bound request handlers, registration order
//!         → root application router
//!         → 503 when nothing claims the request
//! ```
//!
//! # Design Decisions
//! - One dispatch path for requests and upgrades, so XFCC enforcement
//!   cannot be bypassed by switching to an upgrade request
//! - Routing tables are mutable at runtime; binding and destroying
//!   websocket sub-servers does not restart the listener

pub mod endpoint;
pub mod subserver;

pub use endpoint::{HostingEndpoint, RequestHandler};
pub use subserver::{UpgradeContext, WebSocketSubServer};
