//! WebSocket channel abstraction.
//!
//! # Data Flow
//! ```text
//! upgraded socket (split)
//!     → socket.rs (ConnectionHandle: serialized writes, close state)
//!     → duplex.rs (WebSocketChannel<T>: typed payloads over one connection)
//!     → pubsub.rs (fan-out to ChannelSubscriber implementations)
//! ```
//!
//! # Design Decisions
//! - Subscribers are snapshotted before each dispatch, so a subscriber may
//!   unsubscribe itself from inside its own callback
//! - A channel whose subscribers fail becomes broken: the connection is
//!   closed with an internal-error code, every subscriber hears one final
//!   fault event, and later inbound frames are discarded
//! - Broken is one-way; a broken channel never recovers

pub mod duplex;
pub mod pubsub;
pub mod socket;

pub use duplex::{BinaryChannel, TextChannel, WebSocketChannel, WireMessage};
pub use pubsub::{ChannelEvent, ChannelFault, ChannelSubscriber};
pub use socket::{close_code, ConnectionHandle};
