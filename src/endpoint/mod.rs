//! WebSocket channel endpoints.
//!
//! Two flavors of endpoint sit on top of the hosting layer:
//!
//! - [`supply`]: the application consumes channels the endpoint supplies,
//!   one per sub-protocol kind per connection, and attaches subscribers
//!   to them
//! - [`factory`]: the application supplies the channels (usually bridges
//!   to some backend) and the endpoint wires each connection to them,
//!   forwarding frames in both directions

pub mod factory;
pub mod supply;

pub use factory::{ChannelFactory, ProvidedChannel, WebSocketChannelFactoryEndpoint};
pub use supply::{ChannelSupplyHandler, WebSocketChannelSupplyEndpoint};

use crate::config::WebSocketEndpointConfig;

/// Settle on the sub-protocol for a connection.
///
/// No proposal means the configured default. A proposal is accepted when
/// it is the default or appears in the allowed list; anything else is
/// rejected with the offending name.
pub(crate) fn negotiate_sub_protocol(
    opts: &WebSocketEndpointConfig,
    proposed: Option<&str>,
) -> Result<String, String> {
    match proposed {
        None => Ok(opts.default_protocol.clone()),
        Some(proposal) => {
            if proposal == opts.default_protocol
                || opts.allowed_protocols.iter().any(|p| p == proposal)
            {
                Ok(proposal.to_owned())
            } else {
                Err(proposal.to_owned())
            }
        }
    }
}
