//! Wire types for the realtime data-channel protocol.
//!
//! Outbound messages are [`client_events::ClientEvent`]; inbound messages parse into
//! [`server_events::ServerEvent`], with anything unrecognized preserved verbatim.

pub mod client_events;
pub mod models;
pub mod server_events;
