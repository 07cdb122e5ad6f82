#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Realtime voice session negotiation for the Floyd chat front-end.
//!
//! [`RealtimeSessionManager`] fetches an ephemeral credential, builds a peer connection,
//! exchanges SDP with the realtime endpoint, configures the session over the event
//! channel and runs locally registered tools on the remote model's behalf. The outside
//! world is reached through the traits in [`transport`], so every step can be faked.

pub mod error;
pub mod protocol;
pub mod sdk;
pub mod transport;

pub use error::{Error, ErrorKind, Result, ServerError};
pub use protocol::client_events::ClientEvent;
pub use protocol::models::{
    AudioEncoding, ChatMessage, ContentPart, Item, Modality, Role, SessionSettings, Tool, ToolChoice,
    TurnDetection, Voice,
};
pub use protocol::server_events::ServerEvent;
pub use sdk::{
    ConnectConfig, ConnectConfigBuilder, ConnectionState, Dependencies, EventHandlers, Handshake,
    HistoryEntry, ManagerOptions, RealtimeSessionManager, ToolCall, ToolDefinition, ToolFuture,
    ToolRegistry, ToolResult, ToolSpec,
};

pub(crate) const TRACE_LOG_MAX_BYTES: usize = 1024;
const TRACE_TRUNCATE_SUFFIX: &str = "... (truncated)";

pub(crate) fn safe_truncate(s: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if s.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(s);
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!(
        "{} {} {} bytes",
        &s[..end],
        TRACE_TRUNCATE_SUFFIX,
        s.len() - end
    ))
}
