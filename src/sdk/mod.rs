//! Session management on top of the protocol and transport layers.
//!
//! [`RealtimeSessionManager`] is the entry point. The state machine behind it lives in
//! `machine` and is independent of any runtime.

mod builder;
mod credentials;
mod handlers;
mod machine;
mod manager;
mod tools;

pub use builder::{
    ConnectConfig, ConnectConfigBuilder, DEFAULT_CHANNEL_LABEL, DEFAULT_CONFIG_MAX_ATTEMPTS,
    DEFAULT_CONFIG_RETRY_INTERVAL, DEFAULT_CREDENTIAL_REFRESH_MARGIN, DEFAULT_DISCONNECT_GRACE,
    DEFAULT_HISTORY_LIMIT, DEFAULT_SETTLE_DELAY, HistoryEntry, ManagerOptions,
};
pub use handlers::{ErrorHandler, EventHandler, EventHandlers, StateHandler};
pub use machine::{ConnectionState, Handshake};
pub use manager::{Dependencies, RealtimeSessionManager};
pub use tools::{BoxFuture as ToolFuture, ToolCall, ToolDefinition, ToolRegistry, ToolResult, ToolSpec};
