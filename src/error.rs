use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorType {
    InvalidRequestError,
    RateLimitError,
    AuthenticationError,
    ServerError,
    #[serde(other)]
    Unknown,
}

/// Error payload carried by an inbound `error` event.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerError {
    #[serde(rename = "type", default = "unknown_error_type")]
    pub error_type: ApiErrorType,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
}

const fn unknown_error_type() -> ApiErrorType {
    ApiErrorType::Unknown
}

/// Coarse classification so callers can branch without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Credential,
    MediaAccess,
    Negotiation,
    Transport,
    ToolExecution,
    Remote,
    Protocol,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("credential broker failed{}: {body}", status_suffix(.status))]
    Credential { status: Option<u16>, body: String },

    #[error("audio capture unavailable: {0}")]
    MediaAccess(String),

    #[error("session negotiation failed{}: {body}", status_suffix(.status))]
    Negotiation { status: Option<u16>, body: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("tool `{tool}` failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("remote endpoint error: {0:?}")]
    Api(ServerError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[cfg(feature = "webrtc")]
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("HTTP protocol error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse or serialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Header error: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("The connection was closed unexpectedly")]
    ConnectionClosed,

    #[error("operation cancelled by disconnect")]
    Cancelled,
}

impl Error {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Credential { .. } => ErrorKind::Credential,
            Self::MediaAccess(_) => ErrorKind::MediaAccess,
            Self::Negotiation { .. } => ErrorKind::Negotiation,
            Self::Transport(_) | Self::WebSocket(_) | Self::ConnectionClosed => ErrorKind::Transport,
            #[cfg(feature = "webrtc")]
            Self::WebRtc(_) => ErrorKind::Transport,
            Self::ToolExecution { .. } | Self::UnknownTool(_) => ErrorKind::ToolExecution,
            Self::Api(_) => ErrorKind::Remote,
            Self::Http(_)
            | Self::Serialization(_)
            | Self::Url(_)
            | Self::Header(_) => ErrorKind::Protocol,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// True when the caller should prompt the user for microphone permission.
    #[must_use]
    pub const fn is_media_access(&self) -> bool {
        matches!(self, Self::MediaAccess(_))
    }

    pub(crate) fn negotiation(err: impl std::fmt::Display) -> Self {
        Self::Negotiation { status: None, body: err.to_string() }
    }
}

#[allow(clippy::ref_option)]
fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, Error>;
