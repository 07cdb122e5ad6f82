//! Seams between the session manager and the outside world.
//!
//! The manager only talks to these traits. `rest` and `ws` provide HTTP and WebSocket
//! implementations; `webrtc` (behind the `webrtc` feature) binds a native peer
//! connection. Tests plug in in-memory fakes.

pub mod rest;
#[cfg(feature = "webrtc")]
pub mod webrtc;
pub mod ws;

use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Body sent to the credential broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CredentialRequest {
    pub model: String,
    pub voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Short-lived bearer credential for one realtime session.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    /// Unix timestamp, seconds.
    pub expires_at: u64,
    pub model: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("model", &self.model)
            .finish()
    }
}

#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn fetch(&self, request: &CredentialRequest) -> Result<Credential>;
}

/// Offer/answer exchange with the remote realtime endpoint.
#[async_trait]
pub trait Signaling: Send + Sync {
    async fn exchange(&self, offer_sdp: &str, credential: &Credential) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A locally captured media track.
pub trait LocalTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    /// Release the capture device. Must tolerate repeated calls.
    fn stop(&self);
    fn as_any(&self) -> &dyn Any;
}

/// Microphone (or display) capture.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire local audio. Denied or missing devices must map to
    /// [`crate::Error::MediaAccess`].
    async fn acquire_audio(&self) -> Result<Vec<Arc<dyn LocalTrack>>>;
}

/// Connection and ICE states reported by the native transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Native callbacks, flattened into one ordered stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionState(LinkState),
    IceState(LinkState),
    ChannelOpened,
    ChannelClosed,
    Message(String),
    RemoteTrack { kind: TrackKind },
}

pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// One peer connection with at most one event channel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn attach_tracks(&self, tracks: &[Arc<dyn LocalTrack>]) -> Result<()>;

    /// Open the ordered, reliable event channel.
    async fn open_channel(&self, label: &str) -> Result<()>;

    /// Produce a local description (after ICE gathering completes), exchange it through
    /// `signaling` and apply the answer.
    async fn negotiate(&self, signaling: &dyn Signaling, credential: &Credential) -> Result<()>;

    /// Current channel state, read fresh on every call.
    fn channel_state(&self) -> ChannelState;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds transports. Each call must return an independent connection whose callbacks
/// feed `events`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn Transport>>;
}
