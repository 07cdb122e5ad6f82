//! WebSocket variant of the event transport.
//!
//! There is no SDP here: "negotiation" is the authenticated WebSocket handshake, and
//! the socket itself plays the role of the event channel. Media tracks cannot ride a
//! WebSocket, so they are accepted and ignored.

use super::{ChannelState, Connector, Credential, EventSink, LinkState, LocalTrack, Signaling, Transport, TransportEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use parking_lot::Mutex;
use reqwest::header::HeaderValue;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

pub const WS_BASE_URL: &str = "wss://api.openai.com/v1/realtime";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(WS_BASE_URL)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(WsTransport::new(self.base_url.clone(), events)))
    }
}

pub struct WsTransport {
    base_url: String,
    events: EventSink,
    writer: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    state: Arc<Mutex<ChannelState>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    #[must_use]
    pub fn new(base_url: String, events: EventSink) -> Self {
        Self {
            base_url,
            events,
            writer: tokio::sync::Mutex::new(None),
            state: Arc::new(Mutex::new(ChannelState::Connecting)),
            reader: Mutex::new(None),
        }
    }

    #[allow(clippy::result_large_err)]
    fn request_url(&self, model: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)?;
        url.query_pairs_mut().append_pair("model", model);
        Ok(url)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn attach_tracks(&self, tracks: &[Arc<dyn LocalTrack>]) -> Result<()> {
        tracing::debug!(count = tracks.len(), "WebSocket transport does not carry media tracks");
        Ok(())
    }

    async fn open_channel(&self, label: &str) -> Result<()> {
        tracing::debug!(label, "WebSocket doubles as the event channel");
        Ok(())
    }

    async fn negotiate(&self, _signaling: &dyn Signaling, credential: &Credential) -> Result<()> {
        let url = self.request_url(&credential.model)?;
        let mut req = url.as_str().into_client_request()?;
        let headers = req.headers_mut();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", credential.token))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        headers.insert("openai-beta", HeaderValue::from_static("realtime=v1"));

        let (stream, _) = connect_async(req).await.map_err(Error::negotiation)?;
        tracing::info!("Connected to realtime endpoint over WebSocket");

        let (write, mut read) = stream.split();
        *self.writer.lock().await = Some(write);
        *self.state.lock() = ChannelState::Open;
        let _ = self.events.send(TransportEvent::ConnectionState(LinkState::Connected));
        let _ = self.events.send(TransportEvent::ChannelOpened);

        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let _ = events.send(TransportEvent::Message(text.as_str().to_owned()));
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::info!(?frame, "WebSocket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!("WebSocket read failed: {err}");
                        let _ = events.send(TransportEvent::ConnectionState(LinkState::Failed));
                        break;
                    }
                }
            }
            *state.lock() = ChannelState::Closed;
            let _ = events.send(TransportEvent::ChannelClosed);
            let _ = events.send(TransportEvent::ConnectionState(LinkState::Closed));
        });
        *self.reader.lock() = Some(handle);
        Ok(())
    }

    fn channel_state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(Error::ConnectionClosed)?;
        sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.state.lock() = ChannelState::Closing;
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let result = match self.writer.lock().await.take() {
            Some(mut sink) => sink.close().await.map_err(Error::from),
            None => Ok(()),
        };
        *self.state.lock() = ChannelState::Closed;
        result
    }
}
