//! Native peer-connection adapter over the `webrtc` crate.
//!
//! Native callbacks are flattened into [`TransportEvent`]s; the session manager never
//! sees a `webrtc` type.

use super::{
    ChannelState, Connector, Credential, EventSink, LinkState, LocalTrack, MediaSource, Signaling, TrackKind,
    Transport, TransportEvent,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const RTCP_BUFFER_LEN: usize = 1500;

const fn peer_link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Checking),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

const fn ice_link_state(state: RTCIceConnectionState) -> Option<LinkState> {
    match state {
        RTCIceConnectionState::New => Some(LinkState::New),
        RTCIceConnectionState::Checking => Some(LinkState::Checking),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => Some(LinkState::Connected),
        RTCIceConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCIceConnectionState::Failed => Some(LinkState::Failed),
        RTCIceConnectionState::Closed => Some(LinkState::Closed),
        RTCIceConnectionState::Unspecified => None,
    }
}

const fn channel_state(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
        RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => ChannelState::Connecting,
    }
}

/// Builds one `RTCPeerConnection` per session.
#[derive(Debug, Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<String>,
    loopback_candidates: bool,
}

impl WebRtcConnector {
    /// An empty `ice_servers` list gathers host candidates only.
    #[must_use]
    pub const fn new(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            loopback_candidates: false,
        }
    }

    /// Offer loopback host candidates too. Only useful against a local endpoint.
    #[must_use]
    pub fn with_loopback_candidates(mut self, include: bool) -> Self {
        self.loopback_candidates = include;
        self
    }

    fn api(&self) -> Result<API> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let mut settings = SettingEngine::default();
        settings.set_include_loopback_candidate(self.loopback_candidates);
        Ok(APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build())
    }

    async fn build(&self, events: EventSink) -> Result<WebRtcTransport> {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(self.api()?.new_peer_connection(config).await?);

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!(%state, "Peer connection state changed");
            if let Some(link) = peer_link_state(state) {
                let _ = sink.send(TransportEvent::ConnectionState(link));
            }
            Box::pin(async {})
        }));

        let sink = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            tracing::debug!(%state, "ICE connection state changed");
            if let Some(link) = ice_link_state(state) {
                let _ = sink.send(TransportEvent::IceState(link));
            }
            Box::pin(async {})
        }));

        let sink = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = if track.kind() == RTPCodecType::Video { TrackKind::Video } else { TrackKind::Audio };
                let _ = sink.send(TransportEvent::RemoteTrack { kind });
                Box::pin(async {})
            },
        ));

        Ok(WebRtcTransport {
            pc,
            channel: Mutex::new(None),
            events,
        })
    }
}

impl Default for WebRtcConnector {
    fn default() -> Self {
        Self::new(vec![DEFAULT_STUN_SERVER.to_string()])
    }
}

#[async_trait]
impl Connector for WebRtcConnector {
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(self.build(events).await?))
    }
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
    events: EventSink,
}

impl WebRtcTransport {
    fn channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.lock().clone()
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn attach_tracks(&self, tracks: &[Arc<dyn LocalTrack>]) -> Result<()> {
        for track in tracks {
            let Some(opus) = track.as_any().downcast_ref::<OpusTrack>() else {
                return Err(Error::Transport(format!("track {} is not backed by an RTP sample track", track.id())));
            };
            let local: Arc<dyn TrackLocal + Send + Sync> = Arc::clone(&opus.inner) as _;
            let sender = self.pc.add_track(local).await?;
            // Drain RTCP so interceptors keep running.
            tokio::spawn(async move {
                let mut buf = vec![0u8; RTCP_BUFFER_LEN];
                while sender.read(&mut buf).await.is_ok() {}
            });
            tracing::debug!(track = track.id(), "Attached local track");
        }
        Ok(())
    }

    async fn open_channel(&self, label: &str) -> Result<()> {
        if self.channel().is_some() {
            return Err(Error::Transport("event channel already open".to_string()));
        }
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;

        let sink = self.events.clone();
        dc.on_open(Box::new(move || {
            let _ = sink.send(TransportEvent::ChannelOpened);
            Box::pin(async {})
        }));
        let sink = self.events.clone();
        dc.on_close(Box::new(move || {
            let _ = sink.send(TransportEvent::ChannelClosed);
            Box::pin(async {})
        }));
        let sink = self.events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = sink.send(TransportEvent::Message(text));
                }
                Err(err) => tracing::warn!("Dropping non-UTF-8 channel message: {err}"),
            }
            Box::pin(async {})
        }));

        *self.channel.lock() = Some(dc);
        Ok(())
    }

    async fn negotiate(&self, signaling: &dyn Signaling, credential: &Credential) -> Result<()> {
        let offer = self.pc.create_offer(None).await.map_err(Error::negotiation)?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await.map_err(Error::negotiation)?;
        // Send only the complete candidate set.
        let _ = gathered.recv().await;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::negotiation("no local description after ICE gathering"))?;
        tracing::debug!(bytes = local.sdp.len(), "ICE gathering complete, posting offer");

        let answer_sdp = signaling.exchange(&local.sdp, credential).await?;
        let answer = RTCSessionDescription::answer(answer_sdp).map_err(Error::negotiation)?;
        self.pc.set_remote_description(answer).await.map_err(Error::negotiation)?;
        Ok(())
    }

    fn channel_state(&self) -> ChannelState {
        self.channel().map_or(ChannelState::Closed, |dc| channel_state(dc.ready_state()))
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let dc = self.channel().ok_or(Error::ConnectionClosed)?;
        dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let channel = self.channel.lock().take();
        if let Some(dc) = channel {
            if let Err(err) = dc.close().await {
                tracing::debug!("Closing event channel failed: {err}");
            }
        }
        self.pc.close().await?;
        Ok(())
    }
}

/// Local Opus track fed by the caller's capture pipeline.
pub struct OpusTrack {
    id: String,
    inner: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
}

impl OpusTrack {
    #[must_use]
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let id = id.into();
        let capability = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            ..Default::default()
        };
        let inner = Arc::new(TrackLocalStaticSample::new(capability, id.clone(), stream_id.into()));
        Self { id, inner, stopped: AtomicBool::new(false) }
    }

    /// Write one encoded Opus frame. Frames written after `stop` are dropped.
    ///
    /// # Errors
    /// Returns an error if the underlying RTP writer fails.
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.inner.write_sample(&sample).await?;
        Ok(())
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for OpusTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpusTrack")
            .field("id", &self.id)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl LocalTrack for OpusTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hands a fresh [`OpusTrack`] to the capture pipeline for every acquisition.
pub struct OpusCaptureSource {
    stream_id: String,
    tracks: mpsc::UnboundedSender<Arc<OpusTrack>>,
}

impl OpusCaptureSource {
    /// Returns the source and the receiver on which the capture pipeline picks up each
    /// new track.
    #[must_use]
    pub fn new(stream_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Arc<OpusTrack>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { stream_id: stream_id.into(), tracks: tx }, rx)
    }
}

#[async_trait]
impl MediaSource for OpusCaptureSource {
    async fn acquire_audio(&self) -> Result<Vec<Arc<dyn LocalTrack>>> {
        let track = Arc::new(OpusTrack::new("microphone", self.stream_id.clone()));
        self.tracks
            .send(Arc::clone(&track))
            .map_err(|_| Error::MediaAccess("capture pipeline is gone".to_string()))?;
        Ok(vec![track as Arc<dyn LocalTrack>])
    }
}
