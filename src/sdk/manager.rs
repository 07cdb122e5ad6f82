use crate::protocol::client_events::ClientEvent;
use crate::protocol::server_events::ServerEvent;
use crate::transport::{
    ChannelState, Connector, CredentialBroker, EventSink, LocalTrack, MediaSource, Signaling, Transport,
    TransportEvent,
};
use crate::{Error, Result, TRACE_LOG_MAX_BYTES, safe_truncate};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::builder::{ConnectConfig, ManagerOptions};
use super::credentials::CredentialCache;
use super::handlers::EventHandlers;
use super::machine::{ConnectionState, Effect, Handshake, Input, Limits, Machine, SessionPlan};
use super::tools::{ToolCall, ToolRegistry, ToolResult};

/// The outside world, as seen by the manager.
#[derive(Clone)]
pub struct Dependencies {
    pub broker: Arc<dyn CredentialBroker>,
    pub signaling: Arc<dyn Signaling>,
    pub media: Arc<dyn MediaSource>,
    pub connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies").finish_non_exhaustive()
    }
}

/// Everything a live session owns. Dropped as a unit on teardown.
struct LiveSession {
    epoch: u64,
    cancel: CancellationToken,
    signals: mpsc::UnboundedSender<Signal>,
    tools: Arc<ToolRegistry>,
    transport: Option<Arc<dyn Transport>>,
    tracks: Vec<Arc<dyn LocalTrack>>,
}

impl LiveSession {
    async fn release(self) {
        self.cancel.cancel();
        for track in &self.tracks {
            track.stop();
        }
        if let Some(transport) = self.transport {
            if let Err(err) = transport.close().await {
                tracing::debug!("Closing transport failed: {err}");
            }
        }
    }
}

/// Work the pump schedules for itself.
enum Signal {
    ChannelCheck { seq: u64 },
    GraceExpired { seq: u64 },
    ToolFinished(Result<ToolResult>),
}

struct Inner {
    signaling: Arc<dyn Signaling>,
    media: Arc<dyn MediaSource>,
    connector: Arc<dyn Connector>,
    credentials: CredentialCache,
    options: ManagerOptions,
    handlers: EventHandlers,
    machine: Mutex<Machine>,
    live: Mutex<Option<LiveSession>>,
    state_tx: watch::Sender<ConnectionState>,
    last_error: Mutex<Option<Arc<Error>>>,
}

/// Negotiates, maintains and tears down one realtime voice session at a time.
///
/// Native callbacks, timers and tool completions are serialized through one pump task
/// per session. Dropping the manager cancels whatever session is live.
pub struct RealtimeSessionManager {
    inner: Arc<Inner>,
}

impl RealtimeSessionManager {
    #[must_use]
    pub fn new(deps: Dependencies, options: ManagerOptions, handlers: EventHandlers) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let inner = Inner {
            signaling: deps.signaling,
            media: deps.media,
            connector: deps.connector,
            credentials: CredentialCache::new(deps.broker, options.credential_refresh_margin),
            machine: Mutex::new(Machine::new(Limits::from(&options))),
            options,
            handlers,
            live: Mutex::new(None),
            state_tx,
            last_error: Mutex::new(None),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Establish a session. A no-op unless the manager is idle, closed or failed.
    ///
    /// Returns once the session is open. A concurrent [`disconnect`](Self::disconnect)
    /// abandons the attempt and resolves this to `Ok(())`.
    ///
    /// # Errors
    /// The same error is handed to `on_error` and kept in [`last_error`](Self::last_error):
    /// - [`Error::Credential`] if the broker fails or omits the token.
    /// - [`Error::MediaAccess`] if audio capture is denied or unavailable.
    /// - [`Error::Negotiation`] if the offer/answer exchange fails.
    /// - [`Error::Transport`] if the connection dies before it opens.
    pub async fn connect(&self, config: ConnectConfig) -> std::result::Result<(), Arc<Error>> {
        let plan = SessionPlan::new(&config, self.inner.options.history_limit);
        let cancel = CancellationToken::new();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // The slot is filled under the machine lock so a concurrent disconnect() always
        // finds it.
        let (epoch, effects, stale) = {
            let mut machine = self.inner.machine.lock();
            if !machine.state().can_connect() {
                tracing::debug!(state = %machine.state(), "connect() ignored, session already active");
                return Ok(());
            }
            let effects = machine.handle(Input::Connect(plan));
            let epoch = machine.epoch();
            let stale = self.inner.live.lock().replace(LiveSession {
                epoch,
                cancel: cancel.clone(),
                signals: signal_tx,
                tools: Arc::clone(&config.tools),
                transport: None,
                tracks: Vec::new(),
            });
            (epoch, effects, stale)
        };

        // Leftovers from a session that ended abnormally.
        if let Some(stale) = stale {
            tracing::debug!(epoch = stale.epoch, "Releasing leftover session resources");
            stale.release().await;
        }

        tokio::spawn(pump(Arc::clone(&self.inner), epoch, cancel.clone(), event_rx, signal_rx));

        tracing::info!(model = %config.model, voice = %config.voice, "Connecting realtime session");
        self.inner.execute(epoch, effects).await;

        let outcome = tokio::select! {
            () = cancel.cancelled() => return self.inner.interrupted(),
            outcome = self.inner.establish(epoch, &config, event_tx) => outcome,
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = Arc::new(err);
                if self.inner.apply(epoch, Input::Fail(Arc::clone(&err))).await {
                    Err(err)
                } else {
                    self.inner.interrupted()
                }
            }
        }
    }

    /// Tear everything down and return to idle. Safe to call in any state, any number
    /// of times.
    pub async fn disconnect(&self) {
        let (epoch, effects) = {
            let mut machine = self.inner.machine.lock();
            let epoch = machine.epoch();
            (epoch, machine.handle(Input::Disconnect))
        };
        if !effects.is_empty() {
            tracing::info!("Disconnecting realtime session");
        }
        self.inner.execute(epoch, effects).await;
    }

    /// Send a user text message. `false` unless the session is open and writable.
    pub async fn send_message(&self, text: impl Into<String>) -> bool {
        self.send_event(ClientEvent::user_message(text)).await
    }

    /// Send a protocol event. `false` unless the session is open and writable.
    pub async fn send_event(&self, event: ClientEvent) -> bool {
        match serde_json::to_string(&event) {
            Ok(json) => self.inner.send_now(json).await,
            Err(err) => {
                tracing::warn!(kind = event.kind(), "Client event did not serialize: {err}");
                false
            }
        }
    }

    /// Send an arbitrary JSON event. It must carry a string `type`.
    pub async fn send_raw(&self, event: Value) -> bool {
        if !event.get("type").is_some_and(Value::is_string) {
            tracing::warn!("Refusing raw event without a string `type`");
            return false;
        }
        self.inner.send_now(event.to_string()).await
    }

    /// Flip the listening flag and announce it. `false` unless the session is open.
    pub async fn toggle_listening(&self) -> bool {
        let Some(transport) = self.inner.writable_transport() else {
            return false;
        };
        let (event, epoch) = {
            let mut machine = self.inner.machine.lock();
            let Some(event) = machine.toggle_listening() else {
                return false;
            };
            (event, machine.epoch())
        };
        match write(transport.as_ref(), &event).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("Failed to send {}: {err}", event.kind());
                self.inner.machine.lock().revert_listening(epoch);
                false
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Progress of the configuration send for the current session.
    #[must_use]
    pub fn handshake(&self) -> Handshake {
        self.inner.machine.lock().handshake()
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.inner.machine.lock().is_listening()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<Arc<Error>> {
        self.inner.last_error.lock().clone()
    }
}

impl Drop for RealtimeSessionManager {
    fn drop(&mut self) {
        let Some(session) = self.inner.live.lock().take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(session.release());
        } else {
            session.cancel.cancel();
            for track in &session.tracks {
                track.stop();
            }
        }
    }
}

impl std::fmt::Debug for RealtimeSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSessionManager")
            .field("state", &self.state())
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl Inner {
    async fn establish(&self, epoch: u64, config: &ConnectConfig, events: EventSink) -> Result<()> {
        tokio::time::sleep(self.options.settle_delay).await;

        let credential = self.credentials.get(&config.credential_request()).await?;

        let transport = self.connector.connect(events).await?;
        let installed = self.with_session(epoch, |session| {
            session.transport = Some(Arc::clone(&transport));
        });
        if installed.is_none() {
            if let Err(err) = transport.close().await {
                tracing::debug!("Closing abandoned transport failed: {err}");
            }
            return Err(Error::Cancelled);
        }

        let tracks = self.media.acquire_audio().await?;
        let installed = self.with_session(epoch, |session| session.tracks.clone_from(&tracks));
        if installed.is_none() {
            tracks.iter().for_each(|track| track.stop());
            return Err(Error::Cancelled);
        }
        transport.attach_tracks(&tracks).await?;

        transport.open_channel(&self.options.channel_label).await?;
        transport.negotiate(self.signaling.as_ref(), &credential).await?;

        self.apply(epoch, Input::Negotiated).await;
        Ok(())
    }

    /// Outcome of a `connect()` whose session was torn down underneath it.
    fn interrupted(&self) -> std::result::Result<(), Arc<Error>> {
        if self.machine.lock().state() != ConnectionState::Failed {
            return Ok(());
        }
        let err = self.last_error.lock().clone();
        Err(err.unwrap_or_else(|| Arc::new(Error::Transport("connection failed".to_string()))))
    }

    /// Feed one input into the machine and run the effects. Returns `false` when the
    /// input belongs to a session that has already ended.
    async fn apply(&self, epoch: u64, input: Input) -> bool {
        let effects = {
            let mut machine = self.machine.lock();
            if machine.epoch() != epoch {
                return false;
            }
            machine.handle(input)
        };
        self.execute(epoch, effects).await;
        true
    }

    async fn execute(&self, epoch: u64, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish { state, epoch: stamp } => {
                    if self.publish(state, stamp) {
                        self.handlers.state(state).await;
                    }
                }
                Effect::Send(event) => self.send_queued(epoch, &event).await,
                Effect::CheckChannel { seq, after } => self.schedule(epoch, after, Signal::ChannelCheck { seq }),
                Effect::StartGrace { seq, after } => self.schedule(epoch, after, Signal::GraceExpired { seq }),
                Effect::Dispatch(call) => self.spawn_tool(epoch, call),
                Effect::Forward(value) => self.handlers.event(value).await,
                Effect::ReportError(err) => {
                    tracing::warn!(kind = ?err.kind(), "Session error: {err}");
                    *self.last_error.lock() = Some(Arc::clone(&err));
                    self.handlers.error(err).await;
                }
                Effect::Teardown => self.teardown(epoch).await,
            }
        }
    }

    /// Publish `state` unless a newer session has started since `stamp`.
    fn publish(&self, state: ConnectionState, stamp: u64) -> bool {
        let machine = self.machine.lock();
        if machine.epoch() != stamp {
            tracing::debug!(%state, "Dropping state change from an ended session");
            return false;
        }
        self.state_tx.send_replace(state);
        true
    }

    fn with_session<T>(&self, epoch: u64, f: impl FnOnce(&mut LiveSession) -> T) -> Option<T> {
        let mut live = self.live.lock();
        live.as_mut().filter(|session| session.epoch == epoch).map(f)
    }

    fn transport(&self, epoch: u64) -> Option<Arc<dyn Transport>> {
        self.with_session(epoch, |session| session.transport.clone()).flatten()
    }

    async fn teardown(&self, epoch: u64) {
        let session = {
            let mut live = self.live.lock();
            if live.as_ref().is_some_and(|session| session.epoch <= epoch) {
                live.take()
            } else {
                None
            }
        };
        if let Some(session) = session {
            tracing::debug!(epoch = session.epoch, "Releasing session resources");
            session.release().await;
        }
    }

    fn schedule(&self, epoch: u64, after: Duration, signal: Signal) {
        let Some((signals, cancel)) =
            self.with_session(epoch, |session| (session.signals.clone(), session.cancel.clone()))
        else {
            return;
        };
        if after.is_zero() {
            let _ = signals.send(signal);
            return;
        }
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(after) => {
                    let _ = signals.send(signal);
                }
            }
        });
    }

    fn spawn_tool(&self, epoch: u64, call: ToolCall) {
        let Some((tools, signals, cancel)) = self.with_session(epoch, |session| {
            (Arc::clone(&session.tools), session.signals.clone(), session.cancel.clone())
        }) else {
            return;
        };
        tracing::debug!(tool = %call.name, call_id = %call.call_id, "Running tool");
        tokio::spawn(async move {
            let name = call.name.clone();
            tokio::select! {
                () = cancel.cancelled() => tracing::debug!(tool = %name, "Abandoning tool call"),
                result = tools.dispatch(call) => {
                    let _ = signals.send(Signal::ToolFinished(result));
                }
            }
        });
    }

    async fn send_queued(&self, epoch: u64, event: &ClientEvent) {
        let Some(transport) = self.transport(epoch) else {
            tracing::debug!(kind = event.kind(), "Dropping event for a closed session");
            return;
        };
        if let Err(err) = write(transport.as_ref(), event).await {
            tracing::warn!("Failed to send {}: {err}", event.kind());
        }
    }

    /// The live transport, if the session is open and its channel writable.
    fn writable_transport(&self) -> Option<Arc<dyn Transport>> {
        let epoch = {
            let machine = self.machine.lock();
            if machine.state() != ConnectionState::Open {
                return None;
            }
            machine.epoch()
        };
        self.transport(epoch)
            .filter(|transport| transport.channel_state() == ChannelState::Open)
    }

    async fn send_now(&self, json: String) -> bool {
        let Some(transport) = self.writable_transport() else {
            return false;
        };
        tracing::trace!("Sending event: {}", safe_truncate(&json, TRACE_LOG_MAX_BYTES));
        match transport.send_text(json).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("Send failed: {err}");
                false
            }
        }
    }
}

async fn write(transport: &dyn Transport, event: &ClientEvent) -> Result<()> {
    let json = serde_json::to_string(event)?;
    tracing::trace!("Sending event: {}", safe_truncate(&json, TRACE_LOG_MAX_BYTES));
    transport.send_text(json).await
}

/// Serializes everything that happens to one session.
async fn pump(
    inner: Arc<Inner>,
    epoch: u64,
    cancel: CancellationToken,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
) {
    loop {
        let input = tokio::select! {
            () = cancel.cancelled() => break,
            Some(event) = events.recv() => match translate(event) {
                Some(input) => input,
                None => continue,
            },
            Some(signal) = signals.recv() => match signal {
                Signal::ChannelCheck { seq } => {
                    let channel = inner
                        .transport(epoch)
                        .map_or(ChannelState::Connecting, |transport| transport.channel_state());
                    Input::ChannelChecked { seq, channel }
                }
                Signal::GraceExpired { seq } => Input::GraceExpired { seq },
                Signal::ToolFinished(result) => Input::ToolFinished(result),
            },
            else => break,
        };
        if !inner.apply(epoch, input).await {
            break;
        }
    }
    tracing::trace!(epoch, "Session pump stopped");
}

fn translate(event: TransportEvent) -> Option<Input> {
    match event {
        TransportEvent::ConnectionState(link) => {
            tracing::debug!(?link, "Connection state changed");
            Some(Input::Link(link))
        }
        TransportEvent::IceState(link) => {
            tracing::debug!(?link, "ICE state changed");
            Some(Input::Link(link))
        }
        TransportEvent::ChannelOpened => Some(Input::ChannelOpened),
        TransportEvent::ChannelClosed => Some(Input::ChannelClosed),
        TransportEvent::Message(text) => {
            tracing::trace!("Received event: {}", safe_truncate(&text, TRACE_LOG_MAX_BYTES));
            match ServerEvent::parse(&text) {
                Ok(event) => Some(Input::Inbound(event)),
                Err(err) => {
                    tracing::warn!("Dropping unparseable event: {err}");
                    None
                }
            }
        }
        TransportEvent::RemoteTrack { kind } => {
            tracing::info!(?kind, "Remote track attached");
            None
        }
    }
}
