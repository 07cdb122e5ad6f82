//! Session state machine.
//!
//! Every native callback, timer and tool completion is turned into an [`Input`]. The
//! machine folds it into its state and answers with [`Effect`]s that the manager
//! executes. Nothing in here touches the network or the clock, so negotiation order,
//! retry bookkeeping and function-call assembly are tested directly.

use crate::protocol::client_events::ClientEvent;
use crate::protocol::models::{Item, Role, SessionSettings};
use crate::protocol::server_events::ServerEvent;
use crate::transport::{ChannelState, LinkState};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::builder::{ConnectConfig, ManagerOptions};
use super::tools::{ToolCall, ToolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Whether `connect()` may start from this state.
    #[must_use]
    pub const fn can_connect(self) -> bool {
        matches!(self, Self::Idle | Self::Closed | Self::Failed)
    }

    /// Whether a transport is live.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Progress of the configuration send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handshake {
    #[default]
    NotStarted,
    Pending { attempts: u32 },
    Configured,
    Abandoned,
}

/// What gets sent once the event channel is open.
#[derive(Debug, Clone)]
pub(crate) struct SessionPlan {
    settings: SessionSettings,
    instructions: Option<String>,
    history: Vec<String>,
    tools: HashSet<String>,
}

impl SessionPlan {
    pub(crate) fn new(config: &ConnectConfig, history_limit: usize) -> Self {
        let user_turns: Vec<&str> = config
            .history
            .iter()
            .filter(|entry| entry.role == Role::User)
            .map(|entry| entry.text.as_str())
            .collect();
        let skip = user_turns.len().saturating_sub(history_limit);

        Self {
            settings: SessionSettings::new(config.voice.clone()).with_tools(config.tools.as_tools()),
            instructions: config.instructions.clone(),
            history: user_turns[skip..].iter().map(|text| (*text).to_string()).collect(),
            tools: config.tools.definitions().iter().map(|def| def.name.clone()).collect(),
        }
    }

    fn configuration(&self) -> Vec<Effect> {
        let mut effects = vec![Effect::Send(ClientEvent::session_update(self.settings.clone()))];
        if let Some(instructions) = &self.instructions {
            effects.push(Effect::Send(ClientEvent::create_item(Item::system_text(instructions.clone()))));
        }
        effects.extend(
            self.history
                .iter()
                .map(|text| Effect::Send(ClientEvent::create_item(Item::user_text(text.clone())))),
        );
        effects
    }
}

/// A function call being streamed in by the remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FunctionCallAccumulator {
    call_id: String,
    name: String,
    arguments: String,
    fragments: usize,
}

impl FunctionCallAccumulator {
    fn new(call_id: String, name: String) -> Self {
        Self {
            call_id,
            name,
            arguments: String::new(),
            fragments: 0,
        }
    }

    fn push(&mut self, fragment: &str) {
        self.arguments.push_str(fragment);
        self.fragments += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Limits {
    pub config_retry_interval: Duration,
    pub config_max_attempts: u32,
    pub disconnect_grace: Duration,
}

impl From<&ManagerOptions> for Limits {
    fn from(options: &ManagerOptions) -> Self {
        Self {
            config_retry_interval: options.config_retry_interval,
            config_max_attempts: options.config_max_attempts.max(1),
            disconnect_grace: options.disconnect_grace,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Input {
    Connect(SessionPlan),
    Negotiated,
    Fail(Arc<Error>),
    ChannelOpened,
    ChannelClosed,
    ChannelChecked { seq: u64, channel: ChannelState },
    Link(LinkState),
    GraceExpired { seq: u64 },
    Inbound(ServerEvent),
    ToolFinished(Result<ToolResult>),
    Disconnect,
}

#[derive(Debug)]
pub(crate) enum Effect {
    /// Announce `state`, unless a newer session has started since `epoch`.
    Publish { state: ConnectionState, epoch: u64 },
    Send(ClientEvent),
    /// Read the channel state after `after` and feed it back as `ChannelChecked`.
    CheckChannel { seq: u64, after: Duration },
    StartGrace { seq: u64, after: Duration },
    Dispatch(ToolCall),
    Forward(Value),
    ReportError(Arc<Error>),
    Teardown,
}

#[derive(Debug)]
pub(crate) struct Machine {
    limits: Limits,
    state: ConnectionState,
    epoch: u64,
    plan: Option<SessionPlan>,
    handshake: Handshake,
    check_seq: u64,
    grace_seq: u64,
    grace_armed: bool,
    pending_call: Option<FunctionCallAccumulator>,
    /// Call id of the tool currently running. Completed calls wait in `queued_calls`.
    running_call: Option<String>,
    queued_calls: VecDeque<ToolCall>,
    listening: bool,
}

impl Machine {
    pub(crate) const fn new(limits: Limits) -> Self {
        Self {
            limits,
            state: ConnectionState::Idle,
            epoch: 0,
            plan: None,
            handshake: Handshake::NotStarted,
            check_seq: 0,
            grace_seq: 0,
            grace_armed: false,
            pending_call: None,
            running_call: None,
            queued_calls: VecDeque::new(),
            listening: false,
        }
    }

    pub(crate) const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Bumped whenever a session starts or ends. Signals stamped with an older epoch
    /// belong to a dead transport.
    pub(crate) const fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) const fn handshake(&self) -> Handshake {
        self.handshake
    }

    pub(crate) const fn is_listening(&self) -> bool {
        self.listening
    }

    pub(crate) fn handle(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::Connect(plan) => self.on_connect(plan),
            Input::Negotiated => self.on_negotiated(),
            Input::Fail(err) => self.terminate(Some(err)),
            Input::ChannelOpened => self.on_channel_opened(),
            Input::ChannelClosed => self.on_channel_closed(),
            Input::ChannelChecked { seq, channel } => self.on_channel_checked(seq, channel),
            Input::Link(link) => self.on_link(link),
            Input::GraceExpired { seq } => self.on_grace_expired(seq),
            Input::Inbound(event) => self.on_inbound(event),
            Input::ToolFinished(result) => self.on_tool_finished(result),
            Input::Disconnect => self.on_disconnect(),
        }
    }

    /// Flip the listening flag, returning the event announcing the new value.
    pub(crate) fn toggle_listening(&mut self) -> Option<ClientEvent> {
        if self.state != ConnectionState::Open {
            return None;
        }
        self.listening = !self.listening;
        Some(ClientEvent::recording(self.listening))
    }

    /// Undo a toggle whose event never made it onto the channel. Ignored once the
    /// session that produced the toggle is gone.
    pub(crate) fn revert_listening(&mut self, epoch: u64) {
        if self.epoch == epoch && self.state == ConnectionState::Open {
            self.listening = !self.listening;
        }
    }

    const fn publish(&self, state: ConnectionState) -> Effect {
        Effect::Publish { state, epoch: self.epoch }
    }

    fn reset_session(&mut self) {
        self.epoch += 1;
        self.plan = None;
        self.handshake = Handshake::NotStarted;
        self.check_seq += 1;
        self.grace_seq += 1;
        self.grace_armed = false;
        self.pending_call = None;
        self.running_call = None;
        self.queued_calls.clear();
        self.listening = false;
    }

    fn on_connect(&mut self, plan: SessionPlan) -> Vec<Effect> {
        if !self.state.can_connect() {
            tracing::debug!(state = %self.state, "Ignoring connect while a session is active");
            return Vec::new();
        }
        self.reset_session();
        self.plan = Some(plan);
        self.state = ConnectionState::Connecting;
        vec![self.publish(ConnectionState::Connecting)]
    }

    fn on_negotiated(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.state = ConnectionState::Open;
        tracing::info!("Realtime session open");
        let mut effects = vec![self.publish(ConnectionState::Open)];
        if matches!(self.handshake, Handshake::NotStarted | Handshake::Abandoned) {
            effects.extend(self.start_handshake());
        }
        effects
    }

    fn terminate(&mut self, error: Option<Arc<Error>>) -> Vec<Effect> {
        let end = match self.state {
            ConnectionState::Connecting => ConnectionState::Failed,
            ConnectionState::Open => ConnectionState::Closed,
            _ => return Vec::new(),
        };
        self.reset_session();
        self.state = end;
        let mut effects = Vec::new();
        if let Some(err) = error {
            effects.push(Effect::ReportError(err));
        }
        if end == ConnectionState::Closed {
            effects.push(self.publish(ConnectionState::Closing));
        }
        effects.push(Effect::Teardown);
        effects.push(self.publish(end));
        effects
    }

    fn on_disconnect(&mut self) -> Vec<Effect> {
        if self.state == ConnectionState::Idle {
            return Vec::new();
        }
        let was_live = self.state.is_live();
        self.reset_session();
        self.state = ConnectionState::Idle;
        let mut effects = Vec::with_capacity(3);
        if was_live {
            effects.push(self.publish(ConnectionState::Closing));
        }
        effects.push(Effect::Teardown);
        effects.push(self.publish(ConnectionState::Idle));
        effects
    }

    fn start_handshake(&mut self) -> Vec<Effect> {
        self.handshake = Handshake::Pending { attempts: 0 };
        self.check_seq += 1;
        vec![Effect::CheckChannel {
            seq: self.check_seq,
            after: Duration::ZERO,
        }]
    }

    fn on_channel_opened(&mut self) -> Vec<Effect> {
        if !self.state.is_live() {
            return Vec::new();
        }
        match self.handshake {
            Handshake::NotStarted | Handshake::Abandoned => self.start_handshake(),
            Handshake::Pending { .. } => {
                // Supersede the scheduled retry with an immediate check.
                self.check_seq += 1;
                vec![Effect::CheckChannel {
                    seq: self.check_seq,
                    after: Duration::ZERO,
                }]
            }
            Handshake::Configured => Vec::new(),
        }
    }

    fn on_channel_closed(&mut self) -> Vec<Effect> {
        match self.state {
            ConnectionState::Connecting => {
                self.terminate(Some(Arc::new(Error::Transport("event channel closed".to_string()))))
            }
            ConnectionState::Open => {
                tracing::warn!("Event channel closed by remote");
                self.terminate(None)
            }
            _ => Vec::new(),
        }
    }

    fn on_channel_checked(&mut self, seq: u64, channel: ChannelState) -> Vec<Effect> {
        let Handshake::Pending { attempts } = self.handshake else {
            return Vec::new();
        };
        if seq != self.check_seq || !self.state.is_live() {
            return Vec::new();
        }

        let attempts = attempts + 1;
        if channel == ChannelState::Open {
            self.handshake = Handshake::Configured;
            tracing::info!(attempts, "Sending session configuration");
            return self.plan.as_ref().map(SessionPlan::configuration).unwrap_or_default();
        }
        if attempts >= self.limits.config_max_attempts {
            tracing::warn!(attempts, ?channel, "Event channel never opened; session left unconfigured");
            self.handshake = Handshake::Abandoned;
            return Vec::new();
        }

        tracing::debug!(attempts, ?channel, "Event channel not open yet, retrying configuration");
        self.handshake = Handshake::Pending { attempts };
        vec![Effect::CheckChannel {
            seq,
            after: self.limits.config_retry_interval,
        }]
    }

    fn on_link(&mut self, link: LinkState) -> Vec<Effect> {
        if !self.state.is_live() {
            return Vec::new();
        }
        match link {
            LinkState::Connected => {
                if self.grace_armed {
                    tracing::info!("Connection recovered");
                    self.grace_armed = false;
                    self.grace_seq += 1;
                }
                Vec::new()
            }
            LinkState::Disconnected => {
                if self.grace_armed {
                    return Vec::new();
                }
                tracing::warn!(grace = ?self.limits.disconnect_grace, "Connection interrupted, waiting for recovery");
                self.grace_armed = true;
                self.grace_seq += 1;
                vec![Effect::StartGrace {
                    seq: self.grace_seq,
                    after: self.limits.disconnect_grace,
                }]
            }
            LinkState::Failed => {
                self.terminate(Some(Arc::new(Error::Transport("peer connection failed".to_string()))))
            }
            LinkState::Closed => {
                let error = (self.state == ConnectionState::Connecting)
                    .then(|| Arc::new(Error::Transport("peer connection closed".to_string())));
                self.terminate(error)
            }
            LinkState::New | LinkState::Checking => Vec::new(),
        }
    }

    fn on_grace_expired(&mut self, seq: u64) -> Vec<Effect> {
        if !self.grace_armed || seq != self.grace_seq {
            return Vec::new();
        }
        self.grace_armed = false;
        let message = format!(
            "connection did not recover within {:?}",
            self.limits.disconnect_grace
        );
        self.terminate(Some(Arc::new(Error::Transport(message))))
    }

    fn on_inbound(&mut self, event: ServerEvent) -> Vec<Effect> {
        if !self.state.is_live() {
            return Vec::new();
        }
        if matches!(event, ServerEvent::Unknown(_)) && event.is_function_call_event() {
            tracing::debug!(kind = event.kind(), "Ignoring function call event");
            return Vec::new();
        }
        match event {
            ServerEvent::Ack { event_id } => {
                tracing::debug!(?event_id, "Ack");
                Vec::new()
            }
            ServerEvent::Error { error, .. } => {
                tracing::warn!("Remote error: {}", error.message);
                vec![Effect::ReportError(Arc::new(Error::Api(error)))]
            }
            ServerEvent::FunctionCall { call_id, name } => {
                let next = FunctionCallAccumulator::new(call_id, name);
                if let Some(stale) = self.pending_call.replace(next) {
                    tracing::warn!(
                        call_id = %stale.call_id,
                        tool = %stale.name,
                        "Discarding unfinished function call"
                    );
                }
                Vec::new()
            }
            ServerEvent::FunctionCallArguments { call_id, delta } => {
                match self.pending_call.as_mut() {
                    Some(call) if call_id.as_deref().is_none_or(|id| id == call.call_id) => {
                        call.push(&delta);
                    }
                    Some(call) => {
                        tracing::warn!(expected = %call.call_id, got = ?call_id, "Dropping argument fragment for another call");
                    }
                    None => tracing::debug!("Dropping argument fragment with no pending call"),
                }
                Vec::new()
            }
            ServerEvent::FunctionCallArgumentsDone { call_id, arguments } => {
                self.finish_call(call_id.as_deref(), arguments)
            }
            ServerEvent::Unknown(value) => vec![Effect::Forward(value)],
        }
    }

    fn finish_call(&mut self, call_id: Option<&str>, inline: Option<String>) -> Vec<Effect> {
        let Some(call) = self.pending_call.take() else {
            tracing::debug!("Arguments completed with no pending call");
            return Vec::new();
        };
        if call_id.is_some_and(|id| id != call.call_id) {
            tracing::warn!(expected = %call.call_id, got = ?call_id, "Discarding function call with mismatched id");
            return Vec::new();
        }

        let raw = if call.fragments > 0 {
            call.arguments
        } else {
            inline.unwrap_or_default()
        };
        let arguments = match parse_arguments(&raw) {
            Ok(arguments) => arguments,
            Err(err) => {
                tracing::warn!(tool = %call.name, "Discarding function call with malformed arguments: {err}");
                return Vec::new();
            }
        };

        let known = self.plan.as_ref().is_some_and(|plan| plan.tools.contains(&call.name));
        if !known {
            tracing::warn!(tool = %call.name, "Remote requested an unregistered tool");
            return Vec::new();
        }

        self.dispatch(ToolCall {
            name: call.name,
            call_id: call.call_id,
            arguments,
        })
    }

    /// Tools run one at a time, in the order their arguments completed.
    fn dispatch(&mut self, call: ToolCall) -> Vec<Effect> {
        if let Some(running) = &self.running_call {
            tracing::debug!(call_id = %call.call_id, %running, "Queuing function call behind the running one");
            self.queued_calls.push_back(call);
            return Vec::new();
        }
        self.running_call = Some(call.call_id.clone());
        vec![Effect::Dispatch(call)]
    }

    fn on_tool_finished(&mut self, result: Result<ToolResult>) -> Vec<Effect> {
        self.running_call = None;
        let mut effects = self.tool_output(result);
        if self.state.is_live() {
            if let Some(next) = self.queued_calls.pop_front() {
                effects.extend(self.dispatch(next));
            }
        }
        effects
    }

    fn tool_output(&self, result: Result<ToolResult>) -> Vec<Effect> {
        match result {
            Ok(result) if self.state.is_live() => vec![
                Effect::Send(ClientEvent::function_call_output(result.call_id, result.output.to_string())),
                Effect::Send(ClientEvent::ResponseCreate),
            ],
            Ok(result) => {
                tracing::debug!(call_id = %result.call_id, "Dropping tool result for a closed session");
                Vec::new()
            }
            Err(err) => {
                tracing::warn!("Tool execution failed: {err}");
                Vec::new()
            }
        }
    }
}

fn parse_arguments(raw: &str) -> serde_json::Result<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::builder::HistoryEntry;
    use crate::sdk::tools::ToolRegistry;
    use serde_json::json;

    fn limits() -> Limits {
        Limits::from(&ManagerOptions::default())
    }

    fn plan_with(config: &ConnectConfig) -> SessionPlan {
        SessionPlan::new(config, 20)
    }

    fn echo_config() -> ConnectConfig {
        let mut tools = ToolRegistry::new();
        tools.tool("echo", |args: Value| async move { Ok(args) });
        ConnectConfig::builder()
            .voice("verse")
            .instructions("Be brief.")
            .history([HistoryEntry::user("hi"), HistoryEntry::assistant("hello"), HistoryEntry::user("again")])
            .tools(tools)
            .build()
    }

    fn check_seq(effects: &[Effect]) -> Option<(u64, Duration)> {
        effects.iter().find_map(|effect| match effect {
            Effect::CheckChannel { seq, after } => Some((*seq, *after)),
            _ => None,
        })
    }

    fn sent(effects: &[Effect]) -> Vec<&ClientEvent> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Send(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn open(machine: &mut Machine, config: &ConnectConfig) -> u64 {
        machine.handle(Input::Connect(plan_with(config)));
        let effects = machine.handle(Input::Negotiated);
        assert!(effects.iter().any(|e| matches!(e, Effect::Publish { state: ConnectionState::Open, .. })));
        check_seq(&effects).expect("handshake scheduled").0
    }

    fn configured(config: &ConnectConfig) -> Machine {
        let mut machine = Machine::new(limits());
        let seq = open(&mut machine, config);
        machine.handle(Input::ChannelChecked { seq, channel: ChannelState::Open });
        machine
    }

    fn stream(machine: &mut Machine, events: Vec<ServerEvent>) -> Vec<Effect> {
        events.into_iter().flat_map(|evt| machine.handle(Input::Inbound(evt))).collect()
    }

    #[test]
    fn connect_is_ignored_while_active() {
        let config = echo_config();
        let mut machine = Machine::new(limits());
        let first = machine.handle(Input::Connect(plan_with(&config)));
        assert!(matches!(first.as_slice(), [Effect::Publish { state: ConnectionState::Connecting, .. }]));
        let epoch = machine.epoch();

        assert!(machine.handle(Input::Connect(plan_with(&config))).is_empty());
        machine.handle(Input::Negotiated);
        assert!(machine.handle(Input::Connect(plan_with(&config))).is_empty());
        assert_eq!(machine.epoch(), epoch);
    }

    #[test]
    fn configuration_waits_for_open_channel() {
        let config = echo_config();
        let mut machine = Machine::new(limits());
        let seq = open(&mut machine, &config);

        let mut all = Vec::new();
        for channel in [ChannelState::Connecting, ChannelState::Connecting, ChannelState::Open] {
            let effects = machine.handle(Input::ChannelChecked { seq, channel });
            if channel != ChannelState::Open {
                assert_eq!(check_seq(&effects), Some((seq, Duration::from_millis(500))));
                assert!(sent(&effects).is_empty());
            }
            all.extend(effects);
        }

        let kinds: Vec<_> = sent(&all).iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            ["session.update", "conversation.item.create", "conversation.item.create", "conversation.item.create"]
        );
        assert_eq!(machine.handshake(), Handshake::Configured);

        // Late ticks are ignored once configured.
        let late = machine.handle(Input::ChannelChecked { seq, channel: ChannelState::Open });
        assert!(late.is_empty());
    }

    #[test]
    fn configuration_order_is_settings_instructions_history() {
        let config = echo_config();
        let mut machine = Machine::new(limits());
        let seq = open(&mut machine, &config);
        let effects = machine.handle(Input::ChannelChecked { seq, channel: ChannelState::Open });
        let events = sent(&effects);

        let ClientEvent::SessionUpdate { session } = events[0] else {
            panic!("expected session.update first, got {:?}", events[0]);
        };
        assert_eq!(session.voice.as_str(), "verse");
        assert_eq!(session.tools.len(), 1);
        assert_eq!(*events[1], ClientEvent::create_item(Item::system_text("Be brief.")));
        assert_eq!(*events[2], ClientEvent::create_item(Item::user_text("hi")));
        assert_eq!(*events[3], ClientEvent::create_item(Item::user_text("again")));
    }

    #[test]
    fn configuration_gives_up_quietly_and_restarts_on_open() {
        let config = echo_config();
        let mut machine = Machine::new(limits());
        let seq = open(&mut machine, &config);

        for attempt in 1..=10 {
            let effects = machine.handle(Input::ChannelChecked { seq, channel: ChannelState::Connecting });
            assert!(!effects.iter().any(|e| matches!(e, Effect::ReportError(_) | Effect::Teardown)));
            if attempt == 10 {
                assert!(effects.is_empty());
            }
        }
        assert_eq!(machine.handshake(), Handshake::Abandoned);
        assert_eq!(machine.state(), ConnectionState::Open);

        let effects = machine.handle(Input::ChannelOpened);
        let (fresh, after) = check_seq(&effects).unwrap();
        assert_eq!(after, Duration::ZERO);
        assert_eq!(machine.handshake(), Handshake::Pending { attempts: 0 });
        let effects = machine.handle(Input::ChannelChecked { seq: fresh, channel: ChannelState::Open });
        assert_eq!(sent(&effects).len(), 4);
    }

    #[test]
    fn channel_open_supersedes_scheduled_retry() {
        let config = echo_config();
        let mut machine = Machine::new(limits());
        let seq = open(&mut machine, &config);
        machine.handle(Input::ChannelChecked { seq, channel: ChannelState::Connecting });

        let (fresh, _) = check_seq(&machine.handle(Input::ChannelOpened)).unwrap();
        assert_ne!(fresh, seq);
        assert!(machine.handle(Input::ChannelChecked { seq, channel: ChannelState::Open }).is_empty());
        assert_eq!(sent(&machine.handle(Input::ChannelChecked { seq: fresh, channel: ChannelState::Open })).len(), 4);
    }

    #[test]
    fn history_keeps_last_user_turns_in_order() {
        let mut history = Vec::new();
        for i in 0..30 {
            history.push(HistoryEntry::user(format!("u{i}")));
            history.push(HistoryEntry::assistant(format!("a{i}")));
        }
        let config = ConnectConfig::builder().history(history).build();
        let plan = SessionPlan::new(&config, 20);
        let expected: Vec<String> = (10..30).map(|i| format!("u{i}")).collect();
        assert_eq!(plan.history, expected);
        assert!(plan.instructions.is_none());
        assert_eq!(plan.configuration().len(), 21);
    }

    #[test]
    fn fragments_are_concatenated_before_parsing() {
        let mut machine = configured(&echo_config());
        let effects = stream(
            &mut machine,
            vec![
                ServerEvent::FunctionCall { call_id: "c1".into(), name: "echo".into() },
                ServerEvent::FunctionCallArguments { call_id: None, delta: "{\"".into() },
                ServerEvent::FunctionCallArguments { call_id: None, delta: "x".into() },
                ServerEvent::FunctionCallArguments { call_id: Some("c1".into()), delta: "\":1}".into() },
                ServerEvent::FunctionCallArgumentsDone { call_id: Some("c1".into()), arguments: None },
            ],
        );
        let calls: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Dispatch(call) => Some(call),
                _ => None,
            })
            .collect();
        assert_eq!(
            calls,
            [&ToolCall { name: "echo".into(), call_id: "c1".into(), arguments: json!({"x": 1}) }]
        );
        assert!(machine.pending_call.is_none());
    }

    #[test]
    fn empty_arguments_become_empty_object() {
        let mut machine = configured(&echo_config());
        let effects = stream(
            &mut machine,
            vec![
                ServerEvent::FunctionCall { call_id: "c1".into(), name: "echo".into() },
                ServerEvent::FunctionCallArgumentsDone { call_id: None, arguments: None },
            ],
        );
        assert!(matches!(effects.as_slice(), [Effect::Dispatch(call)] if call.arguments == json!({})));
    }

    #[test]
    fn inline_arguments_used_without_fragments() {
        let mut machine = configured(&echo_config());
        let effects = stream(
            &mut machine,
            vec![
                ServerEvent::FunctionCall { call_id: "c1".into(), name: "echo".into() },
                ServerEvent::FunctionCallArgumentsDone {
                    call_id: Some("c1".into()),
                    arguments: Some(r#"{"city":"Oslo"}"#.into()),
                },
            ],
        );
        assert!(matches!(effects.as_slice(), [Effect::Dispatch(call)] if call.arguments == json!({"city": "Oslo"})));
    }

    #[test]
    fn unknown_tool_is_discarded() {
        let mut machine = configured(&echo_config());
        let effects = stream(
            &mut machine,
            vec![
                ServerEvent::FunctionCall { call_id: "c9".into(), name: "launch".into() },
                ServerEvent::FunctionCallArguments { call_id: None, delta: "{}".into() },
                ServerEvent::FunctionCallArgumentsDone { call_id: None, arguments: None },
            ],
        );
        assert!(effects.is_empty());
        assert!(machine.pending_call.is_none());
        assert_eq!(machine.state(), ConnectionState::Open);
    }

    #[test]
    fn malformed_arguments_are_discarded() {
        let mut machine = configured(&echo_config());
        let effects = stream(
            &mut machine,
            vec![
                ServerEvent::FunctionCall { call_id: "c1".into(), name: "echo".into() },
                ServerEvent::FunctionCallArguments { call_id: None, delta: "{\"x\":".into() },
                ServerEvent::FunctionCallArgumentsDone { call_id: None, arguments: None },
            ],
        );
        assert!(effects.is_empty());
        assert!(machine.pending_call.is_none());
    }

    #[test]
    fn new_call_replaces_unfinished_one() {
        let mut machine = configured(&echo_config());
        let effects = stream(
            &mut machine,
            vec![
                ServerEvent::FunctionCall { call_id: "old".into(), name: "echo".into() },
                ServerEvent::FunctionCallArguments { call_id: None, delta: "{\"stale\"".into() },
                ServerEvent::FunctionCall { call_id: "new".into(), name: "echo".into() },
                ServerEvent::FunctionCallArguments { call_id: None, delta: "{}".into() },
                ServerEvent::FunctionCallArgumentsDone { call_id: Some("new".into()), arguments: None },
            ],
        );
        assert!(matches!(effects.as_slice(), [Effect::Dispatch(call)] if call.call_id == "new"));
    }

    #[test]
    fn tool_result_is_returned_then_response_requested() {
        let mut machine = configured(&echo_config());
        let effects = machine.handle(Input::ToolFinished(Ok(ToolResult {
            call_id: "c1".into(),
            output: json!({"ok": true}),
        })));
        let events = sent(&effects);
        assert_eq!(*events[0], ClientEvent::function_call_output("c1", r#"{"ok":true}"#));
        assert_eq!(*events[1], ClientEvent::ResponseCreate);

        let failed = machine.handle(Input::ToolFinished(Err(Error::ToolExecution {
            tool: "echo".into(),
            message: "boom".into(),
        })));
        assert!(failed.is_empty());
        assert_eq!(machine.state(), ConnectionState::Open);
    }

    #[test]
    fn other_events_are_forwarded_verbatim() {
        let mut machine = configured(&echo_config());
        let raw = json!({"type": "transcript", "text": "hi"});
        let effects = stream(
            &mut machine,
            vec![
                ServerEvent::Unknown(raw.clone()),
                ServerEvent::Unknown(json!({"type": "response.function_call_output.done"})),
                ServerEvent::Ack { event_id: None },
            ],
        );
        assert!(matches!(effects.as_slice(), [Effect::Forward(value)] if *value == raw));
    }

    #[test]
    fn remote_error_keeps_session_open() {
        let mut machine = configured(&echo_config());
        let evt = ServerEvent::parse(r#"{"type":"error","message":"bad"}"#).unwrap();
        let effects = machine.handle(Input::Inbound(evt));
        assert!(matches!(effects.as_slice(), [Effect::ReportError(err)] if matches!(**err, Error::Api(_))));
        assert_eq!(machine.state(), ConnectionState::Open);
    }

    #[test]
    fn toggle_alternates_only_when_open() {
        let mut machine = Machine::new(limits());
        assert!(machine.toggle_listening().is_none());

        let mut machine = configured(&echo_config());
        assert_eq!(machine.toggle_listening(), Some(ClientEvent::AudioStartRecording));
        assert_eq!(machine.toggle_listening(), Some(ClientEvent::AudioStopRecording));
        assert_eq!(machine.toggle_listening(), Some(ClientEvent::AudioStartRecording));
        assert!(machine.is_listening());

        machine.handle(Input::Disconnect);
        assert!(!machine.is_listening());
        assert!(machine.toggle_listening().is_none());
    }

    #[test]
    fn failed_toggle_is_not_undone_after_disconnect() {
        let mut machine = configured(&echo_config());
        let epoch = machine.epoch();
        machine.toggle_listening();
        machine.revert_listening(epoch);
        assert!(!machine.is_listening());

        machine.toggle_listening();
        machine.handle(Input::Disconnect);
        machine.revert_listening(epoch);
        assert!(!machine.is_listening());
    }

    fn call(call_id: &str, name: &str) -> Vec<ServerEvent> {
        vec![
            ServerEvent::FunctionCall { call_id: call_id.into(), name: name.into() },
            ServerEvent::FunctionCallArgumentsDone { call_id: Some(call_id.into()), arguments: Some("{}".into()) },
        ]
    }

    fn dispatched(effects: &[Effect]) -> Vec<&str> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Dispatch(call) => Some(call.call_id.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn tool_calls_run_one_at_a_time() {
        let mut machine = configured(&echo_config());
        assert_eq!(dispatched(&stream(&mut machine, call("c1", "echo"))), ["c1"]);
        assert!(stream(&mut machine, call("c2", "echo")).is_empty());
        assert!(stream(&mut machine, call("c3", "echo")).is_empty());

        let effects = machine.handle(Input::ToolFinished(Ok(ToolResult { call_id: "c1".into(), output: json!({}) })));
        assert!(matches!(
            effects.as_slice(),
            [Effect::Send(ClientEvent::ConversationItemCreate { .. }), Effect::Send(ClientEvent::ResponseCreate), Effect::Dispatch(next)]
                if next.call_id == "c2"
        ));

        // A failed tool still releases the next one.
        let effects = machine.handle(Input::ToolFinished(Err(Error::ToolExecution {
            tool: "echo".into(),
            message: "boom".into(),
        })));
        assert_eq!(dispatched(&effects), ["c3"]);
        machine.handle(Input::ToolFinished(Ok(ToolResult { call_id: "c3".into(), output: json!({}) })));
        assert_eq!(dispatched(&stream(&mut machine, call("c4", "echo"))), ["c4"]);
    }

    #[test]
    fn queued_calls_die_with_the_session() {
        let mut machine = configured(&echo_config());
        stream(&mut machine, call("c1", "echo"));
        stream(&mut machine, call("c2", "echo"));
        machine.handle(Input::Disconnect);

        let seq = open(&mut machine, &echo_config());
        machine.handle(Input::ChannelChecked { seq, channel: ChannelState::Open });
        assert_eq!(dispatched(&stream(&mut machine, call("c3", "echo"))), ["c3"]);
    }

    #[test]
    fn publishes_are_stamped_with_the_new_epoch() {
        let mut machine = Machine::new(limits());
        let effects = machine.handle(Input::Connect(plan_with(&echo_config())));
        let connecting = machine.epoch();
        assert!(matches!(effects.as_slice(), [Effect::Publish { epoch, .. }] if *epoch == connecting));

        let effects = machine.handle(Input::Disconnect);
        assert_ne!(machine.epoch(), connecting);
        assert!(effects.iter().all(|e| match e {
            Effect::Publish { epoch, .. } => *epoch == machine.epoch(),
            _ => true,
        }));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut machine = configured(&echo_config());
        let effects = machine.handle(Input::Disconnect);
        assert!(matches!(
            effects.as_slice(),
            [
                Effect::Publish { state: ConnectionState::Closing, .. },
                Effect::Teardown,
                Effect::Publish { state: ConnectionState::Idle, .. }
            ]
        ));
        assert!(machine.handle(Input::Disconnect).is_empty());
        assert!(Machine::new(limits()).handle(Input::Disconnect).is_empty());
    }

    #[test]
    fn grace_window_recovers_or_closes() {
        let mut machine = configured(&echo_config());
        let effects = machine.handle(Input::Link(LinkState::Disconnected));
        let [Effect::StartGrace { seq, after }] = effects.as_slice() else {
            panic!("expected a grace timer, got {effects:?}");
        };
        assert_eq!(*after, Duration::from_secs(5));
        let first = *seq;

        // Recovery disarms the timer.
        machine.handle(Input::Link(LinkState::Connected));
        assert!(machine.handle(Input::GraceExpired { seq: first }).is_empty());
        assert_eq!(machine.state(), ConnectionState::Open);

        let effects = machine.handle(Input::Link(LinkState::Disconnected));
        let [Effect::StartGrace { seq: second, .. }] = effects.as_slice() else {
            panic!("expected a grace timer, got {effects:?}");
        };
        let effects = machine.handle(Input::GraceExpired { seq: *second });
        assert!(effects.iter().any(|e| matches!(e, Effect::Teardown)));
        assert!(effects.iter().any(|e| matches!(e, Effect::ReportError(_))));
        assert_eq!(machine.state(), ConnectionState::Closed);
    }

    #[test]
    fn failure_while_connecting_ends_failed() {
        let mut machine = Machine::new(limits());
        machine.handle(Input::Connect(plan_with(&echo_config())));
        let effects = machine.handle(Input::Link(LinkState::Failed));
        assert!(matches!(
            effects.as_slice(),
            [Effect::ReportError(_), Effect::Teardown, Effect::Publish { state: ConnectionState::Failed, .. }]
        ));
        assert!(machine.state().can_connect());
        assert!(machine.handle(Input::Link(LinkState::Closed)).is_empty());
    }

    #[test]
    fn remote_close_after_open_ends_closed() {
        let mut machine = configured(&echo_config());
        let effects = machine.handle(Input::Link(LinkState::Closed));
        assert!(matches!(
            effects.as_slice(),
            [
                Effect::Publish { state: ConnectionState::Closing, .. },
                Effect::Teardown,
                Effect::Publish { state: ConnectionState::Closed, .. }
            ]
        ));
    }
}
