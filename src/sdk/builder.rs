use crate::protocol::models::{DEFAULT_MODEL, Role, Voice};
use crate::transport::CredentialRequest;
use std::sync::Arc;
use std::time::Duration;

use super::ToolRegistry;

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(250);
pub const DEFAULT_CONFIG_RETRY_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_CONFIG_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_HISTORY_LIMIT: usize = 20;
pub const DEFAULT_CREDENTIAL_REFRESH_MARGIN: Duration = Duration::from_secs(30);
pub const DEFAULT_CHANNEL_LABEL: &str = "oai-events";

/// One prior conversation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
}

impl HistoryEntry {
    #[must_use]
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self { role, text: text.into() }
    }

    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }
}

/// Everything one `connect()` needs.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub model: String,
    pub voice: Voice,
    pub instructions: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub tools: Arc<ToolRegistry>,
}

impl ConnectConfig {
    #[must_use]
    pub fn builder() -> ConnectConfigBuilder {
        ConnectConfigBuilder::new()
    }

    pub(crate) fn credential_request(&self) -> CredentialRequest {
        CredentialRequest {
            model: self.model.clone(),
            voice: self.voice.to_string(),
            instructions: self.instructions.clone(),
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        ConnectConfigBuilder::new().build()
    }
}

#[derive(Debug, Default)]
pub struct ConnectConfigBuilder {
    model: Option<String>,
    voice: Option<Voice>,
    instructions: Option<String>,
    history: Vec<HistoryEntry>,
    tools: ToolRegistry,
}

impl ConnectConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn voice(mut self, voice: impl Into<Voice>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    /// Blank instructions are treated as absent.
    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        let instructions = instructions.into();
        self.instructions = (!instructions.trim().is_empty()).then_some(instructions);
        self
    }

    #[must_use]
    pub fn history(mut self, history: impl IntoIterator<Item = HistoryEntry>) -> Self {
        self.history.extend(history);
        self
    }

    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn build(self) -> ConnectConfig {
        ConnectConfig {
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            voice: self.voice.unwrap_or_default(),
            instructions: self.instructions,
            history: self.history,
            tools: Arc::new(self.tools),
        }
    }
}

/// Timing and limits for the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Pause after releasing a previous transport before building a new one.
    pub settle_delay: Duration,
    pub config_retry_interval: Duration,
    pub config_max_attempts: u32,
    /// How long a `disconnected` link may take to recover before teardown.
    pub disconnect_grace: Duration,
    /// Most recent user history entries replayed after configuration.
    pub history_limit: usize,
    /// Refetch credentials this long before they expire.
    pub credential_refresh_margin: Duration,
    pub channel_label: String,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            config_retry_interval: DEFAULT_CONFIG_RETRY_INTERVAL,
            config_max_attempts: DEFAULT_CONFIG_MAX_ATTEMPTS,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            history_limit: DEFAULT_HISTORY_LIMIT,
            credential_refresh_margin: DEFAULT_CREDENTIAL_REFRESH_MARGIN,
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
        }
    }
}

impl ManagerOptions {
    #[must_use]
    pub const fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    #[must_use]
    pub const fn config_retry(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.config_retry_interval = interval;
        self.config_max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    #[must_use]
    pub const fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    #[must_use]
    pub const fn credential_refresh_margin(mut self, margin: Duration) -> Self {
        self.credential_refresh_margin = margin;
        self
    }

    #[must_use]
    pub fn channel_label(mut self, label: impl Into<String>) -> Self {
        self.channel_label = label.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let config = ConnectConfig::builder().build();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.voice, Voice::default());
        assert!(config.instructions.is_none());
        assert!(config.tools.is_empty());
    }

    #[test]
    fn blank_instructions_are_dropped() {
        let config = ConnectConfig::builder().instructions("   ").build();
        assert!(config.instructions.is_none());
    }

    #[test]
    fn credential_request_mirrors_config() {
        let config = ConnectConfig::builder()
            .model("gpt-realtime")
            .voice("verse")
            .instructions("Be brief.")
            .build();
        let req = config.credential_request();
        assert_eq!(req.model, "gpt-realtime");
        assert_eq!(req.voice, "verse");
        assert_eq!(req.instructions.as_deref(), Some("Be brief."));
    }
}
