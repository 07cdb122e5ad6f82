use serde::{Deserialize, Serialize};

use super::models::{ChatMessage, Item, Role, SessionSettings};

/// Messages the client writes to the event channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: Box<SessionSettings> },
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: Box<Item> },
    #[serde(rename = "response.create")]
    ResponseCreate,
    #[serde(rename = "audio_start_recording")]
    AudioStartRecording,
    #[serde(rename = "audio_stop_recording")]
    AudioStopRecording,
    #[serde(rename = "message")]
    Message { message: ChatMessage },
}

impl ClientEvent {
    #[must_use]
    pub fn session_update(settings: SessionSettings) -> Self {
        Self::SessionUpdate { session: Box::new(settings) }
    }

    #[must_use]
    pub fn create_item(item: Item) -> Self {
        Self::ConversationItemCreate { item: Box::new(item) }
    }

    #[must_use]
    pub fn user_message(text: impl Into<String>) -> Self {
        Self::Message {
            message: ChatMessage { role: Role::User, content: text.into() },
        }
    }

    #[must_use]
    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::create_item(Item::FunctionCallOutput {
            call_id: call_id.into(),
            output: output.into(),
        })
    }

    #[must_use]
    pub const fn recording(start: bool) -> Self {
        if start { Self::AudioStartRecording } else { Self::AudioStopRecording }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::ConversationItemCreate { .. } => "conversation.item.create",
            Self::ResponseCreate => "response.create",
            Self::AudioStartRecording => "audio_start_recording",
            Self::AudioStopRecording => "audio_stop_recording",
            Self::Message { .. } => "message",
        }
    }
}
