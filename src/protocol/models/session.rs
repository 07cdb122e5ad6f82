use serde::{Deserialize, Serialize};

use super::{Modality, Tool, ToolChoice, Voice};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    #[default]
    Pcm16,
    G711Ulaw,
    G711Alaw,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetection {
    ServerVad {
        #[serde(skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
    },
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self::ServerVad {
            threshold: None,
            prefix_padding_ms: None,
            silence_duration_ms: None,
        }
    }
}

/// Body of `session.update`.
///
/// The remote endpoint drops the channel when it receives a partial configuration, so
/// modalities, voice and both audio encodings are not optional here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    pub modalities: Vec<Modality>,
    pub voice: Voice,
    pub input_audio_format: AudioEncoding,
    pub output_audio_format: AudioEncoding,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

impl SessionSettings {
    #[must_use]
    pub fn new(voice: impl Into<Voice>) -> Self {
        Self {
            modalities: vec![Modality::Text, Modality::Audio],
            voice: voice.into(),
            input_audio_format: AudioEncoding::Pcm16,
            output_audio_format: AudioEncoding::Pcm16,
            turn_detection: Some(TurnDetection::default()),
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    /// Attach tool schemas; `tool_choice` is only declared when there is something to choose.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tool_choice = (!tools.is_empty()).then_some(ToolChoice::Auto);
        self.tools = tools;
        self
    }
}
