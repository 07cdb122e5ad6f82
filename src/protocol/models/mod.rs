pub mod common;
pub mod items;
pub mod session;
pub mod tools;

pub use common::{DEFAULT_MODEL, DEFAULT_VOICE, JsonSchema, Modality, Role, Voice};
pub use items::{ChatMessage, ContentPart, Item};
pub use session::{AudioEncoding, SessionSettings, TurnDetection};
pub use tools::{Tool, ToolChoice};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_settings_always_carry_mandatory_fields() {
        let value = serde_json::to_value(SessionSettings::new("verse")).unwrap();
        assert_eq!(value["modalities"], json!(["text", "audio"]));
        assert_eq!(value["voice"], "verse");
        assert_eq!(value["input_audio_format"], "pcm16");
        assert_eq!(value["output_audio_format"], "pcm16");
        assert!(value.get("tools").is_none());
        assert!(value.get("tool_choice").is_none());
    }

    #[test]
    fn tools_enable_auto_tool_choice() {
        let tool = Tool::Function {
            name: "clock".to_string(),
            description: None,
            parameters: json!({"type": "object"}),
        };
        let value = serde_json::to_value(SessionSettings::new("alloy").with_tools(vec![tool])).unwrap();
        assert_eq!(value["tool_choice"], "auto");
        assert_eq!(value["tools"][0]["type"], "function");
        assert_eq!(value["tools"][0]["name"], "clock");
    }
}
