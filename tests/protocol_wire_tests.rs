use floyd_realtime::protocol::models::{Item, SessionSettings, Tool};
use floyd_realtime::{ClientEvent, ServerEvent};
use serde_json::{Value, json};

fn wire(event: &ClientEvent) -> Value {
    serde_json::from_str(&serde_json::to_string(event).unwrap()).unwrap()
}

#[test]
fn user_message_wire_shape() {
    assert_eq!(
        wire(&ClientEvent::user_message("hello")),
        json!({"type": "message", "message": {"role": "user", "content": "hello"}})
    );
}

#[test]
fn session_update_carries_every_mandatory_field() {
    let tool = Tool::Function {
        name: "get_time".to_string(),
        description: Some("Current time".to_string()),
        parameters: json!({"type": "object", "properties": {}}),
    };
    let value = wire(&ClientEvent::session_update(SessionSettings::new("verse").with_tools(vec![tool])));

    assert_eq!(value["type"], "session.update");
    let session = &value["session"];
    assert_eq!(session["modalities"], json!(["text", "audio"]));
    assert_eq!(session["voice"], "verse");
    assert_eq!(session["input_audio_format"], "pcm16");
    assert_eq!(session["output_audio_format"], "pcm16");
    assert_eq!(session["turn_detection"], json!({"type": "server_vad"}));
    assert_eq!(session["tools"][0]["description"], "Current time");
    assert_eq!(session["tool_choice"], "auto");
}

#[test]
fn conversation_items() {
    assert_eq!(
        wire(&ClientEvent::create_item(Item::system_text("Be brief."))),
        json!({
            "type": "conversation.item.create",
            "item": {"type": "message", "role": "system", "content": [{"type": "input_text", "text": "Be brief."}]}
        })
    );
    assert_eq!(
        wire(&ClientEvent::function_call_output("call_1", r#"{"ok":true}"#)),
        json!({
            "type": "conversation.item.create",
            "item": {"type": "function_call_output", "call_id": "call_1", "output": "{\"ok\":true}"}
        })
    );
}

#[test]
fn control_events() {
    assert_eq!(wire(&ClientEvent::ResponseCreate), json!({"type": "response.create"}));
    assert_eq!(wire(&ClientEvent::recording(true)), json!({"type": "audio_start_recording"}));
    assert_eq!(wire(&ClientEvent::recording(false)), json!({"type": "audio_stop_recording"}));
}

#[test]
fn inbound_function_call_stream() {
    let start = ServerEvent::parse(r#"{"type":"response.function_call","call_id":"c1","name":"get_time"}"#).unwrap();
    assert_eq!(start, ServerEvent::FunctionCall { call_id: "c1".into(), name: "get_time".into() });

    let delta = ServerEvent::parse(r#"{"type":"response.function_call_arguments","delta":"{\"tz\""}"#).unwrap();
    assert_eq!(delta, ServerEvent::FunctionCallArguments { call_id: None, delta: "{\"tz\"".into() });

    let done = ServerEvent::parse(
        r#"{"type":"response.function_call_arguments.done","call_id":"c1","arguments":"{\"tz\":\"UTC\"}"}"#,
    )
    .unwrap();
    assert_eq!(
        done,
        ServerEvent::FunctionCallArgumentsDone { call_id: Some("c1".into()), arguments: Some("{\"tz\":\"UTC\"}".into()) }
    );
    assert!(done.is_function_call_event());
}

#[test]
fn inbound_error_and_ack() {
    let err = ServerEvent::parse(
        r#"{"type":"error","event_id":"e1","error":{"type":"invalid_request_error","code":"bad","message":"nope"}}"#,
    )
    .unwrap();
    let ServerEvent::Error { event_id, error } = err else {
        panic!("expected error event");
    };
    assert_eq!(event_id.as_deref(), Some("e1"));
    assert_eq!(error.code.as_deref(), Some("bad"));
    assert_eq!(error.message, "nope");

    assert_eq!(ServerEvent::parse(r#"{"type":"ack"}"#).unwrap(), ServerEvent::Ack { event_id: None });
}

#[test]
fn unrecognised_events_pass_through_untouched() {
    for raw in [
        json!({"type": "message", "message": {"role": "assistant", "content": "hi"}}),
        json!({"type": "transcript", "text": "hello", "final": false}),
        json!({"type": "response.audio.delta", "delta": "AAAA"}),
    ] {
        let event = ServerEvent::parse(&raw.to_string()).unwrap();
        assert_eq!(event, ServerEvent::Unknown(raw));
    }
}
