use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::{ApiErrorType, ServerError};

pub const FUNCTION_CALL_PREFIX: &str = "response.function_call";

/// Messages read from the event channel.
///
/// Only the kinds the session reacts to are typed. Everything else, including
/// `message` and `transcript`, lands in [`ServerEvent::Unknown`] untouched so it can be
/// forwarded verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Ack {
        event_id: Option<String>,
    },
    Error {
        event_id: Option<String>,
        error: ServerError,
    },
    FunctionCall {
        call_id: String,
        name: String,
    },
    FunctionCallArguments {
        call_id: Option<String>,
        delta: String,
    },
    FunctionCallArgumentsDone {
        call_id: Option<String>,
        arguments: Option<String>,
    },
    Unknown(Value),
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ServerEventRepr {
    #[serde(rename = "ack")]
    Ack {
        #[serde(default)]
        event_id: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        event_id: Option<String>,
        #[serde(default)]
        error: Option<ServerError>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "response.function_call")]
    FunctionCall { call_id: String, name: String },
    #[serde(
        rename = "response.function_call_arguments",
        alias = "response.function_call_arguments.delta"
    )]
    FunctionCallArguments {
        #[serde(default)]
        call_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        arguments: Option<String>,
    },
}

impl From<ServerEventRepr> for ServerEvent {
    fn from(repr: ServerEventRepr) -> Self {
        match repr {
            ServerEventRepr::Ack { event_id } => Self::Ack { event_id },
            ServerEventRepr::Error { event_id, error, message } => {
                let error = error.unwrap_or_else(|| ServerError {
                    error_type: ApiErrorType::Unknown,
                    code: None,
                    message: message.unwrap_or_default(),
                    param: None,
                    event_id: None,
                });
                Self::Error { event_id, error }
            }
            ServerEventRepr::FunctionCall { call_id, name } => Self::FunctionCall { call_id, name },
            ServerEventRepr::FunctionCallArguments { call_id, delta } => {
                Self::FunctionCallArguments { call_id, delta }
            }
            ServerEventRepr::FunctionCallArgumentsDone { call_id, arguments } => {
                Self::FunctionCallArgumentsDone { call_id, arguments }
            }
        }
    }
}

impl<'de> Deserialize<'de> for ServerEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match ServerEventRepr::deserialize(value.clone()) {
            Ok(repr) => Ok(repr.into()),
            Err(err) => {
                tracing::trace!("Passing through untyped server event: {err}");
                Ok(Self::Unknown(value))
            }
        }
    }
}

impl ServerEvent {
    /// Parse one text frame from the event channel.
    ///
    /// # Errors
    /// Returns an error if the frame is not JSON.
    #[allow(clippy::result_large_err)]
    pub fn parse(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// The wire `type` of the event, or `""` when an untyped payload has none.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Ack { .. } => "ack",
            Self::Error { .. } => "error",
            Self::FunctionCall { .. } => FUNCTION_CALL_PREFIX,
            Self::FunctionCallArguments { .. } => "response.function_call_arguments",
            Self::FunctionCallArgumentsDone { .. } => "response.function_call_arguments.done",
            Self::Unknown(value) => value.get("type").and_then(Value::as_str).unwrap_or(""),
        }
    }

    #[must_use]
    pub fn is_function_call_event(&self) -> bool {
        self.kind().starts_with(FUNCTION_CALL_PREFIX)
    }
}
