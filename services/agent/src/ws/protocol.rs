//! Defines the JSON control messages exchanged with the voice agent service.
//!
//! Audio never goes through these types: it travels as raw binary frames.

use super::settings::Settings;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use voice_agent_core::InjectAgentMessage;

/// Control messages sent by the agent service.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum InboundMessage {
    /// First message after the handshake.
    Welcome {
        #[serde(default)]
        session_id: String,
    },
    /// The user began talking; any agent audio still queued must stop.
    UserStartedSpeaking,
    /// A line of the transcript, from either side.
    ConversationText {
        #[serde(default, deserialize_with = "lenient_string")]
        role: String,
        #[serde(default, deserialize_with = "lenient_string")]
        content: String,
    },
    /// The agent has decided to call a function. Carries no payload we use.
    FunctionCalling,
    /// The agent wants a local function executed.
    FunctionCallRequest(FunctionCallRequest),
    /// The service is ending the session.
    CloseConnection,
    AgentStartedSpeaking,
    AgentAudioDone,
    /// Any message type this client does not know about.
    #[serde(other)]
    Unknown,
}

/// Every request must be answered, so a missing name or an odd id type is
/// tolerated here and surfaces later as an error response.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionCallRequest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub function_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub function_call_id: String,
    #[serde(default = "empty_object")]
    pub input: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Reads a string field that the service may also send as a number or null.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The wire name of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Welcome { .. } => "Welcome",
            InboundMessage::UserStartedSpeaking => "UserStartedSpeaking",
            InboundMessage::ConversationText { .. } => "ConversationText",
            InboundMessage::FunctionCalling => "FunctionCalling",
            InboundMessage::FunctionCallRequest(_) => "FunctionCallRequest",
            InboundMessage::CloseConnection => "CloseConnection",
            InboundMessage::AgentStartedSpeaking => "AgentStartedSpeaking",
            InboundMessage::AgentAudioDone => "AgentAudioDone",
            InboundMessage::Unknown => "Unknown",
        }
    }
}

/// Control messages sent to the agent service.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    /// The handshake. Sent exactly once, before anything else.
    SettingsConfiguration(Settings),
    /// The result of a function call. `output` is the result encoded as a
    /// JSON string, not a nested object.
    FunctionCallResponse {
        function_call_id: String,
        output: String,
    },
    /// Something for the agent to say.
    InjectAgentMessage { message: String },
}

impl OutboundMessage {
    pub fn function_call_response(call_id: &str, output: &Value) -> Self {
        OutboundMessage::FunctionCallResponse {
            function_call_id: call_id.to_string(),
            output: output.to_string(),
        }
    }

    pub fn inject(message: &InjectAgentMessage) -> Self {
        OutboundMessage::InjectAgentMessage {
            message: message.message.clone(),
        }
    }
}
