//! The settings handshake that configures the remote agent.

use crate::audio_utils::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::config::{AgentConfig, CURRENT_DATE_PLACEHOLDER};
use serde::Serialize;
use voice_agent_core::FunctionDefinition;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Settings {
    pub audio: AudioSettings,
    pub agent: AgentSettings,
    pub context: ContextSettings,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AudioSettings {
    pub input: AudioFormat,
    pub output: AudioFormat,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub listen: ModelSettings,
    pub think: ThinkSettings,
    pub speak: ModelSettings,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub model: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ThinkSettings {
    pub provider: ThinkProvider,
    pub model: String,
    pub instructions: String,
    pub functions: Vec<FunctionDefinition>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ThinkProvider {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ContextSettings {
    pub messages: Vec<ContextMessage>,
    pub replay: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

impl Settings {
    /// Builds the handshake: 48 kHz linear16 in, 16 kHz linear16 out with no
    /// container, the configured models, and the greeting as opening context.
    pub fn new(agent: &AgentConfig, functions: Vec<FunctionDefinition>, date: &str) -> Self {
        Self {
            audio: AudioSettings {
                input: AudioFormat {
                    encoding: "linear16".to_string(),
                    sample_rate: CAPTURE_SAMPLE_RATE,
                    container: None,
                },
                output: AudioFormat {
                    encoding: "linear16".to_string(),
                    sample_rate: PLAYBACK_SAMPLE_RATE,
                    container: Some("none".to_string()),
                },
            },
            agent: AgentSettings {
                listen: ModelSettings {
                    model: agent.listen_model.clone(),
                },
                think: ThinkSettings {
                    provider: ThinkProvider {
                        kind: "open_ai".to_string(),
                    },
                    model: agent.think_model.clone(),
                    instructions: render_instructions(&agent.instructions, date),
                    functions,
                },
                speak: ModelSettings {
                    model: agent.speak_voice.clone(),
                },
            },
            context: ContextSettings {
                messages: vec![ContextMessage {
                    role: "assistant".to_string(),
                    content: agent.greeting.clone(),
                }],
                replay: true,
            },
        }
    }
}

pub fn render_instructions(template: &str, date: &str) -> String {
    template.replace(CURRENT_DATE_PLACEHOLDER, date)
}

/// Today's local date, e.g. "Monday, October 19, 2026".
pub fn today() -> String {
    chrono::Local::now().format("%A, %B %d, %Y").to_string()
}
