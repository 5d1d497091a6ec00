use secrecy::SecretString;
use std::path::PathBuf;
use tracing::Level;

pub const DEFAULT_AGENT_URL: &str = "wss://agent.deepgram.com/agent";
pub const DEFAULT_LISTEN_MODEL: &str = "nova-2";
pub const DEFAULT_THINK_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_SPEAK_VOICE: &str = "aura-asteria-en";
pub const DEFAULT_GREETING: &str =
    "Hello! I'm Sarah, your English tutor. What would you like to practice today?";

/// Placeholder in the instructions that is replaced with today's date at setup.
pub const CURRENT_DATE_PLACEHOLDER: &str = "{current_date}";

pub const DEFAULT_INSTRUCTIONS: &str = "\
You are an English teacher specializing in helping students improve their speaking, listening, \
vocabulary, grammar, and pronunciation skills. Your teaching style is engaging, interactive, and encouraging.
Today is {current_date}.

You should:
- Start by assessing the student's English level with a few simple questions.
- Speak clearly and naturally, adjusting your speed and vocabulary based on the student's level.
- Correct mistakes gently and provide explanations with examples.
- Encourage students to practice by asking open-ended questions and engaging in role-play scenarios.
- Adapt lessons to the student's goals (e.g., daily conversation, business English, exam preparation).
- Use simple definitions and synonyms when explaining new words.
- Give small, actionable feedback after each response to guide improvement.
- When the student says goodbye, call end_call.
";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
    #[error("Failed to read agent instructions from {path}: {source}")]
    Instructions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What the remote agent should listen with, think with and speak with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentConfig {
    pub listen_model: String,
    pub think_model: String,
    pub speak_voice: String,
    /// System instructions, possibly containing [`CURRENT_DATE_PLACEHOLDER`].
    pub instructions: String,
    /// The first thing the agent says.
    pub greeting: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_model: DEFAULT_LISTEN_MODEL.to_string(),
            think_model: DEFAULT_THINK_MODEL.to_string(),
            speak_voice: DEFAULT_SPEAK_VOICE.to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            greeting: DEFAULT_GREETING.to_string(),
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    /// Credential for the agent service. Checked at session setup, not here.
    pub api_key: Option<SecretString>,
    pub agent_url: String,
    pub input_device_id: Option<String>,
    pub output_device_id: Option<String>,
    pub agent: AgentConfig,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_key = non_empty_var("DEEPGRAM_API_KEY").map(SecretString::from);

        let agent_url =
            non_empty_var("VOICE_AGENT_URL").unwrap_or_else(|| DEFAULT_AGENT_URL.to_string());
        if !(agent_url.starts_with("wss://") || agent_url.starts_with("ws://")) {
            return Err(ConfigError::InvalidValue(
                "VOICE_AGENT_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", agent_url),
            ));
        }

        let input_device_id = non_empty_var("INPUT_DEVICE_ID");
        let output_device_id = non_empty_var("OUTPUT_DEVICE_ID");

        let defaults = AgentConfig::default();
        let instructions = match non_empty_var("AGENT_INSTRUCTIONS_PATH") {
            Some(path) => load_instructions(PathBuf::from(path))?,
            None => defaults.instructions,
        };
        let agent = AgentConfig {
            listen_model: non_empty_var("LISTEN_MODEL").unwrap_or(defaults.listen_model),
            think_model: non_empty_var("THINK_MODEL").unwrap_or(defaults.think_model),
            speak_voice: non_empty_var("SPEAK_VOICE").unwrap_or(defaults.speak_voice),
            instructions,
            greeting: non_empty_var("AGENT_GREETING").unwrap_or(defaults.greeting),
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            api_key,
            agent_url,
            input_device_id,
            output_device_id,
            agent,
            log_level,
        })
    }
}

/// Reads replacement agent instructions from a file.
pub fn load_instructions(path: PathBuf) -> Result<String, ConfigError> {
    std::fs::read_to_string(&path).map_err(|source| ConfigError::Instructions { path, source })
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}
