//! Capability Registry
//!
//! The remote agent asks for work to be done by name. This module maps those
//! names to local handlers and describes what a handler produced, so that the
//! session engine can turn the result into the right sequence of protocol
//! messages.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Errors raised while resolving a function call.
#[derive(Debug, thiserror::Error)]
pub enum FunctionError {
    #[error("Function {0} not found")]
    NotFound(String),
}

/// The description of a capability that is advertised to the agent during
/// the settings handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    /// A JSON schema object describing the accepted parameters.
    pub parameters: Value,
}

impl FunctionDefinition {
    /// Builds a definition whose parameter schema is derived from `T`.
    pub fn for_args<T: JsonSchema>(name: &str, description: &str) -> Self {
        let mut parameters = schemars::schema_for!(T).to_value();
        if let Some(object) = parameters.as_object_mut() {
            object.remove("$schema");
            object.remove("title");
        }
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// A message the agent should speak, injected into the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InjectAgentMessage {
    pub message: String,
}

impl InjectAgentMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// What a handler asks the session to do once it has finished.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionOutcome {
    /// Reply with a single function call response.
    Reply(Value),
    /// Reply, then inject a message for the agent to speak while work goes on.
    ReplyThenInject {
        response: Value,
        inject: InjectAgentMessage,
    },
    /// Reply, have the agent say goodbye, then end the session once the
    /// farewell has been heard.
    ReplyThenHangUp {
        response: Value,
        farewell: InjectAgentMessage,
        close: Value,
    },
}

impl FunctionOutcome {
    /// The payload that goes into the function call response.
    pub fn response(&self) -> &Value {
        match self {
            FunctionOutcome::Reply(response)
            | FunctionOutcome::ReplyThenInject { response, .. }
            | FunctionOutcome::ReplyThenHangUp { response, .. } => response,
        }
    }
}

/// A locally executed capability the agent may invoke.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentFunction: Send + Sync {
    /// The name, description and parameter schema of this capability.
    fn definition(&self) -> FunctionDefinition;

    /// Executes the capability with the parameters sent by the agent.
    async fn call(&self, parameters: Value) -> anyhow::Result<FunctionOutcome>;
}

/// A fixed set of capabilities, keyed by name.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn AgentFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the capabilities in [`crate::builtin`].
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::AgentFiller);
        registry.register(crate::builtin::EndCall);
        registry.register(crate::builtin::CurrentDate);
        registry
    }

    /// Adds a capability, replacing any previous one with the same name.
    pub fn register<F: AgentFunction + 'static>(&mut self, function: F) -> &mut Self {
        let name = function.definition().name;
        if self.functions.insert(name.clone(), Arc::new(function)).is_some() {
            tracing::warn!(function = %name, "Replaced an existing function registration");
        }
        self
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn AgentFunction>, FunctionError> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| FunctionError::NotFound(name.to_string()))
    }

    /// Definitions of every registered capability, ordered by name so that
    /// the handshake is stable between runs.
    pub fn definitions(&self) -> Vec<FunctionDefinition> {
        let mut definitions: Vec<_> = self.functions.values().map(|f| f.definition()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
