//! Built-in Capabilities
//!
//! Two of these exist to drive the conversation itself rather than answer a
//! question: `agent_filler` lets the agent say something while a slow lookup
//! runs, and `end_call` lets it hang up politely.

use crate::functions::{AgentFunction, FunctionDefinition, FunctionOutcome, InjectAgentMessage};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

/// Arguments accepted by [`AgentFiller`].
#[derive(Deserialize, JsonSchema, Debug)]
pub struct AgentFillerArgs {
    /// The kind of filler to speak.
    #[schemars(description = "Type of filler message: 'lookup' when searching for information, 'general' otherwise")]
    pub message_type: String,
}

/// Speaks a short filler line while the agent waits on another function.
pub struct AgentFiller;

impl AgentFiller {
    pub fn filler_message(message_type: &str) -> &'static str {
        match message_type {
            "lookup" => "Let me look that up for you...",
            _ => "One moment please...",
        }
    }
}

#[async_trait]
impl AgentFunction for AgentFiller {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition::for_args::<AgentFillerArgs>(
            "agent_filler",
            "Use this function to provide natural conversational filler before looking up information. \
             Always call this function first with message_type 'lookup' when you're about to look up information.",
        )
    }

    async fn call(&self, parameters: Value) -> anyhow::Result<FunctionOutcome> {
        let args: AgentFillerArgs = serde_json::from_value(parameters)?;
        info!(message_type = %args.message_type, "Executing 'agent_filler'");
        Ok(FunctionOutcome::ReplyThenInject {
            response: json!({"status": "queued", "message_type": args.message_type}),
            inject: InjectAgentMessage::new(Self::filler_message(&args.message_type)),
        })
    }
}

/// Arguments accepted by [`EndCall`].
#[derive(Deserialize, JsonSchema, Debug)]
pub struct EndCallArgs {
    #[schemars(description = "Type of farewell: 'thanks', 'help' or 'general'")]
    pub farewell_type: String,
}

/// Ends the conversation after the agent has said goodbye.
pub struct EndCall;

impl EndCall {
    pub fn farewell_message(farewell_type: &str) -> &'static str {
        match farewell_type {
            "thanks" => "Thank you for calling! Have a great day!",
            "help" => "I'm glad I could help! Have a wonderful day!",
            _ => "Goodbye! Have a nice day!",
        }
    }
}

#[async_trait]
impl AgentFunction for EndCall {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition::for_args::<EndCallArgs>(
            "end_call",
            "End the conversation and close the connection. Call this when the user says goodbye, \
             thanks you, or otherwise indicates the conversation is over.",
        )
    }

    async fn call(&self, parameters: Value) -> anyhow::Result<FunctionOutcome> {
        let args: EndCallArgs = serde_json::from_value(parameters)?;
        let message = Self::farewell_message(&args.farewell_type);
        info!(farewell_type = %args.farewell_type, "Executing 'end_call'");
        Ok(FunctionOutcome::ReplyThenHangUp {
            response: json!({"status": "closing", "message": message}),
            farewell: InjectAgentMessage::new(message),
            close: json!({"type": "close"}),
        })
    }
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct CurrentDateArgs {}

/// Tells the agent today's date.
pub struct CurrentDate;

#[async_trait]
impl AgentFunction for CurrentDate {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition::for_args::<CurrentDateArgs>(
            "current_date",
            "Get today's date, for example to work out deadlines or schedule practice.",
        )
    }

    async fn call(&self, _parameters: Value) -> anyhow::Result<FunctionOutcome> {
        let date = chrono::Local::now().format("%A, %B %d, %Y").to_string();
        Ok(FunctionOutcome::Reply(json!({ "date": date })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_filler_lookup() {
        let outcome = AgentFiller
            .call(json!({"message_type": "lookup"}))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FunctionOutcome::ReplyThenInject {
                response: json!({"status": "queued", "message_type": "lookup"}),
                inject: InjectAgentMessage::new("Let me look that up for you..."),
            }
        );
    }

    #[tokio::test]
    async fn test_agent_filler_general_fallback() {
        let outcome = AgentFiller
            .call(json!({"message_type": "anything"}))
            .await
            .unwrap();
        match outcome {
            FunctionOutcome::ReplyThenInject { inject, .. } => {
                assert_eq!(inject.message, "One moment please...")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_end_call_farewells() {
        for (kind, expected) in [
            ("thanks", "Thank you for calling! Have a great day!"),
            ("help", "I'm glad I could help! Have a wonderful day!"),
            ("general", "Goodbye! Have a nice day!"),
        ] {
            let outcome = EndCall.call(json!({"farewell_type": kind})).await.unwrap();
            match outcome {
                FunctionOutcome::ReplyThenHangUp {
                    response,
                    farewell,
                    close,
                } => {
                    assert_eq!(response, json!({"status": "closing", "message": expected}));
                    assert_eq!(farewell.message, expected);
                    assert_eq!(close, json!({"type": "close"}));
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_end_call_rejects_missing_argument() {
        let err = EndCall.call(json!({})).await.unwrap_err();
        assert!(err.to_string().contains("farewell_type"));
    }

    #[tokio::test]
    async fn test_current_date_replies_with_date() {
        let outcome = CurrentDate.call(json!({})).await.unwrap();
        let date = outcome.response()["date"].as_str().unwrap();
        assert!(date.contains(", "));
    }

    #[test]
    fn test_end_call_definition_requires_farewell_type() {
        let definition = EndCall.definition();
        assert_eq!(definition.name, "end_call");
        assert_eq!(definition.parameters["required"], json!(["farewell_type"]));
    }
}
