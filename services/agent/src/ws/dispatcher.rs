//! Runs agent function calls and answers them.

use super::protocol::{FunctionCallRequest, OutboundMessage};
use super::transport::{Outbound, TransportError};
use futures_util::FutureExt;
use serde_json::{Value, json};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, instrument};
use voice_agent_core::{
    FunctionOutcome, FunctionRegistry, InjectAgentMessage, Notification, NotificationSink,
};

/// The end of the call has been requested: the farewell still has to be
/// spoken before the session can close.
#[derive(Debug, Clone, PartialEq)]
pub struct HangUp {
    pub farewell: InjectAgentMessage,
    pub close: Value,
}

/// What happened after a function call was answered.
#[derive(Debug)]
pub struct Dispatched {
    /// When the function call response went out.
    pub responded_at: Instant,
    pub hang_up: Option<HangUp>,
}

pub struct FunctionDispatcher {
    registry: FunctionRegistry,
    notifier: Arc<dyn NotificationSink>,
}

impl FunctionDispatcher {
    pub fn new(registry: FunctionRegistry, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { registry, notifier }
    }

    /// Executes a function call and sends exactly one response for it.
    ///
    /// Handler failures (unknown function, bad parameters, errors, panics)
    /// are answered with `{"error": "<message>"}` and never returned. The only
    /// error that escapes is a failure to write to the socket.
    ///
    /// A filler outcome sends its injected message right after the response.
    /// A hang-up outcome is returned to the caller, which owns the inbound
    /// stream the farewell sequence has to read.
    #[instrument(
        name = "dispatch",
        skip_all,
        fields(function = %request.function_name, call_id = %request.function_call_id)
    )]
    pub async fn dispatch(
        &self,
        request: FunctionCallRequest,
        outbound: &Outbound,
    ) -> Result<Dispatched, TransportError> {
        info!(parameters = %request.input, "Function call received");
        let started = Instant::now();

        let (response, inject, hang_up, is_error) = match self.execute(&request).await {
            Ok(outcome) => {
                info!(
                    latency_ms = started.elapsed().as_millis() as u64,
                    "Function execution latency"
                );
                match outcome {
                    FunctionOutcome::Reply(response) => (response, None, None, false),
                    FunctionOutcome::ReplyThenInject { response, inject } => {
                        (response, Some(inject), None, false)
                    }
                    FunctionOutcome::ReplyThenHangUp {
                        response,
                        farewell,
                        close,
                    } => (response, None, Some(HangUp { farewell, close }), false),
                }
            }
            Err(e) => {
                error!(error = %e, "Error executing function");
                (json!({ "error": e.to_string() }), None, None, true)
            }
        };

        self.notifier.notify(Notification::FunctionCalled {
            name: request.function_name.clone(),
            call_id: request.function_call_id.clone(),
            is_error,
        });

        outbound
            .send_message(&OutboundMessage::function_call_response(
                &request.function_call_id,
                &response,
            ))
            .await?;
        let responded_at = Instant::now();
        info!(output = %response, "Function response sent");

        if let Some(inject) = inject {
            info!(message = %inject.message, "Sending InjectAgentMessage");
            outbound.send_message(&OutboundMessage::inject(&inject)).await?;
        }

        Ok(Dispatched {
            responded_at,
            hang_up,
        })
    }

    async fn execute(&self, request: &FunctionCallRequest) -> anyhow::Result<FunctionOutcome> {
        let function = self.registry.lookup(&request.function_name)?;
        match AssertUnwindSafe(function.call(request.input.clone()))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!(
                "Function {} panicked: {}",
                request.function_name,
                panic_message(panic.as_ref())
            )),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
