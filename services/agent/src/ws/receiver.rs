//! The receiver task: everything the agent sends comes through here.

use super::dispatcher::FunctionDispatcher;
use super::farewell::{CLOSE_TIMEOUT, FarewellEnd, run_farewell};
use super::protocol::InboundMessage;
use super::transport::{Frame, FrameStream, Outbound, TransportError};
use crate::audio::PlaybackQueue;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use voice_agent_core::{Notification, NotificationSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyKind {
    /// First function call after the user spoke.
    Initial,
    /// A follow-up call made without the user speaking in between.
    Chain,
}

impl fmt::Display for LatencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LatencyKind::Initial => f.write_str("initial"),
            LatencyKind::Chain => f.write_str("chain"),
        }
    }
}

/// How long the agent took to decide to call a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionLatency {
    pub kind: LatencyKind,
    pub elapsed: Duration,
}

/// Tracks the timestamps decision latency is measured from.
///
/// Only the receiver task touches it, so no synchronization is needed.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    last_user_message: Option<Instant>,
    last_function_response: Option<Instant>,
    in_function_chain: bool,
}

impl LatencyTracker {
    /// Any user or assistant turn ends the current chain.
    pub fn conversation_text(&mut self, role: &str, now: Instant) {
        match role {
            "user" => {
                self.last_user_message = Some(now);
                self.in_function_chain = false;
            }
            "assistant" => self.in_function_chain = false,
            _ => {}
        }
    }

    /// Measures from the last function response when inside a chain,
    /// otherwise from the last user utterance. Returns `None` when there is
    /// nothing to measure from yet.
    pub fn function_calling(&mut self, now: Instant) -> Option<DecisionLatency> {
        let latency = match (self.in_function_chain, self.last_function_response) {
            (true, Some(responded)) => Some(DecisionLatency {
                kind: LatencyKind::Chain,
                elapsed: now.saturating_duration_since(responded),
            }),
            _ => self.last_user_message.map(|spoke| DecisionLatency {
                kind: LatencyKind::Initial,
                elapsed: now.saturating_duration_since(spoke),
            }),
        };
        self.in_function_chain = true;
        latency
    }

    pub fn function_responded(&mut self, at: Instant) {
        self.last_function_response = Some(at);
    }
}

/// Why the receiver task stopped.
#[derive(Debug)]
pub enum ReceiverExit {
    /// The agent sent `CloseConnection`.
    CloseRequested,
    /// The farewell sequence of an `end_call` ran to completion.
    CallEnded,
    /// The socket closed or the agent disconnected.
    StreamEnded,
    Cancelled,
    Failed(TransportError),
}

pub struct Receiver {
    frames: Box<dyn FrameStream>,
    outbound: Arc<Outbound>,
    playback: PlaybackQueue,
    dispatcher: FunctionDispatcher,
    notifier: Arc<dyn NotificationSink>,
    cancel: CancellationToken,
    latency: LatencyTracker,
}

impl Receiver {
    pub fn new(
        frames: Box<dyn FrameStream>,
        outbound: Arc<Outbound>,
        playback: PlaybackQueue,
        dispatcher: FunctionDispatcher,
        notifier: Arc<dyn NotificationSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            frames,
            outbound,
            playback,
            dispatcher,
            notifier,
            cancel,
            latency: LatencyTracker::default(),
        }
    }

    /// Handles inbound frames strictly one at a time until the session ends.
    pub async fn run(mut self) -> ReceiverExit {
        let cancel = self.cancel.clone();
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return ReceiverExit::Cancelled,
                frame = self.frames.next_frame() => frame,
            };
            match frame {
                None => {
                    info!("Agent connection closed");
                    return ReceiverExit::StreamEnded;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Error receiving from agent");
                    return ReceiverExit::Failed(e);
                }
                Some(Ok(Frame::Binary(data))) => self.playback.push(data),
                Some(Ok(Frame::Text(text))) => {
                    let exit = tokio::select! {
                        _ = cancel.cancelled() => Some(ReceiverExit::Cancelled),
                        exit = self.handle_text(&text) => exit,
                    };
                    if let Some(exit) = exit {
                        return exit;
                    }
                }
            }
        }
    }

    async fn handle_text(&mut self, text: &str) -> Option<ReceiverExit> {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed control message");
                return None;
            }
        };
        info!(message_type = message.kind(), "Server: {}", text);
        let now = Instant::now();

        match message {
            InboundMessage::UserStartedSpeaking => {
                let dropped = self.playback.clear();
                info!(dropped, "User started speaking, playback interrupted");
            }
            InboundMessage::ConversationText { role, content } => {
                self.latency.conversation_text(&role, now);
                self.notifier
                    .notify(Notification::ConversationUpdate { role, content });
            }
            InboundMessage::FunctionCalling => {
                if let Some(latency) = self.latency.function_calling(now) {
                    info!(
                        kind = %latency.kind,
                        latency_ms = latency.elapsed.as_millis() as u64,
                        "LLM decision latency"
                    );
                }
            }
            InboundMessage::FunctionCallRequest(request) => {
                let dispatched = match self.dispatcher.dispatch(request, &self.outbound).await {
                    Ok(dispatched) => dispatched,
                    Err(e) => {
                        error!(error = %e, "Failed to send function call response");
                        return Some(ReceiverExit::Failed(e));
                    }
                };
                self.latency.function_responded(dispatched.responded_at);

                if let Some(hang_up) = dispatched.hang_up {
                    let end = run_farewell(
                        &hang_up,
                        self.frames.as_mut(),
                        &self.outbound,
                        &self.playback,
                        self.notifier.as_ref(),
                        &self.cancel,
                    )
                    .await;
                    return Some(match end {
                        Ok(FarewellEnd::Completed) => ReceiverExit::CallEnded,
                        Ok(FarewellEnd::StreamEnded) => ReceiverExit::StreamEnded,
                        Ok(FarewellEnd::Cancelled) => ReceiverExit::Cancelled,
                        Err(e) => {
                            error!(error = %e, "Failed to send farewell");
                            ReceiverExit::Failed(e)
                        }
                    });
                }
            }
            InboundMessage::Welcome { session_id } => {
                info!(%session_id, "Connected with session ID");
            }
            InboundMessage::CloseConnection => {
                info!("Closing connection...");
                if let Err(e) = self.outbound.close(CLOSE_TIMEOUT).await {
                    warn!(error = %e, "Error during websocket closure");
                }
                return Some(ReceiverExit::CloseRequested);
            }
            // Only the farewell sequence waits on these.
            InboundMessage::AgentStartedSpeaking | InboundMessage::AgentAudioDone => {}
            InboundMessage::Unknown => {
                debug!("Ignoring unrecognised control message");
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::transport::mock::{Recorder, pair, text};
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::mpsc;
    use voice_agent_core::{ChannelNotifier, FunctionRegistry};

    #[test]
    fn test_initial_latency_measured_from_user_message() {
        let t0 = Instant::now();
        let mut tracker = LatencyTracker::default();
        tracker.conversation_text("user", t0);

        let latency = tracker.function_calling(t0 + Duration::from_millis(1200)).unwrap();
        assert_eq!(latency.kind, LatencyKind::Initial);
        assert_eq!(latency.elapsed, Duration::from_millis(1200));
    }

    #[test]
    fn test_chain_latency_measured_from_last_response() {
        let t0 = Instant::now();
        let mut tracker = LatencyTracker::default();
        tracker.conversation_text("user", t0);
        tracker.function_calling(t0 + Duration::from_millis(500));
        tracker.function_responded(t0 + Duration::from_millis(800));

        let latency = tracker.function_calling(t0 + Duration::from_millis(1100)).unwrap();
        assert_eq!(latency.kind, LatencyKind::Chain);
        assert_eq!(latency.elapsed, Duration::from_millis(300));
    }

    #[test]
    fn test_assistant_text_ends_chain() {
        let t0 = Instant::now();
        let mut tracker = LatencyTracker::default();
        tracker.conversation_text("user", t0);
        tracker.function_calling(t0);
        tracker.function_responded(t0 + Duration::from_millis(100));
        tracker.conversation_text("assistant", t0 + Duration::from_millis(200));

        let latency = tracker.function_calling(t0 + Duration::from_millis(1000)).unwrap();
        assert_eq!(latency.kind, LatencyKind::Initial);
        assert_eq!(latency.elapsed, Duration::from_millis(1000));
    }

    #[test]
    fn test_no_latency_before_anyone_spoke() {
        let mut tracker = LatencyTracker::default();
        assert!(tracker.function_calling(Instant::now()).is_none());
    }

    struct Harness {
        inbound: mpsc::UnboundedSender<Frame>,
        recorder: Recorder,
        playback: PlaybackQueue,
        notifications: mpsc::UnboundedReceiver<Notification>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<ReceiverExit>,
    }

    fn spawn_receiver() -> Harness {
        let (sink, stream, recorder, inbound) = pair();
        let (notifier, notifications) = ChannelNotifier::new();
        let notifier: Arc<dyn NotificationSink> = Arc::new(notifier);
        let playback = PlaybackQueue::new();
        let cancel = CancellationToken::new();
        let receiver = Receiver::new(
            Box::new(stream),
            Arc::new(Outbound::new(Box::new(sink))),
            playback.clone(),
            FunctionDispatcher::new(FunctionRegistry::with_builtins(), notifier.clone()),
            notifier,
            cancel.clone(),
        );
        Harness {
            inbound,
            recorder,
            playback,
            notifications,
            cancel,
            task: tokio::spawn(receiver.run()),
        }
    }

    fn audio(tag: u8) -> Frame {
        Frame::Binary(Bytes::from(vec![tag; 8]))
    }

    #[tokio::test]
    async fn test_barge_in_drains_playback_queue() {
        let h = spawn_receiver();
        for tag in 0..5 {
            h.inbound.send(audio(tag)).unwrap();
        }
        h.inbound.send(text(json!({"type": "UserStartedSpeaking"}))).unwrap();
        h.inbound.send(audio(9)).unwrap();
        drop(h.inbound);

        assert!(matches!(h.task.await.unwrap(), ReceiverExit::StreamEnded));
        // Only the frame that arrived after the interruption survives.
        assert_eq!(h.playback.len(), 1);
        let frame = h.playback.pop_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(frame.data, Bytes::from(vec![9u8; 8]));
    }

    #[tokio::test]
    async fn test_conversation_text_is_forwarded() {
        let mut h = spawn_receiver();
        h.inbound
            .send(text(json!({"type": "ConversationText", "role": "user", "content": "Hi"})))
            .unwrap();
        drop(h.inbound);
        h.task.await.unwrap();

        assert_eq!(
            h.notifications.try_recv().unwrap(),
            Notification::ConversationUpdate {
                role: "user".to_string(),
                content: "Hi".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_messages_are_ignored() {
        let h = spawn_receiver();
        h.inbound.send(text(json!({"type": "SomethingNew"}))).unwrap();
        h.inbound.send(Frame::Text("{not json".to_string())).unwrap();
        h.inbound
            .send(text(json!({"type": "FunctionCallRequest", "function_name": "current_date", "function_call_id": "x"})))
            .unwrap();
        drop(h.inbound);

        assert!(matches!(h.task.await.unwrap(), ReceiverExit::StreamEnded));
        assert_eq!(h.recorder.message_types(), vec!["FunctionCallResponse"]);
    }

    #[tokio::test]
    async fn test_every_request_gets_one_response() {
        let h = spawn_receiver();
        for (name, id) in [("current_date", "a"), ("nope", "b"), ("agent_filler", "c")] {
            h.inbound
                .send(text(json!({
                    "type": "FunctionCallRequest",
                    "function_name": name,
                    "function_call_id": id,
                    "input": {"message_type": "general"}
                })))
                .unwrap();
        }
        drop(h.inbound);
        h.task.await.unwrap();

        let ids: Vec<_> = h
            .recorder
            .texts()
            .into_iter()
            .filter(|m| m["type"] == "FunctionCallResponse")
            .map(|m| m["function_call_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_request_without_name_is_answered_with_error() {
        let h = spawn_receiver();
        h.inbound
            .send(text(json!({"type": "FunctionCallRequest", "function_call_id": 42})))
            .unwrap();
        drop(h.inbound);

        assert!(matches!(h.task.await.unwrap(), ReceiverExit::StreamEnded));
        let sent = h.recorder.texts();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "FunctionCallResponse");
        assert_eq!(sent[0]["function_call_id"], "42");
        let output: serde_json::Value =
            serde_json::from_str(sent[0]["output"].as_str().unwrap()).unwrap();
        assert_eq!(output, json!({"error": "Function  not found"}));
    }

    #[tokio::test]
    async fn test_close_connection_closes_transport() {
        let h = spawn_receiver();
        h.inbound.send(text(json!({"type": "CloseConnection"}))).unwrap();

        assert!(matches!(h.task.await.unwrap(), ReceiverExit::CloseRequested));
        assert_eq!(h.recorder.closes().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_receiver() {
        let h = spawn_receiver();
        h.cancel.cancel();
        assert!(matches!(h.task.await.unwrap(), ReceiverExit::Cancelled));
    }

    #[tokio::test]
    async fn test_send_failure_ends_receiver() {
        let h = spawn_receiver();
        h.recorder.fail_sends();
        h.inbound
            .send(text(json!({"type": "FunctionCallRequest", "function_name": "current_date", "function_call_id": "z"})))
            .unwrap();

        assert!(matches!(h.task.await.unwrap(), ReceiverExit::Failed(_)));
    }
}
