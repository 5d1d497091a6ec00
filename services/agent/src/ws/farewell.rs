//! Hanging up without cutting the agent off mid-goodbye.

use super::dispatcher::HangUp;
use super::protocol::{InboundMessage, OutboundMessage};
use super::transport::{Frame, FrameStream, Outbound, TransportError};
use crate::audio::PlaybackQueue;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voice_agent_core::{Notification, NotificationSink};

/// Time left for the speaker to play out buffered farewell audio after the
/// agent reports it has sent all of it.
pub const FAREWELL_TAIL: Duration = Duration::from_millis(3500);

/// How long closing the socket may take before it is abandoned.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How the farewell sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FarewellEnd {
    /// The farewell played out and the socket was closed.
    Completed,
    /// The agent went away before the farewell finished.
    StreamEnded,
    /// The session was stopped while waiting.
    Cancelled,
}

enum Wait {
    Matched,
    StreamEnded,
    Cancelled,
}

/// Runs the termination sequence once the `end_call` response has been sent:
///
/// 1. inject the farewell,
/// 2. wait until the agent starts speaking it,
/// 3. wait for `AgentAudioDone`,
/// 4. let the speaker drain for [`FAREWELL_TAIL`],
/// 5. close the socket, bounded by [`CLOSE_TIMEOUT`].
///
/// Agent audio keeps flowing to `playback` while waiting.
pub async fn run_farewell(
    hang_up: &HangUp,
    frames: &mut dyn FrameStream,
    outbound: &Outbound,
    playback: &PlaybackQueue,
    notifier: &dyn NotificationSink,
    cancel: &CancellationToken,
) -> Result<FarewellEnd, TransportError> {
    let farewell = &hang_up.farewell.message;
    info!(message = %farewell, "Sending InjectAgentMessage");
    outbound
        .send_message(&OutboundMessage::inject(&hang_up.farewell))
        .await?;

    // Some agents announce the farewell as transcript text instead of a
    // speaking signal, so either counts.
    let started = wait_for(frames, playback, notifier, cancel, |message| match message {
        InboundMessage::AgentStartedSpeaking => true,
        InboundMessage::ConversationText { role, content } => {
            role == "assistant" && content == farewell
        }
        _ => false,
    })
    .await;
    if let Some(end) = interrupted(started) {
        return Ok(end);
    }
    debug!("Agent started speaking the farewell");

    let done = wait_for(frames, playback, notifier, cancel, |message| {
        matches!(message, InboundMessage::AgentAudioDone)
    })
    .await;
    if let Some(end) = interrupted(done) {
        return Ok(end);
    }
    debug!("Farewell audio received, waiting for playback to finish");

    tokio::select! {
        _ = cancel.cancelled() => return Ok(FarewellEnd::Cancelled),
        _ = tokio::time::sleep(FAREWELL_TAIL) => {}
    }

    info!(close = %hang_up.close, "Sending ws close message");
    if let Err(e) = outbound.close(CLOSE_TIMEOUT).await {
        warn!(error = %e, "Error during websocket closure");
    }
    Ok(FarewellEnd::Completed)
}

fn interrupted(wait: Wait) -> Option<FarewellEnd> {
    match wait {
        Wait::Matched => None,
        Wait::StreamEnded => {
            warn!("Connection ended before the farewell finished");
            Some(FarewellEnd::StreamEnded)
        }
        Wait::Cancelled => Some(FarewellEnd::Cancelled),
    }
}

async fn wait_for(
    frames: &mut dyn FrameStream,
    playback: &PlaybackQueue,
    notifier: &dyn NotificationSink,
    cancel: &CancellationToken,
    mut matches: impl FnMut(&InboundMessage) -> bool,
) -> Wait {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Wait::Cancelled,
            frame = frames.next_frame() => frame,
        };
        match frame {
            None => return Wait::StreamEnded,
            Some(Err(e)) => {
                warn!(error = %e, "Error reading from the agent during farewell");
                return Wait::StreamEnded;
            }
            Some(Ok(Frame::Binary(data))) => playback.push(data),
            Some(Ok(Frame::Text(text))) => {
                let message = match InboundMessage::parse(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(error = %e, "Ignoring malformed message during farewell");
                        continue;
                    }
                };
                debug!(message_type = message.kind(), "Server: {}", text);
                if let InboundMessage::ConversationText { role, content } = &message {
                    notifier.notify(Notification::ConversationUpdate {
                        role: role.clone(),
                        content: content.clone(),
                    });
                }
                if matches(&message) {
                    return Wait::Matched;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::transport::mock::{Recorder, pair, text};
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::Instant;
    use voice_agent_core::{InjectAgentMessage, LogNotifier};

    const FAREWELL: &str = "Thank you for calling! Have a great day!";

    fn hang_up() -> HangUp {
        HangUp {
            farewell: InjectAgentMessage::new(FAREWELL),
            close: json!({"type": "close"}),
        }
    }

    /// Runs the sequence in the background and returns its handle plus the
    /// means to drive and observe it.
    fn start(
        cancel: CancellationToken,
    ) -> (
        tokio::task::JoinHandle<Result<FarewellEnd, TransportError>>,
        mpsc::UnboundedSender<Frame>,
        Recorder,
        PlaybackQueue,
    ) {
        let (sink, mut stream, recorder, inbound) = pair();
        let playback = PlaybackQueue::new();
        let task_playback = playback.clone();
        let handle = tokio::spawn(async move {
            let outbound = Outbound::new(Box::new(sink));
            run_farewell(
                &hang_up(),
                &mut stream,
                &outbound,
                &task_playback,
                &LogNotifier,
                &cancel,
            )
            .await
        });
        (handle, inbound, recorder, playback)
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_audio_done_and_tail() {
        let (handle, inbound, recorder, playback) = start(CancellationToken::new());

        inbound.send(text(json!({"type": "AgentStartedSpeaking"}))).unwrap();
        inbound.send(Frame::Binary(Bytes::from_static(&[1, 2, 3, 4]))).unwrap();

        // Nothing closes while the agent is still speaking, however long it takes.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(recorder.closes().is_empty());
        assert_eq!(recorder.message_types(), vec!["InjectAgentMessage"]);
        assert_eq!(recorder.texts()[0]["message"], FAREWELL);
        // Farewell audio still reaches the speaker.
        assert_eq!(playback.len(), 1);

        let audio_done_at = Instant::now();
        inbound.send(text(json!({"type": "AgentAudioDone"}))).unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), FarewellEnd::Completed);
        let closes = recorder.closes();
        assert_eq!(closes.len(), 1);
        assert!(closes[0] - audio_done_at >= FAREWELL_TAIL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_assistant_text_counts_as_speaking() {
        let (handle, inbound, recorder, _playback) = start(CancellationToken::new());

        // Unrelated text and audio-done before the farewell starts are ignored.
        inbound
            .send(text(json!({"type": "ConversationText", "role": "assistant", "content": "Anything else?"})))
            .unwrap();
        inbound.send(text(json!({"type": "AgentAudioDone"}))).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(recorder.closes().is_empty());

        inbound
            .send(text(json!({"type": "ConversationText", "role": "assistant", "content": FAREWELL})))
            .unwrap();
        inbound.send(text(json!({"type": "AgentAudioDone"}))).unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), FarewellEnd::Completed);
        assert_eq!(recorder.closes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_stops_waiting() {
        let (handle, inbound, recorder, _playback) = start(CancellationToken::new());
        inbound.send(text(json!({"type": "AgentStartedSpeaking"}))).unwrap();
        drop(inbound);

        assert_eq!(handle.await.unwrap().unwrap(), FarewellEnd::StreamEnded);
        assert!(recorder.closes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_tail() {
        let cancel = CancellationToken::new();
        let (handle, inbound, recorder, _playback) = start(cancel.clone());
        inbound.send(text(json!({"type": "AgentStartedSpeaking"}))).unwrap();
        inbound.send(text(json!({"type": "AgentAudioDone"}))).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap().unwrap(), FarewellEnd::Cancelled);
        assert!(recorder.closes().is_empty());
    }
}
