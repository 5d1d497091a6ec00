//! One-way status and transcript notifications.
//!
//! The session engine reports what is happening (who said what, state changes,
//! function calls) without depending on who is listening. Sinks must never
//! block the caller.

use crate::SessionState;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// A line of the conversation transcript.
    ConversationUpdate { role: String, content: String },
    /// The session moved to a new lifecycle state.
    SessionState { state: SessionState },
    /// The agent invoked a local function.
    FunctionCalled {
        name: String,
        call_id: String,
        is_error: bool,
    },
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: Notification) {
        match notification {
            Notification::ConversationUpdate { role, content } => {
                info!(%role, %content, "Conversation update")
            }
            Notification::SessionState { state } => info!(%state, "Session state"),
            Notification::FunctionCalled {
                name,
                call_id,
                is_error,
            } => info!(function = %name, %call_id, is_error, "Function called"),
        }
    }
}

/// Forwards notifications over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        // Nobody listening is fine.
        let _ = self.tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_notifier_delivers_in_order() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.notify(Notification::SessionState {
            state: SessionState::Connecting,
        });
        notifier.notify(Notification::ConversationUpdate {
            role: "user".into(),
            content: "Hi".into(),
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            Notification::SessionState {
                state: SessionState::Connecting
            }
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            Notification::ConversationUpdate { ref content, .. } if content == "Hi"
        ));
    }

    #[test]
    fn test_channel_notifier_ignores_dropped_receiver() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        notifier.notify(Notification::SessionState {
            state: SessionState::Closed,
        });
    }

    #[test]
    fn test_notification_serializes_with_event_tag() {
        let value = serde_json::to_value(Notification::SessionState {
            state: SessionState::Active,
        })
        .unwrap();
        assert_eq!(value["event"], "session_state");
        assert_eq!(value["state"], "active");
    }
}
