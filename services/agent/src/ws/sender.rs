//! The sender task: microphone frames out to the agent, in capture order.

use super::transport::{Outbound, TransportError};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug)]
pub enum SenderExit {
    Cancelled,
    /// The microphone went away and no more frames will arrive.
    CaptureEnded,
    Failed(TransportError),
}

/// Forwards captured frames until cancelled. A failed write ends the task;
/// there is no retry.
pub async fn run_sender(
    mut frames: mpsc::Receiver<Bytes>,
    outbound: Arc<Outbound>,
    cancel: CancellationToken,
) -> SenderExit {
    let mut sent: u64 = 0;
    let exit = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break SenderExit::Cancelled,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else {
            break SenderExit::CaptureEnded;
        };
        if let Err(e) = outbound.send_audio(frame).await {
            error!(error = %e, "Error in sender");
            break SenderExit::Failed(e);
        }
        sent += 1;
    };
    debug!(frames = sent, "Sender finished");
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::transport::mock::pair;

    #[tokio::test]
    async fn test_frames_are_sent_in_order() {
        let (sink, _stream, recorder, _inbound) = pair();
        let (tx, rx) = mpsc::channel(8);
        for tag in 0..4u8 {
            tx.send(Bytes::from(vec![tag; 4])).await.unwrap();
        }
        drop(tx);

        let exit = run_sender(rx, Arc::new(Outbound::new(Box::new(sink))), CancellationToken::new()).await;

        assert!(matches!(exit, SenderExit::CaptureEnded));
        let tags: Vec<u8> = recorder.binaries().iter().map(|b| b[0]).collect();
        assert_eq!(tags, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_write_failure_ends_sender() {
        let (sink, _stream, recorder, _inbound) = pair();
        recorder.fail_sends();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Bytes::from_static(&[1])).await.unwrap();

        let exit = run_sender(rx, Arc::new(Outbound::new(Box::new(sink))), CancellationToken::new()).await;

        assert!(matches!(exit, SenderExit::Failed(TransportError::Closed)));
        assert!(recorder.binaries().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_sender() {
        let (sink, _stream, _recorder, _inbound) = pair();
        let (_tx, rx) = mpsc::channel::<Bytes>(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let exit = run_sender(rx, Arc::new(Outbound::new(Box::new(sink))), cancel).await;
        assert!(matches!(exit, SenderExit::Cancelled));
    }
}
