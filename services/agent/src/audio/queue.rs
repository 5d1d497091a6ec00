//! The hand-off between the protocol receiver and the playback thread.

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A dequeued frame and the generation it was pushed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFrame {
    pub generation: u64,
    pub data: Bytes,
}

/// Ordered, thread-safe queue of agent audio frames awaiting playback.
///
/// Every frame is stamped with the queue's generation when it is pushed.
/// [`PlaybackQueue::clear`] discards the backlog and bumps the generation, so
/// a frame that the playback thread had already dequeued when the clear
/// happened is still recognised as stale and skipped.
#[derive(Clone, Debug)]
pub struct PlaybackQueue {
    tx: Sender<(u64, Bytes)>,
    rx: Receiver<(u64, Bytes)>,
    generation: Arc<AtomicU64>,
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Appends a frame. Never blocks.
    pub fn push(&self, frame: Bytes) {
        let generation = self.generation.load(Ordering::Acquire);
        // Cannot fail: `self` keeps a receiver alive.
        let _ = self.tx.send((generation, frame));
    }

    /// Drops every frame that has not been played yet and returns how many
    /// were discarded. Safe to call while another thread is popping.
    pub fn clear(&self) -> usize {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.rx.try_iter().count()
    }

    /// Waits up to `timeout` for the next frame that survived every clear.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<QueuedFrame> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok((generation, data)) if generation == self.generation() => {
                    return Some(QueuedFrame { generation, data });
                }
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None;
                }
            }
        }
    }

    /// Incremented by every [`PlaybackQueue::clear`].
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
