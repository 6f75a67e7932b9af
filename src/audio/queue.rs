//! Ordered buffer between the dispatcher and the playback task.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Decoded agent audio. Produced once by the dispatcher, consumed exactly
/// once by the playback task.
#[derive(Debug)]
pub struct AudioChunk {
    pub event_id: u64,
    pub samples: Vec<i16>,
}

#[derive(Default)]
struct Inner {
    chunks: VecDeque<AudioChunk>,
    /// Armed on every push; disarmed when the drained edge is taken. This is
    /// what makes the drained signal edge-triggered: it fires once per
    /// non-empty→empty transition and refilling re-arms it.
    drained_armed: bool,
}

/// Single-writer/single-reader ordered queue of [`AudioChunk`], guarded by
/// one lock. Chunks reach the consumer in strict enqueue order.
#[derive(Default)]
pub struct PlaybackQueue {
    inner: Mutex<Inner>,
    refill: Notify,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, chunk: AudioChunk) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.chunks.push_back(chunk);
        inner.drained_armed = true;
        drop(inner);
        self.refill.notify_one();
    }

    pub fn pop(&self) -> Option<AudioChunk> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        inner.chunks.pop_front()
    }

    /// Drop everything queued; returns how many chunks were discarded. The
    /// playback task is woken so a pending drained edge still fires.
    pub fn flush(&self) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let dropped = inner.chunks.len();
        inner.chunks.clear();
        drop(inner);
        self.refill.notify_one();
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map(|inner| inner.chunks.is_empty()).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.chunks.len()).unwrap_or(0)
    }

    /// Consume the drained edge: true exactly once after the queue becomes
    /// empty, then not again until it has been refilled.
    pub fn take_drained_edge(&self) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if inner.drained_armed && inner.chunks.is_empty() {
            inner.drained_armed = false;
            true
        } else {
            false
        }
    }

    /// Wait until something is pushed (or the queue is flushed).
    pub async fn wait_refill(&self) {
        self.refill.notified().await;
    }
}
