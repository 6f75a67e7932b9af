//! Staleness barrier and the two-phase interruption flush.
//!
//! When the agent is interrupted, everything the server already streamed
//! for the cancelled utterance must never be heard: buffers still queued
//! are flushed immediately, and buffers already handed to the device are
//! masked by dropping the gain to near-zero (not literal zero, which would
//! click) until a second, delayed flush has caught them too.

use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::audio::output::AudioOutput;
use crate::audio::queue::PlaybackQueue;

/// Delay before the prior gain is restored and the second flush runs. Long
/// enough to cover buffers in flight to the device at interruption time.
pub const RESTORE_DELAY: Duration = Duration::from_secs(2);

/// Fade target during the flush window.
pub const FADE_GAIN: f32 = 1e-4;

/// Tracks the highest interrupted event id and executes the fade/flush.
///
/// Duplicate or out-of-order interruption ids are accepted as-is, without
/// validation, but the stored barrier is merged with `max` so it never
/// moves backwards.
pub struct InterruptionController {
    barrier: AtomicU64,
    /// Bumped per interruption; a delayed restore only applies if no newer
    /// interruption has superseded it.
    generation: AtomicU64,
    /// The caller-facing output volume to restore after the fade window.
    restore_gain_bits: AtomicU32,
}

impl Default for InterruptionController {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptionController {
    pub fn new() -> Self {
        Self {
            barrier: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            restore_gain_bits: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    pub fn barrier(&self) -> u64 {
        self.barrier.load(Ordering::SeqCst)
    }

    /// Whether audio tagged `event_id` is still current. Checked when a
    /// chunk arrives, again after decode (the barrier may have advanced
    /// concurrently), and once more by the playback task before scheduling.
    pub fn accepts(&self, event_id: u64) -> bool {
        event_id > self.barrier()
    }

    /// The volume that a delayed restore will bring the sink back to.
    pub fn set_restore_gain(&self, gain: f32) {
        self.restore_gain_bits
            .store(gain.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn restore_gain(&self) -> f32 {
        f32::from_bits(self.restore_gain_bits.load(Ordering::Relaxed))
    }

    /// Execute an interruption: advance the barrier, fade, flush, stop the
    /// active playback, and schedule the delayed restore + second flush.
    pub fn interrupt(
        self: &Arc<Self>,
        event_id: u64,
        queue: &Arc<PlaybackQueue>,
        output: &Arc<dyn AudioOutput>,
    ) {
        self.barrier.fetch_max(event_id, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        output.set_gain(FADE_GAIN);
        let dropped = queue.flush();
        output.stop();
        debug!(
            target: "Engine/Interrupt",
            "Interrupted at event {event_id}: barrier {}, {dropped} queued chunks dropped",
            self.barrier()
        );

        let controller = self.clone();
        let queue = queue.clone();
        let output = output.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESTORE_DELAY).await;
            // A newer interruption owns the fade window now; leave its gain
            // alone but still flush whatever trickled in.
            if controller.generation.load(Ordering::SeqCst) == generation {
                output.set_gain(controller.restore_gain());
            }
            queue.flush();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::queue::AudioChunk;
    use crate::testutil::MockOutput;

    fn chunk(event_id: u64) -> AudioChunk {
        AudioChunk {
            event_id,
            samples: vec![0; 4],
        }
    }

    #[test]
    fn barrier_never_decreases() {
        let controller = InterruptionController::new();
        controller.barrier.fetch_max(5, Ordering::SeqCst);
        controller.barrier.fetch_max(3, Ordering::SeqCst);
        assert_eq!(controller.barrier(), 5);
        assert!(!controller.accepts(5));
        assert!(!controller.accepts(4));
        assert!(controller.accepts(6));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_fades_flushes_and_restores() {
        let controller = Arc::new(InterruptionController::new());
        let queue = Arc::new(PlaybackQueue::new());
        let output = MockOutput::new();
        let sink: Arc<dyn AudioOutput> = output.clone();

        controller.set_restore_gain(0.8);
        queue.push(chunk(1));
        queue.push(chunk(2));

        controller.interrupt(2, &queue, &sink);
        assert_eq!(controller.barrier(), 2);
        assert!(queue.is_empty());
        assert_eq!(sink.gain(), FADE_GAIN);
        assert_eq!(output.stop_count(), 1);

        // Stale audio decoded after the fact is still rejected.
        assert!(!controller.accepts(2));

        tokio::time::sleep(RESTORE_DELAY + Duration::from_millis(10)).await;
        assert_eq!(sink.gain(), 0.8);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_restore_leaves_gain_alone() {
        let controller = Arc::new(InterruptionController::new());
        let queue = Arc::new(PlaybackQueue::new());
        let output = MockOutput::new();
        let sink: Arc<dyn AudioOutput> = output.clone();

        controller.interrupt(1, &queue, &sink);
        tokio::time::sleep(Duration::from_secs(1)).await;
        // Second interruption mid-window; the first restore must not undo
        // its fade.
        controller.interrupt(2, &queue, &sink);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(sink.gain(), FADE_GAIN);

        // The second restore applies normally.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.gain(), 1.0);
    }
}
