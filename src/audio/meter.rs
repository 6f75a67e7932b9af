//! Input loudness metering.
//!
//! Raw amplitude is summarized as RMS, mapped to decibels and normalized to
//! `[0, 1]` with a −50 dB floor, which is roughly the noise floor of a
//! consumer microphone.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Everything at or below this is reported as silence.
const FLOOR_DB: f32 = -50.0;

/// Interval of the polled meter feed.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Root-mean-square amplitude of a PCM16 frame, pooled across all
/// interleaved channels, normalized to `[0, 1]`.
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean_square: f64 = samples
        .iter()
        .map(|&s| {
            let x = f64::from(s) / 32768.0;
            x * x
        })
        .sum::<f64>()
        / samples.len() as f64;
    mean_square.sqrt() as f32
}

/// Convert an RMS amplitude to a normalized `[0, 1]` loudness level.
pub fn level_from_rms(rms: f32) -> f32 {
    let db = if rms == 0.0 {
        FLOOR_DB
    } else {
        20.0 * rms.log10()
    };
    ((db - FLOOR_DB) / -FLOOR_DB).clamp(0.0, 1.0)
}

/// One meter feed. The engine runs two independent instances: one updated
/// synchronously per captured frame, one polled on [`POLL_INTERVAL`] for UI
/// smoothing; both report through the same callback.
#[derive(Debug, Default)]
pub struct VolumeMeter {
    level_bits: AtomicU32,
}

impl VolumeMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a new RMS reading into the meter and return the normalized level.
    pub fn update(&self, rms: f32) -> f32 {
        let level = level_from_rms(rms);
        self.level_bits.store(level.to_bits(), Ordering::Relaxed);
        level
    }

    /// Last reported level.
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }
}
