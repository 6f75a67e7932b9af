//! Capture source: microphone frames delivered as PCM16 mono at a fixed
//! session rate, each with a per-frame RMS reading.
//!
//! As with the render side, the cpal stream lives on its own thread. The
//! device callback downmixes to mono, resamples to the session rate, and
//! hands fixed-size frames to the registered handler. The handler is the
//! bounded boundary into the engine and must never block.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use log::{error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::audio::meter;
use crate::error::ResourceError;

/// Samples per emitted frame, at the session rate. 4096 samples at 16 kHz
/// is a 256 ms frame.
pub const FRAME_SAMPLES: usize = 4096;

/// Capture rate most hardware actually supports; frames are resampled down
/// to the session rate from here when needed.
const PREFERRED_HW_RATE: u32 = 48_000;

const THREAD_POLL: Duration = Duration::from_millis(50);

/// Receives `(pcm16 mono frame, rms)` on the capture thread.
pub type FrameHandler = Arc<dyn Fn(Vec<i16>, f32) + Send + Sync>;

/// A live capture source.
#[async_trait]
pub trait AudioInput: Send + Sync {
    fn is_active(&self) -> bool;

    /// Release the device. Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait AudioInputFactory: Send + Sync {
    async fn create(
        &self,
        sample_rate: u32,
        on_frame: FrameHandler,
    ) -> Result<Arc<dyn AudioInput>, ResourceError>;
}

/// cpal-backed capture source.
pub struct CpalInput {
    stop_thread: Arc<AtomicBool>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl AudioInput for CpalInput {
    fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_thread.store(true, Ordering::Relaxed);
        let handle = {
            let Ok(mut join) = self.join.lock() else {
                return;
            };
            join.take()
        };
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

/// Factory producing [`CpalInput`] sources on the default capture device.
#[derive(Default)]
pub struct CpalInputFactory;

impl CpalInputFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioInputFactory for CpalInputFactory {
    async fn create(
        &self,
        sample_rate: u32,
        on_frame: FrameHandler,
    ) -> Result<Arc<dyn AudioInput>, ResourceError> {
        let stop_thread = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread_stop = stop_thread.clone();
        let handle = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || capture_thread(sample_rate, on_frame, thread_stop, ready_tx))
            .map_err(|e| ResourceError::Device(e.to_string()))?;

        let ready = tokio::task::spawn_blocking(move || ready_rx.recv())
            .await
            .map_err(|e| ResourceError::Device(e.to_string()))?
            .map_err(|e| ResourceError::Device(e.to_string()))?;
        ready?;

        Ok(Arc::new(CpalInput {
            stop_thread,
            join: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        }))
    }
}

fn capture_thread(
    sample_rate: u32,
    on_frame: FrameHandler,
    stop: Arc<AtomicBool>,
    ready_tx: std::sync::mpsc::Sender<Result<(), ResourceError>>,
) {
    let stream = match build_input_stream(sample_rate, on_frame) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(THREAD_POLL);
    }
    drop(stream);
}

fn build_input_stream(
    sample_rate: u32,
    on_frame: FrameHandler,
) -> Result<cpal::Stream, ResourceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(ResourceError::NoInputDevice)?;
    info!(
        target: "Audio/Capture",
        "Using input device: {}",
        device.name().unwrap_or_default()
    );

    let supported = device
        .supported_input_configs()
        .map_err(|e| ResourceError::Device(e.to_string()))?;

    // Prefer the session rate directly, else the common 48 kHz hardware
    // rate, else whatever the first config offers.
    let mut best = None;
    for config in supported {
        let (min, max) = (config.min_sample_rate().0, config.max_sample_rate().0);
        if min <= sample_rate && max >= sample_rate {
            best = Some(config.with_sample_rate(SampleRate(sample_rate)));
            break;
        }
        if min <= PREFERRED_HW_RATE && max >= PREFERRED_HW_RATE {
            best = Some(config.with_sample_rate(SampleRate(PREFERRED_HW_RATE)));
            break;
        }
        if best.is_none() {
            best = Some(config.with_max_sample_rate());
        }
    }
    let config: StreamConfig = best.ok_or(ResourceError::NoSupportedConfig)?.into();

    let hw_rate = config.sample_rate.0;
    let channels = config.channels as usize;
    info!(
        target: "Audio/Capture",
        "Capture config: {hw_rate} Hz, {channels} channel(s), emitting {sample_rate} Hz frames"
    );

    // Hardware samples needed to produce one session-rate frame.
    let hw_frame = (FRAME_SAMPLES as u64 * u64::from(hw_rate) / u64::from(sample_rate)) as usize;
    let mut pending: Vec<f32> = Vec::with_capacity(hw_frame * 2);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if channels == 1 {
                    pending.extend_from_slice(data);
                } else {
                    for frame in data.chunks(channels) {
                        pending.push(frame.iter().sum::<f32>() / channels as f32);
                    }
                }

                while pending.len() >= hw_frame {
                    let raw: Vec<f32> = pending.drain(..hw_frame).collect();
                    let mono = resample_to(&raw, hw_rate, sample_rate);
                    let pcm: Vec<i16> = mono
                        .iter()
                        .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                        .collect();
                    let rms = meter::rms(&pcm);
                    on_frame(pcm, rms);
                }
            },
            move |err| {
                error!(target: "Audio/Capture", "Capture stream error: {err}");
            },
            None,
        )
        .map_err(|e| ResourceError::Stream(e.to_string()))?;
    stream
        .play()
        .map_err(|e| ResourceError::Stream(e.to_string()))?;
    Ok(stream)
}

fn resample_to(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == 0 || dst_rate == 0 || src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = src_rate as f32 / dst_rate as f32;
    let out_len = (samples.len() as f32 / ratio) as usize;
    (0..out_len)
        .map(|i| {
            let src_idx = ((i as f32 * ratio) as usize).min(samples.len() - 1);
            samples[src_idx]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downsamples_48k_to_16k() {
        let samples: Vec<f32> = (0..4800).map(|i| i as f32).collect();
        let out = resample_to(&samples, 48_000, 16_000);
        assert_eq!(out.len(), 1600);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 3.0);
    }

    #[test]
    fn same_rate_is_identity() {
        let samples = vec![0.1f32, 0.2, 0.3];
        assert_eq!(resample_to(&samples, 16_000, 16_000), samples);
    }
}
