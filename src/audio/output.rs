//! Render sink: scheduled PCM buffers with completion signaling and gain
//! control, implemented on cpal.
//!
//! cpal streams are not `Send`, so the production sink parks its stream on
//! a dedicated thread and shares a buffer deque with the device callback.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use log::{error, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::ResourceError;

const THREAD_POLL: Duration = Duration::from_millis(50);

/// A render sink for PCM16 mono audio.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Queue samples for rendering after everything already scheduled. The
    /// returned receiver resolves once the buffer has been fully consumed;
    /// a receive error means the buffer was discarded, which callers should
    /// treat the same as completion.
    fn schedule(&self, samples: Vec<i16>) -> oneshot::Receiver<()>;

    /// Discard buffers that have not reached the device yet.
    fn stop(&self);

    fn gain(&self) -> f32;

    fn set_gain(&self, gain: f32);

    /// Release the device. Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait AudioOutputFactory: Send + Sync {
    async fn create(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, ResourceError>;
}

struct ScheduledBuffer {
    samples: Vec<f32>,
    pos: usize,
    done: Option<oneshot::Sender<()>>,
}

struct OutputShared {
    pending: Mutex<VecDeque<ScheduledBuffer>>,
    gain_bits: AtomicU32,
    device_rate: AtomicU32,
    stop_thread: AtomicBool,
}

/// cpal-backed render sink.
pub struct CpalOutput {
    shared: Arc<OutputShared>,
    sample_rate: u32,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl AudioOutput for CpalOutput {
    fn schedule(&self, samples: Vec<i16>) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();

        let device_rate = self.shared.device_rate.load(Ordering::Relaxed);
        let mut buffer: Vec<f32> = samples
            .iter()
            .map(|&s| f32::from(s) / 32768.0)
            .collect();
        if device_rate != 0 && device_rate != self.sample_rate {
            buffer = resample(&buffer, self.sample_rate, device_rate);
        }

        let Ok(mut pending) = self.shared.pending.lock() else {
            return done_rx;
        };
        pending.push_back(ScheduledBuffer {
            samples: buffer,
            pos: 0,
            done: Some(done_tx),
        });
        done_rx
    }

    fn stop(&self) {
        let Ok(mut pending) = self.shared.pending.lock() else {
            return;
        };
        // Dropping the completion senders wakes waiters with an error, which
        // they treat as "buffer is gone".
        pending.clear();
    }

    fn gain(&self) -> f32 {
        f32::from_bits(self.shared.gain_bits.load(Ordering::Relaxed))
    }

    fn set_gain(&self, gain: f32) {
        self.shared
            .gain_bits
            .store(gain.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();
        self.shared.stop_thread.store(true, Ordering::Relaxed);
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

/// Factory producing [`CpalOutput`] sinks on the default render device.
#[derive(Default)]
pub struct CpalOutputFactory;

impl CpalOutputFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioOutputFactory for CpalOutputFactory {
    async fn create(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, ResourceError> {
        let shared = Arc::new(OutputShared {
            pending: Mutex::new(VecDeque::new()),
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            device_rate: AtomicU32::new(0),
            stop_thread: AtomicBool::new(false),
        });

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("audio-render".to_string())
            .spawn(move || render_thread(thread_shared, sample_rate, ready_tx))
            .map_err(|e| ResourceError::Device(e.to_string()))?;

        let ready = tokio::task::spawn_blocking(move || ready_rx.recv())
            .await
            .map_err(|e| ResourceError::Device(e.to_string()))?
            .map_err(|e| ResourceError::Device(e.to_string()))?;
        ready?;

        Ok(Arc::new(CpalOutput {
            shared,
            sample_rate,
            join: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        }))
    }
}

fn render_thread(
    shared: Arc<OutputShared>,
    sample_rate: u32,
    ready_tx: std::sync::mpsc::Sender<Result<(), ResourceError>>,
) {
    let stream = match build_output_stream(&shared, sample_rate) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    while !shared.stop_thread.load(Ordering::Relaxed) {
        std::thread::sleep(THREAD_POLL);
    }
    drop(stream);
}

fn build_output_stream(
    shared: &Arc<OutputShared>,
    sample_rate: u32,
) -> Result<cpal::Stream, ResourceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(ResourceError::NoOutputDevice)?;
    info!(
        target: "Audio/Render",
        "Using output device: {}",
        device.name().unwrap_or_default()
    );

    let supported: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| ResourceError::Device(e.to_string()))?
        .collect();
    if supported.is_empty() {
        return Err(ResourceError::NoSupportedConfig);
    }

    let config: StreamConfig = supported
        .iter()
        .find(|c| c.min_sample_rate().0 <= sample_rate && c.max_sample_rate().0 >= sample_rate)
        .cloned()
        .map(|c| c.with_sample_rate(cpal::SampleRate(sample_rate)))
        .unwrap_or_else(|| {
            let first = supported[0].clone();
            let rate = first.min_sample_rate();
            first.with_sample_rate(rate)
        })
        .into();

    let device_rate = config.sample_rate.0;
    let channels = config.channels as usize;
    shared.device_rate.store(device_rate, Ordering::Relaxed);
    if device_rate != sample_rate {
        warn!(
            target: "Audio/Render",
            "Device does not support {sample_rate} Hz, resampling to {device_rate} Hz"
        );
    }

    let callback_shared = shared.clone();
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                fill_output(&callback_shared, data, channels);
            },
            move |err| {
                error!(target: "Audio/Render", "Output stream error: {err}");
            },
            None,
        )
        .map_err(|e| ResourceError::Stream(e.to_string()))?;
    stream
        .play()
        .map_err(|e| ResourceError::Stream(e.to_string()))?;
    Ok(stream)
}

fn fill_output(shared: &OutputShared, data: &mut [f32], channels: usize) {
    let gain = f32::from_bits(shared.gain_bits.load(Ordering::Relaxed));
    let Ok(mut pending) = shared.pending.lock() else {
        data.fill(0.0);
        return;
    };

    for frame in data.chunks_mut(channels) {
        let mut sample = 0.0;
        while let Some(buffer) = pending.front_mut() {
            if buffer.pos < buffer.samples.len() {
                sample = buffer.samples[buffer.pos] * gain;
                buffer.pos += 1;
                break;
            }
            if let Some(done) = buffer.done.take() {
                let _ = done.send(());
            }
            pending.pop_front();
        }
        // Mono source: duplicate into every device channel.
        for slot in frame {
            *slot = sample;
        }
    }
}

fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
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
    fn resample_preserves_duration() {
        let samples = vec![0.5f32; 16_000];
        let out = resample(&samples, 16_000, 48_000);
        assert_eq!(out.len(), 48_000);
        let back = resample(&out, 48_000, 16_000);
        assert_eq!(back.len(), 16_000);
    }

    #[test]
    fn fill_output_applies_gain_and_completes() {
        let shared = OutputShared {
            pending: Mutex::new(VecDeque::new()),
            gain_bits: AtomicU32::new(0.5f32.to_bits()),
            device_rate: AtomicU32::new(16_000),
            stop_thread: AtomicBool::new(false),
        };
        let (done_tx, mut done_rx) = oneshot::channel();
        shared.pending.lock().unwrap().push_back(ScheduledBuffer {
            samples: vec![1.0, 1.0],
            pos: 0,
            done: Some(done_tx),
        });

        let mut data = [0.0f32; 8];
        fill_output(&shared, &mut data, 2);

        // Two mono samples duplicated across two channels at half gain,
        // then silence.
        assert_eq!(&data[..4], &[0.5, 0.5, 0.5, 0.5]);
        assert_eq!(&data[4..], &[0.0, 0.0, 0.0, 0.0]);
        assert!(done_rx.try_recv().is_ok());
        assert!(shared.pending.lock().unwrap().is_empty());
    }
}
