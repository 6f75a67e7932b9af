//! In-process fakes: a scriptable transport and audio devices, plus a
//! recording callbacks sink. These drive a complete session without any
//! network or audio hardware, and are public so downstream crates can do
//! the same in their tests.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::audio::input::{AudioInput, AudioInputFactory, FrameHandler};
use crate::audio::output::{AudioOutput, AudioOutputFactory};
use crate::error::ResourceError;
use crate::events::{Mode, Role, SessionCallbacks, Status};
use crate::transport::{Transport, TransportError, TransportEvent, TransportFactory};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Transport

pub struct MockTransport {
    sent_tx: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
    close_count: AtomicUsize,
    fail_sends: AtomicBool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, text: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("mock send failure".to_string()));
        }
        let _ = self.sent_tx.send(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out exactly one pre-wired transport; a second `create` call fails.
pub struct MockTransportFactory {
    slot: Mutex<Option<(Arc<MockTransport>, mpsc::Receiver<TransportEvent>)>>,
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        _url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), TransportError> {
        let Ok(mut slot) = self.slot.lock() else {
            return Err(TransportError::Connect("mock poisoned".to_string()));
        };
        match slot.take() {
            Some((transport, events)) => Ok((transport, events)),
            None => Err(TransportError::Connect(
                "mock transport already consumed".to_string(),
            )),
        }
    }
}

/// The server side of a mock transport: inject inbound frames, observe
/// outbound ones.
pub struct MockServer {
    inbound_tx: mpsc::Sender<TransportEvent>,
    sent_rx: mpsc::UnboundedReceiver<String>,
    pub transport: Arc<MockTransport>,
}

impl MockServer {
    pub async fn push_text(&self, text: String) {
        let _ = self.inbound_tx.send(TransportEvent::Text(text)).await;
    }

    pub async fn push_json(&self, value: Value) {
        self.push_text(value.to_string()).await;
    }

    pub async fn push_binary(&self, data: Vec<u8>) {
        let _ = self.inbound_tx.send(TransportEvent::Binary(data)).await;
    }

    pub async fn push_closed(&self, error: Option<String>) {
        let _ = self.inbound_tx.send(TransportEvent::Closed { error }).await;
    }

    /// Next client-to-server frame, parsed; None after [`RECV_TIMEOUT`].
    pub async fn next_sent(&mut self) -> Option<Value> {
        let text = tokio::time::timeout(RECV_TIMEOUT, self.sent_rx.recv())
            .await
            .ok()??;
        serde_json::from_str(&text).ok()
    }

    pub fn try_next_sent(&mut self) -> Option<Value> {
        let text = self.sent_rx.try_recv().ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.transport.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.transport.close_count.load(Ordering::SeqCst)
    }
}

/// Build a mock transport pair: the factory goes into the engine, the
/// server handle stays with the test.
pub fn mock_transport() -> (MockTransportFactory, MockServer) {
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(MockTransport {
        sent_tx,
        closed: AtomicBool::new(false),
        close_count: AtomicUsize::new(0),
        fail_sends: AtomicBool::new(false),
    });
    let factory = MockTransportFactory {
        slot: Mutex::new(Some((transport.clone(), inbound_rx))),
    };
    let server = MockServer {
        inbound_tx,
        sent_rx,
        transport,
    };
    (factory, server)
}

// ---------------------------------------------------------------------------
// Audio input

pub struct MockInput {
    closed: AtomicBool,
    close_count: AtomicUsize,
}

#[async_trait]
impl AudioInput for MockInput {
    fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Capture device whose frames the test produces by hand via
/// [`emit_frame`](Self::emit_frame).
pub struct MockInputFactory {
    handler: Mutex<Option<FrameHandler>>,
    created_rate: AtomicU32,
    fail: bool,
    pub input: Arc<MockInput>,
}

impl MockInputFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(None),
            created_rate: AtomicU32::new(0),
            fail: false,
            input: Arc::new(MockInput {
                closed: AtomicBool::new(false),
                close_count: AtomicUsize::new(0),
            }),
        })
    }

    /// A factory whose `create` fails, for startup-abort tests.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(None),
            created_rate: AtomicU32::new(0),
            fail: true,
            input: Arc::new(MockInput {
                closed: AtomicBool::new(false),
                close_count: AtomicUsize::new(0),
            }),
        })
    }

    pub fn created_rate(&self) -> u32 {
        self.created_rate.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.input.close_count.load(Ordering::SeqCst)
    }

    /// Push one captured frame through the registered handler, as the
    /// capture thread would. Returns false if no session registered one.
    pub fn emit_frame(&self, samples: Vec<i16>, rms: f32) -> bool {
        let handler = {
            let Ok(slot) = self.handler.lock() else {
                return false;
            };
            slot.clone()
        };
        match handler {
            Some(handler) => {
                handler(samples, rms);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl AudioInputFactory for MockInputFactory {
    async fn create(
        &self,
        sample_rate: u32,
        on_frame: FrameHandler,
    ) -> Result<Arc<dyn AudioInput>, ResourceError> {
        if self.fail {
            return Err(ResourceError::NoInputDevice);
        }
        self.created_rate.store(sample_rate, Ordering::SeqCst);
        if let Ok(mut slot) = self.handler.lock() {
            *slot = Some(on_frame);
        }
        Ok(self.input.clone())
    }
}

// ---------------------------------------------------------------------------
// Audio output

/// Render sink that records scheduled buffers. Completions fire
/// immediately unless held with [`hold_completions`](Self::hold_completions).
pub struct MockOutput {
    scheduled: Mutex<Vec<Vec<i16>>>,
    pending: Mutex<Vec<oneshot::Sender<()>>>,
    gain_bits: AtomicU32,
    stop_count: AtomicUsize,
    close_count: AtomicUsize,
    hold: AtomicBool,
}

impl MockOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scheduled: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            stop_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            hold: AtomicBool::new(false),
        })
    }

    pub fn hold_completions(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    /// Complete every held buffer, in schedule order.
    pub fn release_completions(&self) {
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        for done in pending.drain(..) {
            let _ = done.send(());
        }
    }

    pub fn scheduled(&self) -> Vec<Vec<i16>> {
        self.scheduled
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioOutput for MockOutput {
    fn schedule(&self, samples: Vec<i16>) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if let Ok(mut scheduled) = self.scheduled.lock() {
            scheduled.push(samples);
        }
        if self.hold.load(Ordering::SeqCst) {
            if let Ok(mut pending) = self.pending.lock() {
                pending.push(done_tx);
            }
        } else {
            let _ = done_tx.send(());
        }
        done_rx
    }

    fn stop(&self) {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        // Dropping held senders tells waiters the buffers are gone.
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }

    fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::SeqCst))
    }

    fn set_gain(&self, gain: f32) {
        self.gain_bits.store(gain.to_bits(), Ordering::SeqCst);
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockOutputFactory {
    created_rate: AtomicU32,
    fail: bool,
    pub output: Arc<MockOutput>,
}

impl MockOutputFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created_rate: AtomicU32::new(0),
            fail: false,
            output: MockOutput::new(),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            created_rate: AtomicU32::new(0),
            fail: true,
            output: MockOutput::new(),
        })
    }

    pub fn created_rate(&self) -> u32 {
        self.created_rate.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioOutputFactory for MockOutputFactory {
    async fn create(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, ResourceError> {
        if self.fail {
            return Err(ResourceError::NoOutputDevice);
        }
        self.created_rate.store(sample_rate, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}

// ---------------------------------------------------------------------------
// Callbacks

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent {
    Connect(String),
    Disconnect,
    Message { text: String, role: Role },
    Error { message: String, detail: Option<String> },
    Status(Status),
    Mode(Mode),
    Volume(f32),
}

/// Callbacks sink that records every invocation for later assertions.
#[derive(Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<CallbackEvent>>,
}

impl RecordingCallbacks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, event: CallbackEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CallbackEvent::Status(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn modes(&self) -> Vec<Mode> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CallbackEvent::Mode(mode) => Some(mode),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CallbackEvent::Error { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<(String, Role)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CallbackEvent::Message { text, role } => Some((text, role)),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CallbackEvent::Connect(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn disconnect_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, CallbackEvent::Disconnect))
            .count()
    }
}

impl SessionCallbacks for RecordingCallbacks {
    fn on_connect(&self, conversation_id: &str) {
        self.record(CallbackEvent::Connect(conversation_id.to_string()));
    }

    fn on_disconnect(&self) {
        self.record(CallbackEvent::Disconnect);
    }

    fn on_message(&self, text: &str, role: Role) {
        self.record(CallbackEvent::Message {
            text: text.to_string(),
            role,
        });
    }

    fn on_error(&self, message: &str, detail: Option<&str>) {
        self.record(CallbackEvent::Error {
            message: message.to_string(),
            detail: detail.map(str::to_string),
        });
    }

    fn on_status_change(&self, status: Status) {
        self.record(CallbackEvent::Status(status));
    }

    fn on_mode_change(&self, mode: Mode) {
        self.record(CallbackEvent::Mode(mode));
    }

    fn on_volume(&self, level: f32) {
        self.record(CallbackEvent::Volume(level));
    }
}
