//! The protocol engine: a single event-loop task that owns all session
//! state and turns the inbound message stream into ordered side effects.
//!
//! Every state transition (playback scheduling, mode/status changes,
//! barrier advances) happens by applying one event at a time pulled from
//! one queue, so effects are strictly FIFO per session. Producers into that
//! queue are the transport read pump, the capture thread (across a bounded
//! boundary), the playback task's drained edge, and public commands.
//! Outbound sends and playback scheduling run on their own tasks and never
//! block dispatch.

use log::{debug, trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{Notify, mpsc, oneshot, watch};

use crate::audio::input::{AudioInput, AudioInputFactory, CpalInputFactory, FrameHandler};
use crate::audio::output::{AudioOutput, AudioOutputFactory, CpalOutputFactory};
use crate::audio::queue::{AudioChunk, PlaybackQueue};
use crate::audio::{meter, meter::VolumeMeter};
use crate::config::SessionConfig;
use crate::connection::SessionConnection;
use crate::error::SessionError;
use crate::events::{Mode, Role, SessionCallbacks, Status};
use crate::interrupt::InterruptionController;
use crate::protocol::{self, AudioEvent, InboundMessage, OutboundMessage};
use crate::transport::{Transport, TransportEvent, TransportFactory, WebSocketTransportFactory};

/// Bounded boundary between producers and the event loop.
const EVENT_QUEUE_CAPACITY: usize = 256;
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// The collaborating platform pieces a session is built on. Swap any of
/// them for mocks (see [`crate::testutil`]) to drive a session in-process.
pub struct Platform {
    pub transport: Arc<dyn TransportFactory>,
    pub audio_in: Arc<dyn AudioInputFactory>,
    pub audio_out: Arc<dyn AudioOutputFactory>,
}

impl Platform {
    /// Real WebSocket transport and default cpal devices.
    pub fn native() -> Self {
        Self {
            transport: Arc::new(WebSocketTransportFactory::new()),
            audio_in: Arc::new(CpalInputFactory::new()),
            audio_out: Arc::new(CpalOutputFactory::new()),
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::native()
    }
}

/// Values mirrored out of the event loop for lock-free external reads and
/// producer-side gating. Every state decision is still made in the loop.
struct SharedState {
    recording: AtomicBool,
    volume_bits: AtomicU32,
    /// Latest capture RMS, fed to the polled meter instance.
    latest_rms: AtomicU32,
}

impl SharedState {
    fn new() -> Self {
        Self {
            recording: AtomicBool::new(false),
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
            latest_rms: AtomicU32::new(0.0f32.to_bits()),
        }
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    fn set_volume(&self, volume: f32) {
        self.volume_bits.store(volume.to_bits(), Ordering::Relaxed);
    }
}

enum Command {
    SetVolume(f32),
    EndSession(oneshot::Sender<()>),
}

enum EngineEvent {
    Inbound(TransportEvent),
    Captured { samples: Vec<i16>, rms: f32 },
    PlaybackDrained,
    Command(Command),
}

/// Handle to a live conversation session.
///
/// Dropping the handle does not end the session; call
/// [`end_session`](Self::end_session).
pub struct Conversation {
    conversation_id: String,
    events_tx: mpsc::Sender<EngineEvent>,
    status_rx: watch::Receiver<Status>,
    mode_rx: watch::Receiver<Mode>,
    shared: Arc<SharedState>,
}

impl Conversation {
    /// Start a session against the real platform (WebSocket + cpal).
    pub async fn start(
        config: SessionConfig,
        callbacks: Arc<dyn SessionCallbacks>,
    ) -> Result<Self, SessionError> {
        Self::start_with(config, callbacks, Platform::native()).await
    }

    /// Start a session on an explicit [`Platform`].
    ///
    /// Acquisition order: connection, then capture, then render. Any step
    /// failing aborts the whole sequence and releases the prior steps.
    pub async fn start_with(
        config: SessionConfig,
        callbacks: Arc<dyn SessionCallbacks>,
        platform: Platform,
    ) -> Result<Self, SessionError> {
        callbacks.on_status_change(Status::Connecting);

        let (connection, transport_events) =
            match SessionConnection::connect(&config, platform.transport.as_ref()).await {
                Ok(established) => established,
                Err(e) => {
                    callbacks.on_status_change(Status::Disconnected);
                    return Err(e);
                }
            };

        let shared = Arc::new(SharedState::new());
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        // The capture thread hands frames across this bounded boundary; a
        // full queue drops the frame rather than blocking the device
        // callback. Paused capture is dropped right here, never queued.
        let on_frame: FrameHandler = {
            let shared = shared.clone();
            let events_tx = events_tx.clone();
            Arc::new(move |samples: Vec<i16>, rms: f32| {
                shared.latest_rms.store(rms.to_bits(), Ordering::Relaxed);
                if !shared.recording.load(Ordering::Relaxed) {
                    return;
                }
                if events_tx
                    .try_send(EngineEvent::Captured { samples, rms })
                    .is_err()
                {
                    warn!(target: "Engine/Capture", "Event queue full, dropping captured frame");
                }
            })
        };

        let input = match platform
            .audio_in
            .create(connection.input_sample_rate(), on_frame)
            .await
        {
            Ok(input) => input,
            Err(e) => {
                connection.close().await;
                callbacks.on_status_change(Status::Disconnected);
                return Err(e.into());
            }
        };

        let output = match platform
            .audio_out
            .create(connection.output_sample_rate())
            .await
        {
            Ok(output) => output,
            Err(e) => {
                input.close().await;
                connection.close().await;
                callbacks.on_status_change(Status::Disconnected);
                return Err(e.into());
            }
        };

        let queue = Arc::new(PlaybackQueue::new());
        let controller = Arc::new(InterruptionController::new());
        let shutdown = Arc::new(Notify::new());
        let transport = connection.transport();
        let conversation_id = connection.conversation_id().to_string();

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (status_tx, status_rx) = watch::channel(Status::Connecting);
        let (mode_tx, mode_rx) = watch::channel(Mode::Listening);

        tokio::spawn(outbound_writer(
            outbound_rx,
            transport.clone(),
            callbacks.clone(),
        ));
        tokio::spawn(forward_transport(transport_events, events_tx.clone()));
        tokio::spawn(playback_loop(
            queue.clone(),
            controller.clone(),
            output.clone(),
            events_tx.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(meter_poll_loop(
            shared.clone(),
            callbacks.clone(),
            shutdown.clone(),
        ));

        status_tx.send_replace(Status::Connected);
        callbacks.on_status_change(Status::Connected);
        callbacks.on_connect(&conversation_id);

        // Begin accepting input.
        shared.recording.store(true, Ordering::Relaxed);

        let engine = EngineLoop {
            status: Status::Connected,
            mode: Mode::Listening,
            callbacks,
            status_tx,
            mode_tx,
            queue,
            controller,
            input,
            output,
            transport,
            outbound_tx,
            shared: shared.clone(),
            capture_meter: VolumeMeter::new(),
            shutdown,
        };
        tokio::spawn(engine.run(events_rx));

        Ok(Self {
            conversation_id,
            events_tx,
            status_rx,
            mode_rx,
            shared,
        })
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn status(&self) -> Status {
        *self.status_rx.borrow()
    }

    pub fn mode(&self) -> Mode {
        *self.mode_rx.borrow()
    }

    pub fn output_volume(&self) -> f32 {
        self.shared.volume()
    }

    /// Set the render gain, clamped to `[0, 1]`. Applied through the event
    /// loop so it serializes with interruption fades.
    pub fn set_output_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        let _ = self
            .events_tx
            .try_send(EngineEvent::Command(Command::SetVolume(volume)));
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::Relaxed)
    }

    /// Resume streaming captured audio. Does not touch acquired devices.
    pub fn start_recording(&self) {
        self.shared.recording.store(true, Ordering::Relaxed);
    }

    /// Pause streaming captured audio; frames captured while paused are
    /// dropped, never queued for later send.
    pub fn stop_recording(&self) {
        self.shared.recording.store(false, Ordering::Relaxed);
    }

    /// End the session. A no-op unless currently connected; otherwise
    /// releases input, output, and connection in that fixed order and
    /// resolves once the session is fully torn down.
    pub async fn end_session(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .events_tx
            .send(EngineEvent::Command(Command::EndSession(ack_tx)))
            .await
            .is_err()
        {
            // Loop already gone; the session is torn down.
            return;
        }
        let _ = ack_rx.await;
    }
}

/// Loop-owned session state plus every resource the dispatcher drives.
struct EngineLoop {
    status: Status,
    mode: Mode,
    callbacks: Arc<dyn SessionCallbacks>,
    status_tx: watch::Sender<Status>,
    mode_tx: watch::Sender<Mode>,
    queue: Arc<PlaybackQueue>,
    controller: Arc<InterruptionController>,
    input: Arc<dyn AudioInput>,
    output: Arc<dyn AudioOutput>,
    transport: Arc<dyn Transport>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    shared: Arc<SharedState>,
    /// Event-driven meter instance (the polled one lives in its own task).
    capture_meter: VolumeMeter,
    shutdown: Arc<Notify>,
}

impl EngineLoop {
    async fn run(mut self, mut events_rx: mpsc::Receiver<EngineEvent>) {
        debug!(target: "Engine", "Dispatch loop started");
        while let Some(event) = events_rx.recv().await {
            match event {
                EngineEvent::Inbound(TransportEvent::Text(text)) => self.handle_inbound(&text),
                EngineEvent::Inbound(TransportEvent::Binary(_)) => {
                    self.callbacks
                        .on_error("unexpected binary frame from server", None);
                }
                EngineEvent::Inbound(TransportEvent::Closed { error }) => {
                    self.handle_transport_closed(error).await;
                    break;
                }
                EngineEvent::Captured { samples, rms } => self.handle_captured(samples, rms),
                EngineEvent::PlaybackDrained => self.set_mode(Mode::Listening),
                EngineEvent::Command(Command::SetVolume(volume)) => {
                    self.shared.set_volume(volume);
                    self.controller.set_restore_gain(volume);
                    self.output.set_gain(volume);
                }
                EngineEvent::Command(Command::EndSession(ack)) => {
                    let ended = self.handle_end_session().await;
                    let _ = ack.send(());
                    if ended {
                        break;
                    }
                }
            }
        }
        debug!(target: "Engine", "Dispatch loop ended");
    }

    fn handle_inbound(&mut self, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                self.callbacks
                    .on_error("failed to parse incoming message", Some(&e.to_string()));
                return;
            }
        };

        match message {
            InboundMessage::Audio(event) => self.handle_audio(event),
            InboundMessage::Interruption { event_id } => {
                self.controller
                    .interrupt(event_id, &self.queue, &self.output);
                self.set_mode(Mode::Listening);
            }
            InboundMessage::AgentResponse { text } => self.callbacks.on_message(&text, Role::Ai),
            InboundMessage::UserTranscript { text } => self.callbacks.on_message(&text, Role::User),
            InboundMessage::Ping { event_id, ping_ms } => {
                trace!(target: "Engine", "Ping {event_id} (ping_ms {ping_ms:?})");
                self.send_outbound(OutboundMessage::Pong { event_id });
            }
            InboundMessage::InternalDiagnostic { kind } => {
                trace!(target: "Engine", "Ignoring diagnostic frame '{kind}'");
            }
            InboundMessage::Unknown { kind } => {
                self.callbacks
                    .on_error(&format!("unrecognized message type '{kind}'"), None);
            }
            InboundMessage::ConversationMetadata(_) => {
                // Only valid as the handshake reply; duplicate metadata
                // mid-session carries nothing actionable.
                debug!(target: "Engine", "Ignoring repeated conversation metadata");
            }
        }
    }

    fn handle_audio(&mut self, event: AudioEvent) {
        if !self.controller.accepts(event.event_id) {
            debug!(
                target: "Engine",
                "Dropping stale audio chunk {} (barrier {})",
                event.event_id,
                self.controller.barrier()
            );
            return;
        }
        let samples = match protocol::decode_pcm16(&event.audio_base_64) {
            Ok(samples) => samples,
            Err(e) => {
                self.callbacks
                    .on_error("undecodable audio payload", Some(&e.to_string()));
                return;
            }
        };
        // The barrier may have advanced while the chunk was being decoded;
        // stale audio must not be enqueued.
        if !self.controller.accepts(event.event_id) {
            return;
        }
        self.queue.push(AudioChunk {
            event_id: event.event_id,
            samples,
        });
        self.set_mode(Mode::Speaking);
    }

    fn handle_captured(&mut self, samples: Vec<i16>, rms: f32) {
        // Frames accepted at the boundary but paused since then are dropped.
        if !self.shared.recording.load(Ordering::Relaxed) {
            return;
        }
        let level = self.capture_meter.update(rms);
        self.callbacks.on_volume(level);
        self.send_outbound(OutboundMessage::UserAudioChunk {
            audio: protocol::encode_pcm16(&samples),
        });
    }

    async fn handle_transport_closed(&mut self, error: Option<String>) {
        if let Some(detail) = error {
            self.callbacks.on_error("transport failure", Some(&detail));
        }
        // Terminal: release devices and jump straight to Disconnected.
        self.input.close().await;
        self.output.close().await;
        self.set_status(Status::Disconnected);
        self.callbacks.on_disconnect();
        self.shutdown.notify_waiters();
    }

    /// Returns true when the session actually ended.
    async fn handle_end_session(&mut self) -> bool {
        if self.status != Status::Connected {
            return false;
        }
        self.set_status(Status::Disconnecting);
        self.input.close().await;
        self.output.close().await;
        self.transport.close().await;
        self.set_status(Status::Disconnected);
        self.callbacks.on_disconnect();
        self.shutdown.notify_waiters();
        true
    }

    fn send_outbound(&self, message: OutboundMessage) {
        // try_send keeps dispatch non-blocking; the writer task reports
        // transport-level failures itself.
        if self.outbound_tx.try_send(message).is_err() {
            self.callbacks
                .on_error("outbound queue full, message dropped", None);
        }
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.mode == mode {
            return;
        }
        self.mode = mode;
        self.mode_tx.send_replace(mode);
        self.callbacks.on_mode_change(mode);
    }

    fn set_status(&mut self, status: Status) {
        if self.status == status {
            return;
        }
        self.status = status;
        self.status_tx.send_replace(status);
        self.callbacks.on_status_change(status);
    }
}

/// Serializes outbound frames onto the transport. Send failures are
/// reported through the error callback and never retried.
async fn outbound_writer(
    mut outbound_rx: mpsc::Receiver<OutboundMessage>,
    transport: Arc<dyn Transport>,
    callbacks: Arc<dyn SessionCallbacks>,
) {
    while let Some(message) = outbound_rx.recv().await {
        let text = message.to_json();
        if let Err(e) = transport.send(&text).await {
            warn!(target: "Engine/Send", "Outbound send failed: {e}");
            callbacks
                .on_error("failed to send outbound message", Some(&e.to_string()));
        }
    }
}

/// Feeds transport events into the single-consumer engine queue, preserving
/// arrival order.
async fn forward_transport(
    mut transport_rx: mpsc::Receiver<TransportEvent>,
    events_tx: mpsc::Sender<EngineEvent>,
) {
    while let Some(event) = transport_rx.recv().await {
        let closed = matches!(event, TransportEvent::Closed { .. });
        if events_tx.send(EngineEvent::Inbound(event)).await.is_err() {
            return;
        }
        if closed {
            return;
        }
    }
}

/// Consumes the playback queue one chunk at a time, re-checking the
/// staleness barrier right before each schedule, and reports the drained
/// edge back to the dispatcher.
async fn playback_loop(
    queue: Arc<PlaybackQueue>,
    controller: Arc<InterruptionController>,
    output: Arc<dyn AudioOutput>,
    events_tx: mpsc::Sender<EngineEvent>,
    shutdown: Arc<Notify>,
) {
    loop {
        while let Some(chunk) = queue.pop() {
            if !controller.accepts(chunk.event_id) {
                debug!(
                    target: "Engine/Playback",
                    "Skipping stale chunk {} at schedule time", chunk.event_id
                );
                continue;
            }
            let done = output.schedule(chunk.samples);
            // An error here means the sink discarded the buffer (flush or
            // close); either way this chunk is finished.
            let _ = done.await;
        }
        if queue.take_drained_edge()
            && events_tx.send(EngineEvent::PlaybackDrained).await.is_err()
        {
            return;
        }
        tokio::select! {
            _ = queue.wait_refill() => {}
            _ = shutdown.notified() => return,
        }
    }
}

/// The polled meter feed: reports the latest capture level on a fixed
/// interval, independently of the per-frame feed.
async fn meter_poll_loop(
    shared: Arc<SharedState>,
    callbacks: Arc<dyn SessionCallbacks>,
    shutdown: Arc<Notify>,
) {
    let poll_meter = VolumeMeter::new();
    let mut tick = tokio::time::interval(meter::POLL_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let rms = f32::from_bits(shared.latest_rms.load(Ordering::Relaxed));
                callbacks.on_volume(poll_meter.update(rms));
            }
            _ = shutdown.notified() => return,
        }
    }
}
