//! Transport layer: a thin trait over a text-frame WebSocket plus the
//! production tokio-tungstenite implementation.
//!
//! The factory returns the transport handle together with an event channel;
//! a spawned read pump feeds that channel until the socket closes, at which
//! point a final [`TransportEvent::Closed`] is emitted.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("websocket send failed: {0}")]
    Send(String),
    #[error("transport is closed")]
    Closed,
}

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A text frame from the server.
    Text(String),
    /// A binary frame. The protocol is text-only, so receiving one is a
    /// contract violation the consumer decides how to handle.
    Binary(Vec<u8>),
    /// The connection ended. `error` is set when it ended abnormally.
    Closed { error: Option<String> },
}

/// An active connection to the conversation service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a text frame. Failures are reported to the caller and never
    /// retried internally.
    async fn send(&self, text: &str) -> Result<(), TransportError>;

    /// Closes the connection with a normal-closure signal. Idempotent.
    async fn close(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), TransportError>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Production transport over tokio-tungstenite.
pub struct WebSocketTransport {
    ws_sink: Arc<Mutex<Option<WsSink>>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, text: &str) -> Result<(), TransportError> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard.as_mut().ok_or(TransportError::Closed)?;
        trace!(target: "Transport", "--> {} bytes", text.len());
        sink.send(Message::text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) {
        let mut sink_guard = self.ws_sink.lock().await;
        if let Some(mut sink) = sink_guard.take() {
            debug!(target: "Transport", "Closing websocket");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                })))
                .await;
        }
    }
}

/// Factory producing [`WebSocketTransport`] instances.
#[derive(Default)]
pub struct WebSocketTransportFactory;

impl WebSocketTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn create(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), TransportError> {
        info!(target: "Transport", "Dialing {url}");
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (sink, stream) = ws.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(read_pump(stream, event_tx));

        let transport = Arc::new(WebSocketTransport {
            ws_sink: Arc::new(Mutex::new(Some(sink))),
        });
        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    let error = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!(target: "Transport", "<-- {} bytes", text.len());
                if event_tx
                    .send(TransportEvent::Text(text.to_string()))
                    .await
                    .is_err()
                {
                    warn!(target: "Transport", "Event receiver dropped, closing read pump");
                    return;
                }
            }
            Some(Ok(Message::Binary(data))) => {
                if event_tx
                    .send(TransportEvent::Binary(data.to_vec()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(Ok(Message::Close(_))) => {
                trace!(target: "Transport", "Received close frame");
                break None;
            }
            // Protocol-level ping/pong is answered by tungstenite itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(target: "Transport", "Error reading from websocket: {e}");
                break Some(e.to_string());
            }
            None => {
                trace!(target: "Transport", "Websocket stream ended");
                break None;
            }
        }
    };
    let _ = event_tx.send(TransportEvent::Closed { error }).await;
}
