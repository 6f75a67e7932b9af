//! Session establishment: dial the transport, perform the one-shot
//! metadata handshake, and hand the live event stream to the engine.

use log::{debug, info};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::protocol::{self, InboundMessage, OutboundMessage};
use crate::transport::{Transport, TransportEvent, TransportFactory};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection closed before conversation metadata arrived")]
    ConnectionClosed,
    #[error("expected a text reply, got a binary frame")]
    BinaryReply,
    #[error("malformed metadata reply: {0}")]
    Malformed(String),
    #[error("expected conversation metadata, got '{0}'")]
    UnexpectedType(String),
}

/// An established session channel: the transport plus everything the
/// handshake negotiated.
pub struct SessionConnection {
    transport: Arc<dyn Transport>,
    conversation_id: String,
    output_sample_rate: u32,
    input_sample_rate: u32,
}

impl std::fmt::Debug for SessionConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConnection")
            .field("conversation_id", &self.conversation_id)
            .field("output_sample_rate", &self.output_sample_rate)
            .field("input_sample_rate", &self.input_sample_rate)
            .finish_non_exhaustive()
    }
}

impl SessionConnection {
    /// Opens the transport, sends exactly one init message, and blocks for
    /// exactly one reply. No timeout is imposed here; callers needing a
    /// bound must wrap this in one.
    ///
    /// On any failure after dialing, the transport is closed before the
    /// error is returned.
    pub async fn connect(
        config: &SessionConfig,
        factory: &dyn TransportFactory,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), SessionError> {
        let url = config.endpoint()?;
        let (transport, mut events) = factory.create(&url).await?;

        let init = OutboundMessage::InitHandshake {
            overrides: config.overrides.clone(),
            extra_body: config.extra_body.clone(),
        };
        debug!(target: "Connection", "--> init handshake");
        if let Err(e) = transport.send(&init.to_json()).await {
            transport.close().await;
            return Err(e.into());
        }

        let reply = loop {
            match events.recv().await {
                Some(TransportEvent::Text(text)) => break text,
                Some(TransportEvent::Binary(_)) => {
                    transport.close().await;
                    return Err(HandshakeError::BinaryReply.into());
                }
                Some(TransportEvent::Closed { .. }) | None => {
                    transport.close().await;
                    return Err(HandshakeError::ConnectionClosed.into());
                }
            }
        };

        let metadata = match InboundMessage::parse(&reply) {
            Ok(InboundMessage::ConversationMetadata(event)) => event,
            Ok(other) => {
                transport.close().await;
                return Err(HandshakeError::UnexpectedType(other.kind().to_string()).into());
            }
            Err(e) => {
                transport.close().await;
                return Err(HandshakeError::Malformed(e.to_string()).into());
            }
        };

        let output_sample_rate = protocol::parse_pcm_format(&metadata.agent_output_audio_format);
        let input_sample_rate = metadata
            .user_input_audio_format
            .as_deref()
            .map(protocol::parse_pcm_format)
            .unwrap_or(protocol::DEFAULT_SAMPLE_RATE);

        info!(
            target: "Connection",
            "Session established: conversation {}, output {} Hz, input {} Hz",
            metadata.conversation_id, output_sample_rate, input_sample_rate
        );

        Ok((
            Self {
                transport,
                conversation_id: metadata.conversation_id,
                output_sample_rate,
                input_sample_rate,
            },
            events,
        ))
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn output_sample_rate(&self) -> u32 {
        self.output_sample_rate
    }

    pub fn input_sample_rate(&self) -> u32 {
        self.input_sample_rate
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Closes the transport with a normal-closure signal. Idempotent.
    pub async fn close(&self) {
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::testutil::mock_transport;
    use serde_json::json;

    fn metadata_frame(id: &str, output_format: &str) -> String {
        json!({
            "type": "conversation_initiation_metadata",
            "conversation_initiation_metadata_event": {
                "conversation_id": id,
                "agent_output_audio_format": output_format,
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn handshake_negotiates_rates() {
        let (factory, mut server) = mock_transport();
        server.push_text(metadata_frame("conv_1", "pcm_22050")).await;

        let config = SessionConfig::for_agent("agent");
        let (connection, _events) = SessionConnection::connect(&config, &factory).await.unwrap();
        assert_eq!(connection.conversation_id(), "conv_1");
        assert_eq!(connection.output_sample_rate(), 22_050);
        assert_eq!(connection.input_sample_rate(), 16_000);

        // Exactly one init message was sent.
        let sent = server.next_sent().await.unwrap();
        assert_eq!(sent["type"], "conversation_initiation_client_data");
        assert!(server.try_next_sent().is_none());
    }

    #[tokio::test]
    async fn unparsable_format_tag_defaults_to_16k() {
        let (factory, server) = mock_transport();
        server.push_text(metadata_frame("conv_2", "opus_48000")).await;

        let config = SessionConfig::for_agent("agent");
        let (connection, _events) = SessionConnection::connect(&config, &factory).await.unwrap();
        assert_eq!(connection.output_sample_rate(), 16_000);
    }

    #[tokio::test]
    async fn binary_reply_fails_handshake() {
        let (factory, server) = mock_transport();
        server.push_binary(vec![0, 1, 2]).await;

        let config = SessionConfig::for_agent("agent");
        let err = SessionConnection::connect(&config, &factory).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Handshake(HandshakeError::BinaryReply)
        ));
    }

    #[tokio::test]
    async fn unexpected_first_message_fails_handshake() {
        let (factory, server) = mock_transport();
        server
            .push_text(json!({"type": "ping", "ping_event": {"event_id": 1}}).to_string())
            .await;

        let config = SessionConfig::for_agent("agent");
        let err = SessionConnection::connect(&config, &factory).await.unwrap_err();
        match err {
            SessionError::Handshake(HandshakeError::UnexpectedType(kind)) => {
                assert_eq!(kind, "ping")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_conversation_id_fails_handshake() {
        let (factory, server) = mock_transport();
        server
            .push_text(
                json!({
                    "type": "conversation_initiation_metadata",
                    "conversation_initiation_metadata_event": {
                        "agent_output_audio_format": "pcm_16000",
                    }
                })
                .to_string(),
            )
            .await;

        let config = SessionConfig::for_agent("agent");
        let err = SessionConnection::connect(&config, &factory).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Handshake(HandshakeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn closed_before_reply_fails_handshake() {
        let (factory, server) = mock_transport();
        server.push_closed(None).await;

        let config = SessionConfig::for_agent("agent");
        let err = SessionConnection::connect(&config, &factory).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Handshake(HandshakeError::ConnectionClosed)
        ));
    }
}
