//! Wire protocol: JSON text frames exchanged with the conversation service.
//!
//! Every frame is a self-describing object carrying a `type` tag. Inbound
//! frames are dispatched on that tag; unrecognized tags are surfaced as
//! [`InboundMessage::Unknown`] so the caller can report and move on.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::FormatError;

/// Fallback rate when an audio format tag is missing or unparsable.
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataEvent {
    pub conversation_id: String,
    pub agent_output_audio_format: String,
    #[serde(default)]
    pub user_input_audio_format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioEvent {
    pub audio_base_64: String,
    pub event_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct InterruptionEvent {
    event_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct AgentResponseEvent {
    agent_response: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UserTranscriptionEvent {
    user_transcript: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PingEvent {
    event_id: u64,
    #[serde(default)]
    ping_ms: Option<u64>,
}

/// A parsed server-to-client frame.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// First (and only first) reply of a session.
    ConversationMetadata(MetadataEvent),
    Audio(AudioEvent),
    Interruption {
        event_id: u64,
    },
    AgentResponse {
        text: String,
    },
    UserTranscript {
        text: String,
    },
    Ping {
        event_id: u64,
        /// Advisory round-trip hint from the server; ignored.
        ping_ms: Option<u64>,
    },
    /// Diagnostic frames (tentative responses, VAD scores, turn
    /// probabilities). Received and intentionally dropped.
    InternalDiagnostic {
        kind: String,
    },
    Unknown {
        kind: String,
    },
}

impl InboundMessage {
    pub fn parse(raw: &str) -> Result<Self, FormatError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| FormatError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| FormatError::Malformed("missing 'type' tag".to_string()))?;

        match kind {
            "conversation_initiation_metadata" => {
                let event: MetadataEvent =
                    payload(&value, "conversation_initiation_metadata_event")?;
                Ok(Self::ConversationMetadata(event))
            }
            "audio" => {
                let event: AudioEvent = payload(&value, "audio_event")?;
                Ok(Self::Audio(event))
            }
            "interruption" => {
                let event: InterruptionEvent = payload(&value, "interruption_event")?;
                Ok(Self::Interruption {
                    event_id: event.event_id,
                })
            }
            "agent_response" => {
                let event: AgentResponseEvent = payload(&value, "agent_response_event")?;
                Ok(Self::AgentResponse {
                    text: event.agent_response,
                })
            }
            "user_transcript" => {
                let event: UserTranscriptionEvent = payload(&value, "user_transcription_event")?;
                Ok(Self::UserTranscript {
                    text: event.user_transcript,
                })
            }
            "ping" => {
                let event: PingEvent = payload(&value, "ping_event")?;
                Ok(Self::Ping {
                    event_id: event.event_id,
                    ping_ms: event.ping_ms,
                })
            }
            "internal_tentative_agent_response"
            | "internal_vad_score"
            | "internal_turn_probability" => Ok(Self::InternalDiagnostic {
                kind: kind.to_string(),
            }),
            other => Ok(Self::Unknown {
                kind: other.to_string(),
            }),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::ConversationMetadata(_) => "conversation_initiation_metadata",
            Self::Audio(_) => "audio",
            Self::Interruption { .. } => "interruption",
            Self::AgentResponse { .. } => "agent_response",
            Self::UserTranscript { .. } => "user_transcript",
            Self::Ping { .. } => "ping",
            Self::InternalDiagnostic { kind } | Self::Unknown { kind } => kind,
        }
    }
}

fn payload<T: DeserializeOwned>(value: &Value, key: &str) -> Result<T, FormatError> {
    let inner = value
        .get(key)
        .ok_or_else(|| FormatError::Malformed(format!("missing '{key}' payload")))?;
    serde_json::from_value(inner.clone())
        .map_err(|e| FormatError::Malformed(format!("bad '{key}' payload: {e}")))
}

/// A client-to-server frame.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    InitHandshake {
        overrides: Option<Value>,
        extra_body: Option<Value>,
    },
    UserAudioChunk {
        /// base64 PCM16LE mono samples.
        audio: String,
    },
    Pong {
        event_id: u64,
    },
}

impl OutboundMessage {
    pub fn to_json(&self) -> String {
        match self {
            Self::InitHandshake {
                overrides,
                extra_body,
            } => {
                let mut frame = json!({ "type": "conversation_initiation_client_data" });
                if let Some(overrides) = overrides {
                    frame["conversation_config_override"] = overrides.clone();
                }
                if let Some(extra_body) = extra_body {
                    frame["custom_llm_extra_body"] = extra_body.clone();
                }
                frame.to_string()
            }
            Self::UserAudioChunk { audio } => json!({ "user_audio_chunk": audio }).to_string(),
            Self::Pong { event_id } => {
                json!({ "type": "pong", "event_id": event_id }).to_string()
            }
        }
    }
}

/// Encode PCM16 mono samples to the wire representation (little-endian
/// bytes, base64).
pub fn encode_pcm16(samples: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    BASE64.encode(bytes)
}

/// Decode a base64 PCM16LE payload back into samples.
pub fn decode_pcm16(payload: &str) -> Result<Vec<i16>, FormatError> {
    let bytes = BASE64
        .decode(payload)
        .map_err(|e| FormatError::Audio(e.to_string()))?;
    if bytes.len() % 2 != 0 {
        return Err(FormatError::Audio(format!(
            "odd payload length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Parse a `"pcm_<rate>"` audio format tag. Unparsable tags fall back to
/// [`DEFAULT_SAMPLE_RATE`]; the intent of such tags is ambiguous and the
/// original service documents 16 kHz as the default format.
pub fn parse_pcm_format(tag: &str) -> u32 {
    tag.strip_prefix("pcm_")
        .and_then(|rate| rate.parse().ok())
        .unwrap_or(DEFAULT_SAMPLE_RATE)
}
