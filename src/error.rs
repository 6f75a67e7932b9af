use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::connection::HandshakeError;
pub use crate::transport::TransportError;

/// An inbound message or audio payload that could not be decoded.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unrecognized message type '{0}'")]
    UnknownType(String),
    #[error("undecodable audio payload: {0}")]
    Audio(String),
}

/// Failure to acquire or drive a capture/render device.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("no capture device available")]
    NoInputDevice,
    #[error("no render device available")]
    NoOutputDevice,
    #[error("no supported device configuration")]
    NoSupportedConfig,
    #[error("audio device error: {0}")]
    Device(String),
    #[error("audio stream error: {0}")]
    Stream(String),
}

/// Top-level error for session startup and teardown paths.
///
/// In-session protocol errors never surface here; they are reported through
/// the [`SessionCallbacks::on_error`](crate::events::SessionCallbacks::on_error)
/// callback and dispatch continues.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("format error: {0}")]
    Format(#[from] FormatError),
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),
}
