pub mod audio;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod interrupt;
pub mod protocol;
pub mod transport;

// Test doubles (mock transport and audio devices). Always compiled so that
// downstream crates can drive a full session from their own tests.
pub mod testutil;

pub use config::SessionConfig;
pub use engine::{Conversation, Platform};
pub use error::SessionError;
pub use events::{Mode, Role, SessionCallbacks, Status};
