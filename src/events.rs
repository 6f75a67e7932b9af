use std::fmt;

/// Connection lifecycle of a session.
///
/// `Disconnected` is terminal; it is reached through
/// [`Conversation::end_session`](crate::engine::Conversation::end_session)
/// (via `Disconnecting`) or directly on transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Whether the agent is currently audible. Orthogonal to [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Listening,
    Speaking,
}

/// Originator of a transcript line delivered through
/// [`SessionCallbacks::on_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Ai,
    User,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Disconnecting => "disconnecting",
            Status::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Listening => "listening",
            Mode::Speaking => "speaking",
        })
    }
}

/// Observer surface of a session. All methods default to no-ops; implement
/// the ones you care about.
///
/// Callbacks are invoked from the engine's internal tasks and must not
/// block; hand work off to a channel if it is not trivial.
pub trait SessionCallbacks: Send + Sync + 'static {
    /// The session is established; `conversation_id` identifies it server-side.
    fn on_connect(&self, _conversation_id: &str) {}
    /// The session ended, either through `end_session` or transport failure.
    fn on_disconnect(&self) {}
    /// A transcript line from the agent (`Role::Ai`) or the user (`Role::User`).
    fn on_message(&self, _text: &str, _role: Role) {}
    /// A non-fatal in-session error, or the detail of a terminal transport failure.
    fn on_error(&self, _message: &str, _detail: Option<&str>) {}
    fn on_status_change(&self, _status: Status) {}
    fn on_mode_change(&self, _mode: Mode) {}
    /// Input loudness in `[0, 1]`. Fired per captured frame and again by a
    /// ~100ms poll; no ordering between the two feeds.
    fn on_volume(&self, _level: f32) {}
}

/// Callbacks implementation that ignores everything.
#[derive(Debug, Default)]
pub struct NoCallbacks;

impl SessionCallbacks for NoCallbacks {}
