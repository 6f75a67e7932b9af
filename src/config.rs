use serde_json::Value;
use thiserror::Error;

/// Default WebSocket origin of the hosted conversation service. Override with
/// [`SessionConfig::origin`] for self-hosted or regional deployments.
pub const DEFAULT_ORIGIN: &str = "wss://api.convai.dev";

const CONVERSATION_PATH: &str = "/v1/conversation";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("either an agent id or a session url is required")]
    MissingIdentity,
    #[error("agent id must not be empty")]
    EmptyAgentId,
    #[error("session url must use a ws:// or wss:// scheme, got '{0}'")]
    InvalidUrl(String),
}

/// Identity and handshake options for one conversation session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Agent to converse with. Ignored when `url` is set.
    pub agent_id: Option<String>,
    /// Pre-built (e.g. server-signed) session URL, used verbatim.
    pub url: Option<String>,
    /// WebSocket origin used together with `agent_id`. Defaults to
    /// [`DEFAULT_ORIGIN`].
    pub origin: Option<String>,
    /// Server-side conversation config overrides, sent with the init message.
    pub overrides: Option<Value>,
    /// Extension body forwarded verbatim to the agent's language model.
    pub extra_body: Option<Value>,
}

impl SessionConfig {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Self::default()
        }
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Resolve the WebSocket endpoint for this session.
    pub fn endpoint(&self) -> Result<String, ConfigError> {
        if let Some(url) = &self.url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::InvalidUrl(url.clone()));
            }
            return Ok(url.clone());
        }
        let agent_id = self.agent_id.as_ref().ok_or(ConfigError::MissingIdentity)?;
        if agent_id.is_empty() {
            return Err(ConfigError::EmptyAgentId);
        }
        let origin = self.origin.as_deref().unwrap_or(DEFAULT_ORIGIN);
        Ok(format!(
            "{origin}{CONVERSATION_PATH}?agent_id={}",
            urlencoding::encode(agent_id)
        ))
    }
}
