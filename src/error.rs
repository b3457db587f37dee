use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Missing client secrets, endpoints or other operator-supplied settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authentication required for session `{0}`")]
    AuthenticationRequired(String),

    /// The pending authorization for a session is gone, usually after a restart.
    #[error("authorization flow not initialized for session `{0}`")]
    FlowLost(String),

    #[error("tool `{name}` failed: {message}")]
    TransientTool { name: String, message: String },

    /// The tool ran and reported a failure of its own; repeating it will not help.
    #[error("tool `{name}` rejected the call: {message}")]
    ToolRejected { name: String, message: String },

    #[error("tool `{0}` not found")]
    ToolNotFound(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("mcp error: {0}")]
    Mcp(String),

    /// The MCP server no longer knows the `Mcp-Session-Id` we sent.
    #[error("mcp session `{0}` expired")]
    McpSessionExpired(String),

    #[error("language model error: {0}")]
    LanguageModel(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl AgentError {
    /// Whether a caller can recover by re-authorizing, retrying or restarting the flow.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, AgentError::Configuration(_) | AgentError::Storage(_))
    }

    /// Whether the same call may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AgentError::ToolRejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_fatal() {
        assert!(!AgentError::Configuration("no secret".into()).is_recoverable());
        assert!(AgentError::AuthenticationRequired("s1".into()).is_recoverable());
        assert!(AgentError::FlowLost("s1".into()).is_recoverable());
        assert!(AgentError::TransientTool {
            name: "list_events".into(),
            message: "timeout".into(),
        }
        .is_recoverable());
    }

    #[test]
    fn rejected_tools_are_not_retried() {
        let rejected = AgentError::ToolRejected {
            name: "create_event".into(),
            message: "calendar is read-only".into(),
        };
        assert!(!rejected.is_retryable());
        assert!(rejected.is_recoverable());
        assert!(AgentError::Mcp("reset".into()).is_retryable());
    }

    #[test]
    fn flow_lost_message_names_the_session() {
        let err = AgentError::FlowLost("abc".into());
        assert_eq!(
            err.to_string(),
            "authorization flow not initialized for session `abc`"
        );
    }
}
