use thiserror::Error;

/// Broad classes of failure, used by the orchestrator to decide what the
/// user sees and whether a partial turn survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or HTTP failure at the adapter boundary.
    Transport,
    /// Malformed chunk or tool-call argument payload.
    Protocol,
    /// User-initiated cancellation. Not a failure.
    Cancellation,
    /// A dispatched tool failed.
    ToolExecution,
    /// The session store rejected a write.
    Store,
    /// Misconfiguration or an operation issued in the wrong state.
    Usage,
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("API error: {message} (status: {status})")]
    Api { status: u16, message: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Tool error: {tool} - {message}")]
    Tool { tool: String, message: String },

    #[error("Session store error: {0}")]
    Store(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::RateLimit(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Api { .. }
            | Error::Auth(_)
            | Error::RateLimit(_)
            | Error::Network(_)
            | Error::Stream(_) => ErrorKind::Transport,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Tool { .. } => ErrorKind::ToolExecution,
            Error::Store(_) => ErrorKind::Store,
            Error::InvalidState(_) => ErrorKind::Usage,
            Error::Cancelled => ErrorKind::Cancellation,
        }
    }

    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}
